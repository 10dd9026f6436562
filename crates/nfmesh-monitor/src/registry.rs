//! Per-UMEM bookkeeping, mutated only through a `Mutex` so "the control
//! plane serializes all mutations to per-UMEM state" (`spec.md` §4.F) is an
//! enforced invariant rather than, as in `flash_monitor.c`'s global `nfg`,
//! a single-threaded-by-convention one.

use std::collections::{BTreeSet, HashMap};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard};

use nfmesh_xsk::{Socket, Umem, UmemConfig};

/// Frames budgeted per attaching thread when sizing a UMEM's shared
/// region, matching `flash_nf.c`'s `XSK_RING_PROD__DEFAULT_NUM_DESCS * 2`.
pub const FRAMES_PER_THREAD: u64 = 2 * 2048;

/// One UMEM group's live state: the registered `Umem`, the memfd handed to
/// every attaching NF, and the sockets created so far (kept alive here,
/// not in the NF process, so the Monitor can explicitly close them on
/// detach rather than relying on the peer to do so).
pub struct UmemEntry {
    pub umem: Umem,
    memfd: OwnedFd,
    pub config: UmemConfig,
    pub total_sockets: u16,
    pub attached_nf: BTreeSet<u16>,
    sockets: HashMap<u16, Vec<Socket>>,
}

impl UmemEntry {
    pub fn new(umem: Umem, memfd: OwnedFd, config: UmemConfig, total_sockets: u16) -> Self {
        UmemEntry {
            umem,
            memfd,
            config,
            total_sockets,
            attached_nf: BTreeSet::new(),
            sockets: HashMap::new(),
        }
    }

    pub fn umem_size(&self) -> u64 {
        self.config.frame_size as u64 * self.total_sockets as u64 * FRAMES_PER_THREAD
    }

    pub fn memfd_raw(&self) -> RawFd {
        self.memfd.as_raw_fd()
    }

    pub fn push_socket(&mut self, nf_id: u16, socket: Socket) {
        self.sockets.entry(nf_id).or_default().push(socket);
    }

    /// Closes every socket fd this Monitor holds open on `nf_id`'s behalf.
    pub fn drop_nf_sockets(&mut self, nf_id: u16) {
        self.sockets.remove(&nf_id);
    }
}

#[derive(Default)]
pub struct UmemRegistry {
    inner: Mutex<HashMap<u16, UmemEntry>>,
}

impl UmemRegistry {
    pub fn new() -> Self {
        UmemRegistry::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, HashMap<u16, UmemEntry>> {
        self.inner.lock().expect("umem registry mutex poisoned")
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
