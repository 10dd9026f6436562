//! Reconstructing ring mappings for a socket fd received over IPC instead
//! of created in this process, grounded on `flash_nf.c`'s
//! `xsk_mmap_umem_rings`: the Monitor already ran `XDP_UMEM_REG` and
//! `bind()` on the fd before handing it over, so this side only queries
//! the mmap offsets and maps them.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::socket::SocketFd;
use crate::umem::{device_queue_from_fd, rxtx_from_fd, DeviceQueue, RxTx, SocketConfig};
use crate::Errno;

/// An AF_XDP socket fd this process received via `SCM_RIGHTS`, already
/// registered and bound by the Monitor.
pub struct RemoteSocket {
    fd: Arc<SocketFd>,
}

impl RemoteSocket {
    /// # Safety
    /// `fd` must be a valid, open AF_XDP socket this process now owns
    /// exclusively (e.g. one just returned by [`nfmesh_ipc::Channel::recv_fd`]).
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        RemoteSocket { fd: Arc::new(SocketFd::from_raw_fd(fd)) }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Map this socket's fill/completion pair. Valid once per socket, since
    /// each is bound to its own distinct `(ifindex, queue_id, netns)`.
    pub fn fill_completion(&self, fill_size: u32, complete_size: u32) -> Result<DeviceQueue, Errno> {
        device_queue_from_fd(self.fd.clone(), fill_size, complete_size)
    }

    pub fn rx_tx(&self, config: SocketConfig) -> Result<RxTx, Errno> {
        rxtx_from_fd(self.fd.clone(), config)
    }
}
