//! UMEM registration, the fill/completion queue pair, and socket binding.

use core::ptr::NonNull;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spin::RwLock;

use crate::iface::SocketMmapOffsets;
use crate::ring::{RingCons, RingProd};
use crate::socket::SocketFd;
use crate::xdp::{SockAddrXdp, XdpUmemReg};
use crate::{Errno, IfCtx, Socket, SOL_XDP};

pub(crate) const XDP_MMAP_OFFSETS: libc::c_int = 1;
const XDP_RX_RING: libc::c_int = 2;
const XDP_TX_RING: libc::c_int = 3;
const XDP_UMEM_REG: libc::c_int = 4;
const XDP_UMEM_FILL_RING: libc::c_int = 5;
const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;
pub(crate) const XDP_STATISTICS: libc::c_int = 7;

/// Sizes and flags used to register a `Umem` with the kernel.
#[derive(Debug, Copy, Clone)]
pub struct UmemConfig {
    pub fill_size: u32,
    pub complete_size: u32,
    pub frame_size: u32,
    pub headroom: u32,
    pub flags: u32,
}

impl Default for UmemConfig {
    fn default() -> Self {
        UmemConfig {
            fill_size: 1 << 11,
            complete_size: 1 << 11,
            frame_size: 1 << 12,
            headroom: 0,
            flags: 0,
        }
    }
}

/// Per-queue bind options, `rx_size`/`tx_size` decide which of the two
/// rings `RxTx::map_rx`/`map_tx` will later be able to map.
#[derive(Debug, Copy, Clone)]
pub struct SocketConfig {
    pub rx_size: Option<core::num::NonZeroU32>,
    pub tx_size: Option<core::num::NonZeroU32>,
    pub bind_flags: u32,
}

/// A registered UMEM: one page-locked buffer region shared with the kernel.
pub struct Umem {
    umem_area: NonNull<[u8]>,
    config: UmemConfig,
    pub(crate) fd: Arc<SocketFd>,
    devices: DeviceControl,
    refcount: Arc<AtomicUsize>,
}

// Safety: `umem_area` is a mapping the caller guarantees outlives the Umem
// and is never mutably aliased outside of documented kernel writes.
unsafe impl Send for Umem {}
unsafe impl Sync for Umem {}

impl Umem {
    /// Register a new Umem over `area`.
    ///
    /// # Safety
    ///
    /// `area` must denote memory valid for the configured frame size and
    /// count, page-aligned, and must outlive every queue created from this
    /// `Umem`.
    pub unsafe fn new(config: UmemConfig, area: NonNull<[u8]>) -> Result<Umem, Errno> {
        let page_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        debug_assert!(
            (area.as_ptr() as *mut u8 as usize) & (page_size - 1) == 0,
            "UB: umem area must be page aligned"
        );

        let umem = Umem {
            config,
            fd: Arc::new(SocketFd::new()?),
            umem_area: area,
            devices: DeviceControl::new(),
            refcount: Arc::new(AtomicUsize::new(0)),
        };
        umem.configure()?;
        log::debug!(
            "registered umem fd={} frame_size={} fill={} complete={}",
            umem.fd.as_raw_fd(),
            umem.config.frame_size,
            umem.config.fill_size,
            umem.config.complete_size
        );
        Ok(umem)
    }

    fn configure(&self) -> Result<(), Errno> {
        let reg = XdpUmemReg {
            addr: self.umem_area.as_ptr() as *mut u8 as u64,
            len: unsafe { (*self.umem_area.as_ptr()).len() } as u64,
            chunk_size: self.config.frame_size,
            headroom: self.config.headroom,
            flags: self.config.flags,
            tx_metadata_len: 0,
        };
        self.fd.set_opt(SOL_XDP, XDP_UMEM_REG, &reg)
    }

    pub(crate) fn fd_handle(&self) -> Arc<SocketFd> {
        self.fd.clone()
    }

    /// The raw fd this Umem registered its mapping on, suitable for
    /// `dup`-ing across a `SCM_RIGHTS` transfer to an attaching NF.
    pub fn as_raw_fd(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }

    pub(crate) fn refcount_handle(&self) -> Arc<AtomicUsize> {
        self.refcount.clone()
    }

    /// Number of sockets currently sharing this Umem's fill/completion pair
    /// (via [`Socket::with_shared`]).
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Resolve the address of one frame, for direct access to its packet
    /// data once owned (e.g. after a receive).
    ///
    /// # Safety
    ///
    /// The caller must not construct overlapping mutable accesses to the
    /// same frame from two threads at once.
    pub unsafe fn frame_bytes(&self, offset: u64) -> &mut [u8] {
        let base = self.umem_area.as_ptr() as *mut u8;
        let frame = base.add(offset as usize);
        core::slice::from_raw_parts_mut(frame, self.config.frame_size as usize)
    }

    /// Map the fill and completion queue pair for one socket's device
    /// queue. Must be called at most once per distinct `(ifindex, queue,
    /// netns)` triple sharing this Umem.
    pub fn fq_cq(&mut self, interface: &Socket) -> Result<DeviceQueue, Errno> {
        let ctx = interface.info().ctx;
        if !self.devices.insert(ctx) {
            return Err(Errno::from_raw(libc::EINVAL));
        }

        struct Rollback<'a>(IfCtx, &'a DeviceControl, bool);
        impl Drop for Rollback<'_> {
            fn drop(&mut self) {
                if !self.2 {
                    self.1.remove(&self.0);
                }
            }
        }
        let mut guard = Rollback(ctx, &self.devices, false);

        self.configure_cq()?;
        let map = SocketMmapOffsets::query(&interface.fd)?;

        let prod = unsafe { RingProd::fill(&interface.fd, &map, self.config.fill_size) }
            .map_err(Errno::from_raw)?;
        let cons = unsafe { RingCons::comp(&interface.fd, &map, self.config.complete_size) }
            .map_err(Errno::from_raw)?;

        guard.2 = true;

        Ok(DeviceQueue {
            fill: prod,
            completion: cons,
            fd: interface.fd.clone(),
            devices: self.devices.clone(),
            ctx,
        })
    }

    /// Bind a socket for receive/transmit against this Umem.
    pub fn bind(&mut self, interface: &Socket, config: &SocketConfig) -> Result<RxTx, Errno> {
        self.configure_rt(&interface.fd, config)?;
        let map = SocketMmapOffsets::query(&interface.fd)?;

        let sxdp = SockAddrXdp {
            ifindex: interface.info().ifindex(),
            queue_id: interface.info().queue_id(),
            flags: config.bind_flags as u16,
            ..SockAddrXdp::default()
        };

        let err = unsafe {
            libc::bind(
                interface.as_raw_fd(),
                (&sxdp) as *const _ as *const libc::sockaddr,
                core::mem::size_of_val(&sxdp) as libc::socklen_t,
            )
        };
        if err != 0 {
            return Err(Errno::new());
        }

        Ok(RxTx {
            fd: interface.fd.clone(),
            config: *config,
            map,
        })
    }

    fn configure_cq(&self) -> Result<(), Errno> {
        self.fd.set_opt(SOL_XDP, XDP_UMEM_COMPLETION_RING, &self.config.complete_size)?;
        self.fd.set_opt(SOL_XDP, XDP_UMEM_FILL_RING, &self.config.fill_size)?;
        Ok(())
    }

    fn configure_rt(&self, fd: &SocketFd, config: &SocketConfig) -> Result<(), Errno> {
        if let Some(num) = config.rx_size {
            fd.set_opt(SOL_XDP, XDP_RX_RING, &num.get())?;
        }
        if let Some(num) = config.tx_size {
            fd.set_opt(SOL_XDP, XDP_TX_RING, &num.get())?;
        }
        Ok(())
    }
}

/// Reconstruct the fill/completion pair for a socket fd this process did
/// not bind itself (received over `SCM_RIGHTS` from the Monitor, which
/// already bound and registered it). Queries the mmap offsets fresh rather
/// than re-running `fq_cq`'s `XDP_UMEM_FILL_RING`/`XDP_UMEM_COMPLETION_RING`
/// setup, matching `flash_nf.c`'s `xsk_mmap_umem_rings`.
pub(crate) fn device_queue_from_fd(
    fd: Arc<SocketFd>,
    fill_size: u32,
    complete_size: u32,
) -> Result<DeviceQueue, Errno> {
    let map = SocketMmapOffsets::query(&fd)?;
    let prod = unsafe { RingProd::fill(&fd, &map, fill_size) }.map_err(Errno::from_raw)?;
    let cons = unsafe { RingCons::comp(&fd, &map, complete_size) }.map_err(Errno::from_raw)?;
    Ok(DeviceQueue {
        fill: prod,
        completion: cons,
        fd,
        devices: DeviceControl::new(),
        ctx: IfCtx::default(),
    })
}

/// Reconstruct the rx/tx mapping view for a received socket fd, the
/// remote-fd counterpart of [`Umem::bind`].
pub(crate) fn rxtx_from_fd(fd: Arc<SocketFd>, config: SocketConfig) -> Result<RxTx, Errno> {
    let map = SocketMmapOffsets::query(&fd)?;
    Ok(RxTx { fd, config, map })
}

/// The fill/completion queue pair for one device (network interface +
/// queue), owned by whichever socket first called [`Umem::fq_cq`] for it.
pub struct DeviceQueue {
    pub(crate) fill: RingProd,
    pub(crate) completion: RingCons,
    pub(crate) fd: Arc<SocketFd>,
    devices: DeviceControl,
    ctx: IfCtx,
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.devices.remove(&self.ctx);
    }
}

/// A bound-but-not-yet-mapped rx/tx pair, matching the `rx_size`/`tx_size`
/// requested at bind time.
pub struct RxTx {
    pub(crate) fd: Arc<SocketFd>,
    config: SocketConfig,
    pub(crate) map: SocketMmapOffsets,
}

impl RxTx {
    pub fn map_rx(&self) -> Result<crate::user::RxRing, Errno> {
        let size = self.config.rx_size.ok_or_else(|| Errno::from_raw(libc::EINVAL))?;
        let ring = unsafe { RingCons::rx(&self.fd, &self.map, size.get()) }.map_err(Errno::from_raw)?;
        Ok(crate::user::RxRing::new(ring, self.fd.clone()))
    }

    pub fn map_tx(&self) -> Result<crate::user::TxRing, Errno> {
        let size = self.config.tx_size.ok_or_else(|| Errno::from_raw(libc::EINVAL))?;
        let ring = unsafe { RingProd::tx(&self.fd, &self.map, size.get()) }.map_err(Errno::from_raw)?;
        Ok(crate::user::TxRing::new(ring, self.fd.clone()))
    }

    pub fn as_raw_fd(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }
}

/// Tracks which `(ifindex, queue, netns)` triples currently have a
/// fill/completion queue mapped, so a second attempt is rejected instead of
/// silently racing the kernel's own bookkeeping.
#[derive(Clone)]
pub(crate) struct DeviceControl {
    inner: Arc<dyn ControlSet>,
}

pub(crate) trait ControlSet: Send + Sync {
    fn insert(&self, ctx: IfCtx) -> bool;
    fn remove(&self, ctx: &IfCtx);
}

impl DeviceControl {
    fn new() -> Self {
        DeviceControl { inner: Arc::new(SpinLockedControlSet::default()) }
    }

    fn insert(&self, ctx: IfCtx) -> bool {
        self.inner.insert(ctx)
    }

    fn remove(&self, ctx: &IfCtx) {
        self.inner.remove(ctx)
    }
}

#[derive(Default)]
struct SpinLockedControlSet {
    inner: RwLock<BTreeSet<IfCtx>>,
}

impl ControlSet for SpinLockedControlSet {
    fn insert(&self, ctx: IfCtx) -> bool {
        self.inner.write().insert(ctx)
    }

    fn remove(&self, ctx: &IfCtx) {
        self.inner.write().remove(ctx);
    }
}
