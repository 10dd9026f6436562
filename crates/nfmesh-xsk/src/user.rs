//! Batch reserve/peek views over the four rings, as RAII guards that roll
//! unused slots back and submit/release only what was actually touched.

use std::sync::Arc;

use crate::ring::{RingCons, RingProd};
use crate::socket::SocketFd;
use crate::umem::DeviceQueue;
use crate::xdp::XdpDesc;
use crate::{BufIdx, Errno};

const XDP_RING_NEED_WAKEUP: u32 = 1 << 0;

impl DeviceQueue {
    /// Reserve up to `nb` fill ring slots to populate with frame addresses.
    pub fn fill(&mut self, nb: u32) -> WriteFill<'_> {
        WriteFill::new(&mut self.fill, nb)
    }

    /// Peek up to `nb` completed frame addresses.
    pub fn complete(&mut self, nb: u32) -> ReadComplete<'_> {
        ReadComplete::new(&mut self.completion, nb)
    }

    pub fn available(&mut self, nb: u32) -> u32 {
        self.completion.count_available(nb)
    }

    pub fn pending(&mut self, nb: u32) -> u32 {
        self.fill.count_free(nb)
    }

    pub fn as_raw_fd(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }

    /// Whether the kernel asked for a `recvfrom`/poll kick before it will
    /// drain the fill ring (driver busy-polling this NIC's fill queue).
    pub fn needs_wakeup(&self) -> bool {
        self.fill.check_flags() & XDP_RING_NEED_WAKEUP != 0
    }

    pub fn wake(&self) -> Result<(), Errno> {
        wake_rx(&self.fd)
    }

    /// Kernel-maintained drop/invalid-descriptor counters for this socket
    /// (`getsockopt(SOL_XDP, XDP_STATISTICS)`), used by the stats printer.
    pub fn driver_stats(&self) -> Result<crate::xdp::XdpStatisticsV2, Errno> {
        crate::iface::query_statistics_v2(&self.fd)
    }
}

/// A receive ring mapped for one socket.
pub struct RxRing {
    inner: RingCons,
    fd: Arc<SocketFd>,
}

impl RxRing {
    pub(crate) fn new(inner: RingCons, fd: Arc<SocketFd>) -> Self {
        RxRing { inner, fd }
    }

    pub fn receive(&mut self, nb: u32) -> ReadRx<'_> {
        ReadRx::new(&mut self.inner, nb)
    }

    pub fn pending(&mut self, nb: u32) -> u32 {
        self.inner.count_available(nb)
    }

    pub fn as_raw_fd(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }
}

/// A transmit ring mapped for one socket.
pub struct TxRing {
    inner: RingProd,
    fd: Arc<SocketFd>,
}

impl TxRing {
    pub(crate) fn new(inner: RingProd, fd: Arc<SocketFd>) -> Self {
        TxRing { inner, fd }
    }

    pub fn transmit(&mut self, nb: u32) -> WriteTx<'_> {
        WriteTx::new(&mut self.inner, nb)
    }

    pub fn pending(&mut self, nb: u32) -> u32 {
        self.inner.count_free(nb)
    }

    pub fn needs_wakeup(&self) -> bool {
        self.inner.check_flags() & XDP_RING_NEED_WAKEUP != 0
    }

    pub fn wake(&self) -> Result<(), Errno> {
        wake_tx(&self.fd)
    }

    pub fn as_raw_fd(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }
}

/// Kick the kernel into draining the fill/rx side, used when
/// `needs_wakeup()` is set for a socket in `XDP_USE_NEED_WAKEUP` mode.
fn wake_rx(fd: &SocketFd) -> Result<(), Errno> {
    let err = unsafe { libc::recvfrom(fd.as_raw_fd(), core::ptr::null_mut(), 0, libc::MSG_DONTWAIT, core::ptr::null_mut(), core::ptr::null_mut()) };
    if err < 0 {
        let errno = unsafe { *libc::__errno_location() };
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
            return Ok(());
        }
        return Err(Errno::new());
    }
    Ok(())
}

/// Kick the kernel into draining the tx side.
fn wake_tx(fd: &SocketFd) -> Result<(), Errno> {
    let err = unsafe { libc::sendto(fd.as_raw_fd(), core::ptr::null(), 0, libc::MSG_DONTWAIT, core::ptr::null(), 0) };
    if err < 0 {
        let errno = unsafe { *libc::__errno_location() };
        if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::ENOBUFS {
            return Ok(());
        }
        return Err(Errno::new());
    }
    Ok(())
}

/// Reserved fill ring entries, writable frame addresses. Unwritten slots are
/// returned to the ring on drop; written ones are submitted.
pub struct WriteFill<'a> {
    ring: &'a mut RingProd,
    base: BufIdx,
    count: u32,
    next: u32,
}

impl<'a> WriteFill<'a> {
    fn new(ring: &'a mut RingProd, nb: u32) -> Self {
        let mut base = BufIdx::default();
        let count = ring.reserve(nb, &mut base);
        WriteFill { ring, base, count, next: 0 }
    }

    pub fn len(&self) -> u32 {
        self.count - self.next
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the next reserved slot's frame address; `false` once exhausted.
    pub fn insert(&mut self, addr: u64) -> bool {
        if self.next >= self.count {
            return false;
        }
        let idx = BufIdx(self.base.0.wrapping_add(self.next));
        unsafe { self.ring.fill_addr(idx).as_ptr().write(addr) };
        self.next += 1;
        true
    }
}

impl Drop for WriteFill<'_> {
    fn drop(&mut self) {
        if self.next < self.count {
            self.ring.cancel(self.count - self.next);
        }
        if self.next > 0 {
            self.ring.submit(self.next);
        }
    }
}

/// Peeked completion ring entries, readable freed frame addresses.
pub struct ReadComplete<'a> {
    ring: &'a mut RingCons,
    base: BufIdx,
    count: u32,
    next: u32,
}

impl<'a> ReadComplete<'a> {
    fn new(ring: &'a mut RingCons, nb: u32) -> Self {
        let mut base = BufIdx::default();
        let count = ring.peek(nb, &mut base);
        ReadComplete { ring, base, count, next: 0 }
    }

    pub fn len(&self) -> u32 {
        self.count - self.next
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&mut self) -> Option<u64> {
        if self.next >= self.count {
            return None;
        }
        let idx = BufIdx(self.base.0.wrapping_add(self.next));
        let addr = unsafe { self.ring.comp_addr(idx).as_ptr().read() };
        self.next += 1;
        Some(addr)
    }
}

impl Drop for ReadComplete<'_> {
    fn drop(&mut self) {
        if self.next < self.count {
            self.ring.cancel(self.count - self.next);
        }
        if self.next > 0 {
            self.ring.release(self.next);
        }
    }
}

/// Reserved tx ring entries, writable descriptors.
pub struct WriteTx<'a> {
    ring: &'a mut RingProd,
    base: BufIdx,
    count: u32,
    next: u32,
}

impl<'a> WriteTx<'a> {
    fn new(ring: &'a mut RingProd, nb: u32) -> Self {
        let mut base = BufIdx::default();
        let count = ring.reserve(nb, &mut base);
        WriteTx { ring, base, count, next: 0 }
    }

    pub fn len(&self) -> u32 {
        self.count - self.next
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&mut self, desc: XdpDesc) -> bool {
        if self.next >= self.count {
            return false;
        }
        let idx = BufIdx(self.base.0.wrapping_add(self.next));
        unsafe { self.ring.tx_desc(idx).as_ptr().write(desc) };
        self.next += 1;
        true
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        if self.next < self.count {
            self.ring.cancel(self.count - self.next);
        }
        if self.next > 0 {
            self.ring.submit(self.next);
        }
    }
}

/// Peeked rx ring entries, readable descriptors.
pub struct ReadRx<'a> {
    ring: &'a mut RingCons,
    base: BufIdx,
    count: u32,
    next: u32,
}

impl<'a> ReadRx<'a> {
    fn new(ring: &'a mut RingCons, nb: u32) -> Self {
        let mut base = BufIdx::default();
        let count = ring.peek(nb, &mut base);
        ReadRx { ring, base, count, next: 0 }
    }

    pub fn len(&self) -> u32 {
        self.count - self.next
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&mut self) -> Option<XdpDesc> {
        if self.next >= self.count {
            return None;
        }
        let idx = BufIdx(self.base.0.wrapping_add(self.next));
        let desc = unsafe { self.ring.rx_desc(idx).as_ptr().read() };
        self.next += 1;
        Some(desc)
    }
}

impl Drop for ReadRx<'_> {
    fn drop(&mut self) {
        if self.next < self.count {
            self.ring.cancel(self.count - self.next);
        }
        if self.next > 0 {
            self.ring.release(self.next);
        }
    }
}
