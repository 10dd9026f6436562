//! FILL/COMPLETION/RX/TX ring mechanics shared by all four kernel queues.
//!
//! Producer and consumer each cache the peer's cursor and only refresh it
//! from the atomic when their own local bookkeeping says the ring might be
//! full/empty, the same discipline `libxdp` uses and that this module is
//! ported from.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::xdp::{XdpDesc, XdpRingOffsets};
use crate::{BufIdx, SocketFd, SocketMmapOffsets};

/// Shared bookkeeping for one mmap'd ring.
#[derive(Debug)]
pub(crate) struct Ring {
    cached_producer: u32,
    cached_consumer: u32,
    mask: u32,
    size: u32,
    producer: &'static AtomicU32,
    consumer: &'static AtomicU32,
    ring: NonNull<core::ffi::c_void>,
    #[allow(dead_code)]
    flags: NonNull<u32>,
}

const XDP_PGOFF_RX_RING: libc::off_t = 0;
const XDP_PGOFF_TX_RING: libc::off_t = 0x80000000;
const XDP_UMEM_PGOFF_FILL_RING: libc::off_t = 0x100000000;
const XDP_UMEM_PGOFF_COMPLETION_RING: libc::off_t = 0x180000000;

impl Ring {
    /// Construct a ring from a kernel-provided mmap.
    ///
    /// # Safety
    ///
    /// `tx_map` must point into a live mapping of at least `off.desc +
    /// count * size_of_entry` bytes, and that mapping must outlive this
    /// `Ring`.
    unsafe fn new(tx_map: NonNull<u8>, off: &XdpRingOffsets, count: u32) -> Self {
        debug_assert!(count.is_power_of_two());
        let base: *mut u8 = tx_map.as_ptr();
        let trust_offset = |o: u64| NonNull::new_unchecked(base.offset(o as isize));

        let producer = trust_offset(off.producer).cast().as_ref();
        let consumer = trust_offset(off.consumer).cast().as_ref();
        let ring = trust_offset(off.desc).cast();
        let flags = trust_offset(off.flags).cast();

        Ring {
            mask: count - 1,
            size: count,
            producer,
            consumer,
            ring,
            flags,
            cached_producer: producer.load(Ordering::Relaxed),
            cached_consumer: consumer.load(Ordering::Relaxed),
        }
    }

    unsafe fn map(
        fd: &SocketFd,
        off: &XdpRingOffsets,
        count: u32,
        entry_size: u64,
        offset: libc::off_t,
    ) -> Result<(Self, NonNull<[u8]>), libc::c_int> {
        let len = (off.desc + u64::from(count) * entry_size) as usize;

        let mmap = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd.as_raw_fd(),
            offset,
        );

        if mmap == libc::MAP_FAILED {
            return Err(*libc::__errno_location());
        }

        let mmap_addr = core::ptr::slice_from_raw_parts_mut(mmap as *mut u8, len);
        let mmap_addr = NonNull::new_unchecked(mmap_addr);
        let nn = mmap_addr.cast();

        Ok((Ring::new(nn, off, count), mmap_addr))
    }
}

/// A producer ring: user space maintains the write head, the kernel the read tail.
#[derive(Debug)]
pub struct RingProd {
    pub(crate) inner: Ring,
    mmap_addr: NonNull<[u8]>,
}

/// A consumer ring: kernel maintains the write head, user space the read tail.
#[derive(Debug)]
pub struct RingCons {
    pub(crate) inner: Ring,
    mmap_addr: NonNull<[u8]>,
}

// Safety: the contained raw pointers only ever address the mmap'd ring
// memory and the atomics used for synchronization are genuinely shared.
unsafe impl Send for RingProd {}
unsafe impl Send for RingCons {}

impl RingProd {
    pub(crate) unsafe fn fill(fd: &SocketFd, off: &SocketMmapOffsets, count: u32) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = Ring::map(fd, &off.inner.fr, count, core::mem::size_of::<u64>() as u64, XDP_UMEM_PGOFF_FILL_RING)?;
        Ok(RingProd { inner, mmap_addr })
    }

    pub(crate) unsafe fn tx(fd: &SocketFd, off: &SocketMmapOffsets, count: u32) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = Ring::map(fd, &off.inner.tx, count, core::mem::size_of::<XdpDesc>() as u64, XDP_PGOFF_TX_RING)?;
        Ok(RingProd { inner, mmap_addr })
    }

    pub(crate) unsafe fn fill_addr(&self, idx: BufIdx) -> NonNull<u64> {
        let offset = (idx.0 & self.inner.mask) as isize;
        NonNull::new_unchecked(self.inner.ring.cast::<u64>().as_ptr().offset(offset))
    }

    pub(crate) unsafe fn tx_desc(&self, idx: BufIdx) -> NonNull<XdpDesc> {
        let offset = (idx.0 & self.inner.mask) as isize;
        NonNull::new_unchecked(self.inner.ring.cast::<XdpDesc>().as_ptr().offset(offset))
    }

    /// Up to `nb` free entries, refreshing the cached consumer head only
    /// when the cheap local estimate says there isn't enough room.
    pub fn count_free(&mut self, nb: u32) -> u32 {
        let free_entries = self.inner.cached_consumer.wrapping_sub(self.inner.cached_producer);
        if free_entries >= nb {
            return free_entries;
        }
        self.inner.cached_consumer = self.inner.consumer.load(Ordering::Acquire);
        self.inner.cached_consumer += self.inner.size;
        self.inner.cached_consumer - self.inner.cached_producer
    }

    pub fn reserve(&mut self, nb: u32, idx: &mut BufIdx) -> u32 {
        if self.count_free(nb) < nb {
            return 0;
        }
        *idx = BufIdx(self.inner.cached_producer);
        self.inner.cached_producer += nb;
        nb
    }

    pub fn cancel(&mut self, nb: u32) {
        self.inner.cached_producer -= nb;
    }

    pub fn submit(&mut self, nb: u32) {
        let cur = self.inner.producer.load(Ordering::Relaxed);
        self.inner.producer.store(cur.wrapping_add(nb), Ordering::Release);
    }

    pub fn check_flags(&self) -> u32 {
        unsafe { self.inner.flags.as_ptr().read() }
    }
}

impl RingCons {
    pub(crate) unsafe fn comp(fd: &SocketFd, off: &SocketMmapOffsets, count: u32) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = Ring::map(fd, &off.inner.cr, count, core::mem::size_of::<u64>() as u64, XDP_UMEM_PGOFF_COMPLETION_RING)?;
        Ok(RingCons { inner, mmap_addr })
    }

    pub(crate) unsafe fn rx(fd: &SocketFd, off: &SocketMmapOffsets, count: u32) -> Result<Self, libc::c_int> {
        let (inner, mmap_addr) = Ring::map(fd, &off.inner.rx, count, core::mem::size_of::<XdpDesc>() as u64, XDP_PGOFF_RX_RING)?;
        Ok(RingCons { inner, mmap_addr })
    }

    pub(crate) unsafe fn comp_addr(&self, idx: BufIdx) -> NonNull<u64> {
        let offset = (idx.0 & self.inner.mask) as isize;
        NonNull::new_unchecked(self.inner.ring.cast::<u64>().as_ptr().offset(offset))
    }

    pub(crate) unsafe fn rx_desc(&self, idx: BufIdx) -> NonNull<XdpDesc> {
        let offset = (idx.0 & self.inner.mask) as isize;
        NonNull::new_unchecked(self.inner.ring.cast::<XdpDesc>().as_ptr().offset(offset))
    }

    pub fn count_available(&mut self, nb: u32) -> u32 {
        let mut available = self.inner.cached_producer.wrapping_sub(self.inner.cached_consumer);
        if available == 0 {
            self.inner.cached_producer = self.inner.producer.load(Ordering::Acquire);
            available = self.inner.cached_producer.wrapping_sub(self.inner.cached_consumer);
        }
        available.min(nb)
    }

    pub fn peek(&mut self, nb: u32, idx: &mut BufIdx) -> u32 {
        let count = self.count_available(nb);
        if count == 0 {
            return 0;
        }
        *idx = BufIdx(self.inner.cached_consumer);
        self.inner.cached_consumer += count;
        count
    }

    pub fn cancel(&mut self, nb: u32) {
        self.inner.cached_consumer -= nb;
    }

    pub fn release(&mut self, nb: u32) {
        let cur = self.inner.consumer.load(Ordering::Relaxed);
        self.inner.consumer.store(cur.wrapping_add(nb), Ordering::Release);
    }
}

fn ptr_len(p: *mut [u8]) -> usize {
    unsafe { (*p).len() }
}

impl Drop for RingProd {
    fn drop(&mut self) {
        let len = ptr_len(self.mmap_addr.as_ptr());
        unsafe { libc::munmap(self.mmap_addr.as_ptr() as *mut _, len) };
    }
}

impl Drop for RingCons {
    fn drop(&mut self) {
        let len = ptr_len(self.mmap_addr.as_ptr());
        unsafe { libc::munmap(self.mmap_addr.as_ptr() as *mut _, len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xdp::XdpRingOffsets;

    /// Lay out a synthetic ring in a plain heap buffer, mimicking the
    /// layout the kernel's mmap would produce, to exercise the
    /// reserve/submit/peek/release arithmetic without a real socket.
    struct FakeRing {
        _buf: Box<[u8]>,
        offsets: XdpRingOffsets,
        ptr: NonNull<u8>,
    }

    fn fake_ring(count: u32) -> FakeRing {
        let entry = core::mem::size_of::<u64>() as u64;
        let desc_off = 64u64;
        let len = desc_off + u64::from(count) * entry;
        let mut buf = vec![0u8; len as usize].into_boxed_slice();
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        let offsets = XdpRingOffsets {
            producer: 0,
            consumer: 8,
            desc: desc_off,
            flags: 16,
        };
        FakeRing { _buf: buf, offsets, ptr }
    }

    #[test]
    fn reserve_then_submit_advances_producer_only_on_submit() {
        let fake = fake_ring(8);
        let inner = unsafe { Ring::new(fake.ptr, &fake.offsets, 8) };
        let mut prod = RingProd { inner, mmap_addr: NonNull::new(core::ptr::slice_from_raw_parts_mut(fake.ptr.as_ptr(), 1)).unwrap() };

        let mut idx = BufIdx::default();
        let got = prod.reserve(3, &mut idx);
        assert_eq!(got, 3);
        assert_eq!(idx.0, 0);
        assert_eq!(prod.inner.producer.load(Ordering::Relaxed), 0);

        prod.submit(3);
        assert_eq!(prod.inner.producer.load(Ordering::Relaxed), 3);

        core::mem::forget(prod);
    }

    #[test]
    fn cancel_returns_reserved_slots() {
        let fake = fake_ring(4);
        let inner = unsafe { Ring::new(fake.ptr, &fake.offsets, 4) };
        let mut prod = RingProd { inner, mmap_addr: NonNull::new(core::ptr::slice_from_raw_parts_mut(fake.ptr.as_ptr(), 1)).unwrap() };

        let mut idx = BufIdx::default();
        assert_eq!(prod.reserve(4, &mut idx), 4);
        assert_eq!(prod.reserve(1, &mut idx), 0);

        prod.cancel(2);
        assert_eq!(prod.reserve(2, &mut idx), 2);

        core::mem::forget(prod);
    }

    #[test]
    fn peek_is_bounded_by_producer_cursor() {
        let fake = fake_ring(8);
        let inner = unsafe { Ring::new(fake.ptr, &fake.offsets, 8) };
        inner.producer.store(5, Ordering::Relaxed);
        let mut cons = RingCons { inner, mmap_addr: NonNull::new(core::ptr::slice_from_raw_parts_mut(fake.ptr.as_ptr(), 1)).unwrap() };

        let mut idx = BufIdx::default();
        let got = cons.peek(8, &mut idx);
        assert_eq!(got, 5);
        assert_eq!(idx.0, 0);

        cons.release(5);
        assert_eq!(cons.inner.consumer.load(Ordering::Relaxed), 5);

        core::mem::forget(cons);
    }
}
