//! Lock-free descriptor rings used for sibling-to-sibling packet hand-off.
//!
//! Two flavors share one reservation discipline: reserve a contiguous run of
//! slots, write into them, then publish. `Spsc` has exactly one producer and
//! one consumer and can cheaply roll back an unfinished reservation. `Mpsc`
//! allows any number of producer handles; reservation uses a compare-and-swap
//! on a separate `producer_head` counter, the way a guest ring reserves space
//! in an owner's ring in a multi-process NF chain.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Internal, shared ring storage. Producer(s) and consumer each keep their
/// own cached view of the peer's cursor to avoid a redundant atomic load on
/// every slot.
struct Core<T> {
    mask: u32,
    buffer: Box<[UnsafeCell<T>]>,
    /// Published producer tail, visible to the consumer.
    producer: AtomicU32,
    /// Consumer's committed cursor, visible to producer(s).
    consumer: AtomicU32,
}

// Safety: access to `buffer` is only ever through the reservation/peek
// guards below, which hand out disjoint index ranges to at most one writer
// and one reader at a time.
unsafe impl<T: Send> Sync for Core<T> {}

impl<T: Copy + Default> Core<T> {
    fn with_capacity(capacity: u32) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Core {
            mask: capacity - 1,
            buffer,
            producer: AtomicU32::new(0),
            consumer: AtomicU32::new(0),
        }
    }

    unsafe fn slot(&self, idx: u32) -> *mut T {
        self.buffer[(idx & self.mask) as usize].get()
    }
}

/// The producer side of a single-producer single-consumer ring.
pub struct SpscProducer<T> {
    core: Arc<Core<T>>,
    cached_consumer: u32,
    cached_producer: u32,
}

/// The consumer side of a single-producer single-consumer ring.
pub struct SpscConsumer<T> {
    core: Arc<Core<T>>,
    cached_producer: u32,
    cached_consumer: u32,
}

/// Construct a fresh SPSC ring. `capacity` must be a power of two.
pub fn spsc<T: Copy + Default>(capacity: u32) -> (SpscProducer<T>, SpscConsumer<T>) {
    let core = Arc::new(Core::with_capacity(capacity));
    (
        SpscProducer {
            core: core.clone(),
            cached_consumer: 0,
            cached_producer: 0,
        },
        SpscConsumer {
            core,
            cached_producer: 0,
            cached_consumer: 0,
        },
    )
}

impl<T: Copy + Default> SpscProducer<T> {
    /// Number of slots free for writing, at least `nb` if available at all.
    pub fn count_free(&mut self, nb: u32) -> u32 {
        let free = self.cached_consumer.wrapping_sub(self.cached_producer);
        if free >= nb {
            return free;
        }
        self.cached_consumer = self.core.consumer.load(Ordering::Acquire);
        self.cached_consumer = self.cached_consumer.wrapping_add(self.core.mask + 1);
        self.cached_consumer.wrapping_sub(self.cached_producer)
    }

    /// Reserve up to `nb` slots for writing. Returns fewer if the ring does
    /// not have enough room.
    pub fn reserve(&mut self, nb: u32) -> Reservation<'_, T> {
        let got = self.count_free(nb).min(nb);
        let base = self.cached_producer;
        self.cached_producer = self.cached_producer.wrapping_add(got);
        Reservation {
            core: &self.core,
            base,
            len: got,
            written: 0,
            rollback: Some(&mut self.cached_producer),
        }
    }
}

impl<T: Copy + Default> SpscConsumer<T> {
    /// Number of slots available for reading, capped at `nb`.
    pub fn count_available(&mut self, nb: u32) -> u32 {
        let mut avail = self.cached_producer.wrapping_sub(self.cached_consumer);
        if avail == 0 {
            self.cached_producer = self.core.producer.load(Ordering::Acquire);
            avail = self.cached_producer.wrapping_sub(self.cached_consumer);
        }
        avail.min(nb)
    }

    /// Peek up to `nb` readable slots.
    pub fn peek(&mut self, nb: u32) -> Peeked<'_, T> {
        let got = self.count_available(nb);
        let base = self.cached_consumer;
        self.cached_consumer = self.cached_consumer.wrapping_add(got);
        Peeked {
            core: &self.core,
            base,
            len: got,
            taken: 0,
            rollback: Some(&mut self.cached_consumer),
        }
    }
}

/// A reserved, uncommitted run of producer slots.
///
/// Dropping without calling [`Reservation::commit`] rolls back the entire
/// reservation, exactly as an unused `write` request never happened.
pub struct Reservation<'a, T> {
    core: &'a Core<T>,
    base: u32,
    len: u32,
    written: u32,
    rollback: Option<&'a mut u32>,
}

impl<'a, T: Copy> Reservation<'a, T> {
    pub fn capacity(&self) -> u32 {
        self.len
    }

    /// Write the next reserved slot. Panics if called more than `capacity()` times.
    pub fn write(&mut self, value: T) {
        assert!(self.written < self.len, "wrote past reserved capacity");
        let idx = self.base.wrapping_add(self.written);
        unsafe { *self.core.slot(idx) = value };
        self.written += 1;
    }

    /// Publish every slot written so far (a partial commit still advances
    /// the producer tail by the number actually written and shrinks the
    /// remaining, still-cancellable reservation).
    pub fn commit(mut self) -> u32 {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> u32 {
        let n = self.written;
        if n > 0 {
            let cur = self.core.producer.load(Ordering::Relaxed);
            self.core.producer.store(cur.wrapping_add(n), Ordering::Release);
        }
        if let Some(cached) = self.rollback.take() {
            *cached = cached.wrapping_sub(self.len - n);
        }
        self.len = 0;
        self.written = 0;
        n
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if let Some(cached) = self.rollback.take() {
            if self.written > 0 {
                let core = self.core;
                let cur = core.producer.load(Ordering::Relaxed);
                core.producer
                    .store(cur.wrapping_add(self.written), Ordering::Release);
            }
            *cached = cached.wrapping_sub(self.len - self.written);
        }
    }
}

/// A peeked, unreleased run of consumer slots.
///
/// Dropping without calling [`Peeked::release`] rolls back the peek, the
/// way a reader that decides not to process a batch leaves it for later.
pub struct Peeked<'a, T> {
    core: &'a Core<T>,
    base: u32,
    len: u32,
    taken: u32,
    rollback: Option<&'a mut u32>,
}

impl<'a, T: Copy> Peeked<'a, T> {
    pub fn capacity(&self) -> u32 {
        self.len - self.taken
    }

    pub fn read(&mut self) -> Option<T> {
        if self.taken >= self.len {
            return None;
        }
        let idx = self.base.wrapping_add(self.taken);
        let value = unsafe { *self.core.slot(idx) };
        self.taken += 1;
        Some(value)
    }

    /// Release every slot read so far back to the producer.
    pub fn release(mut self) -> u32 {
        self.release_inner()
    }

    fn release_inner(&mut self) -> u32 {
        let n = self.taken;
        if n > 0 {
            let cur = self.core.consumer.load(Ordering::Relaxed);
            self.core.consumer.store(cur.wrapping_add(n), Ordering::Release);
        }
        if let Some(cached) = self.rollback.take() {
            *cached = cached.wrapping_sub(self.len - n);
        }
        self.len = 0;
        self.taken = 0;
        n
    }
}

impl<T> Drop for Peeked<'_, T> {
    fn drop(&mut self) {
        if let Some(cached) = self.rollback.take() {
            if self.taken > 0 {
                let core = self.core;
                let cur = core.consumer.load(Ordering::Relaxed);
                core.consumer
                    .store(cur.wrapping_add(self.taken), Ordering::Release);
            }
            *cached = cached.wrapping_sub(self.len - self.taken);
        }
    }
}

/// Shared storage for a multi-producer, single-consumer ring.
struct MpscCore<T> {
    inner: Core<T>,
    /// CAS-reserved producer head; `inner.producer` is only advanced once a
    /// producer's own slice has actually been published, in FIFO order.
    producer_head: AtomicU32,
}

/// A cloneable handle to the producer side of an MPSC ring. Any number of
/// threads may hold and use one concurrently.
#[derive(Clone)]
pub struct MpscProducer<T> {
    core: Arc<MpscCore<T>>,
}

/// The single consumer side of an MPSC ring.
pub struct MpscConsumer<T> {
    core: Arc<MpscCore<T>>,
    cached_producer: u32,
    cached_consumer: u32,
}

/// Construct a fresh MPSC ring. `capacity` must be a power of two.
pub fn mpsc<T: Copy + Default>(capacity: u32) -> (MpscProducer<T>, MpscConsumer<T>) {
    let core = Arc::new(MpscCore {
        inner: Core::with_capacity(capacity),
        producer_head: AtomicU32::new(0),
    });
    (
        MpscProducer { core: core.clone() },
        MpscConsumer {
            core,
            cached_producer: 0,
            cached_consumer: 0,
        },
    )
}

impl<T: Copy + Default> MpscProducer<T> {
    /// Reserve up to `nb` slots via a compare-and-swap on the shared
    /// producer head, spinning against other producers until it succeeds.
    pub fn reserve(&self, nb: u32) -> MpscReservation<'_, T> {
        let capacity = self.core.inner.mask + 1;
        let mut old_head = self.core.producer_head.load(Ordering::Relaxed);
        let n = loop {
            let cons = self.core.inner.consumer.load(Ordering::Acquire);
            let free_entries = capacity.wrapping_add(cons).wrapping_sub(old_head);
            let n = nb.min(free_entries);
            if n == 0 {
                break 0;
            }
            let new_head = old_head.wrapping_add(n);
            match self.core.producer_head.compare_exchange_weak(
                old_head,
                new_head,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break n,
                Err(observed) => {
                    old_head = observed;
                    core::hint::spin_loop();
                    continue;
                }
            }
        };

        MpscReservation {
            core: &self.core,
            base: old_head,
            len: n,
            written: 0,
        }
    }
}

/// A reserved run of MPSC producer slots.
///
/// Unlike the SPSC reservation this cannot roll back: the slots were already
/// carved out of shared capacity via CAS, and the consumer busy-waits for
/// this exact range to be published in order. Dropping an uncommitted or
/// partially-written reservation fills the remainder with `T::default()`
/// and publishes anyway, so the ring never stalls behind a forgotten commit.
pub struct MpscReservation<'a, T> {
    core: &'a MpscCore<T>,
    base: u32,
    len: u32,
    written: u32,
}

impl<'a, T: Copy + Default> MpscReservation<'a, T> {
    pub fn capacity(&self) -> u32 {
        self.len - self.written
    }

    pub fn write(&mut self, value: T) {
        assert!(self.written < self.len, "wrote past reserved capacity");
        let idx = self.base.wrapping_add(self.written);
        unsafe { *self.core.inner.slot(idx) = value };
        self.written += 1;
    }

    /// Publish this reservation. Blocks only until producers ahead of it in
    /// FIFO order have published theirs (never on the consumer).
    pub fn commit(mut self) {
        self.publish();
    }

    fn publish(&mut self) {
        if self.len == 0 {
            return;
        }
        while self.written < self.len {
            let idx = self.base.wrapping_add(self.written);
            unsafe { *self.core.inner.slot(idx) = T::default() };
            self.written += 1;
        }
        let old_val = self.base;
        let new_val = self.base.wrapping_add(self.len);
        while self.core.inner.producer.load(Ordering::Relaxed) != old_val {
            core::hint::spin_loop();
        }
        self.core.inner.producer.store(new_val, Ordering::Release);
        self.len = 0;
    }
}

impl<T: Copy + Default> Drop for MpscReservation<'_, T> {
    fn drop(&mut self) {
        self.publish();
    }
}

impl<T: Copy + Default> MpscConsumer<T> {
    pub fn count_available(&mut self, nb: u32) -> u32 {
        let mut avail = self.cached_producer.wrapping_sub(self.cached_consumer);
        if avail == 0 {
            self.cached_producer = self.core.inner.producer.load(Ordering::Acquire);
            avail = self.cached_producer.wrapping_sub(self.cached_consumer);
        }
        avail.min(nb)
    }

    pub fn peek(&mut self, nb: u32) -> Peeked<'_, T> {
        let got = self.count_available(nb);
        let base = self.cached_consumer;
        self.cached_consumer = self.cached_consumer.wrapping_add(got);
        Peeked {
            core: &self.core.inner,
            base,
            len: got,
            taken: 0,
            rollback: Some(&mut self.cached_consumer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn spsc_round_trip_preserves_values() {
        let (mut tx, mut rx) = spsc::<u64>(8);
        let mut res = tx.reserve(4);
        assert_eq!(res.capacity(), 4);
        for i in 0..4u64 {
            res.write(i * 10);
        }
        assert_eq!(res.commit(), 4);

        let mut peek = rx.peek(4);
        let mut got = Vec::new();
        while let Some(v) = peek.read() {
            got.push(v);
        }
        assert_eq!(peek.release(), 4);
        assert_eq!(got, vec![0, 10, 20, 30]);
    }

    #[test]
    fn spsc_reserve_beyond_capacity_is_clamped() {
        let (mut tx, _rx) = spsc::<u64>(4);
        let res = tx.reserve(100);
        assert_eq!(res.capacity(), 4);
    }

    #[test]
    fn spsc_dropped_reservation_rolls_back() {
        let (mut tx, mut rx) = spsc::<u64>(4);
        {
            let mut res = tx.reserve(4);
            res.write(1);
            // dropped without commit: only the one write is published
        }
        let mut peek = rx.peek(4);
        assert_eq!(peek.capacity(), 1);
        assert_eq!(peek.read(), Some(1));
        peek.release();

        // Capacity must be available again for a fresh reservation.
        let mut res = tx.reserve(4);
        assert_eq!(res.capacity(), 3);
        res.write(2);
        res.write(3);
        res.write(4);
        res.commit();
    }

    #[test]
    fn spsc_dropped_peek_rolls_back_for_retry() {
        let (mut tx, mut rx) = spsc::<u64>(4);
        let mut res = tx.reserve(2);
        res.write(7);
        res.write(8);
        res.commit();

        {
            let mut peek = rx.peek(2);
            assert_eq!(peek.read(), Some(7));
            // dropped without release: both slots remain pending
        }

        let mut peek = rx.peek(2);
        assert_eq!(peek.read(), Some(7));
        assert_eq!(peek.read(), Some(8));
        peek.release();
    }

    #[test]
    fn mpsc_concurrent_producers_deliver_every_item_exactly_once() {
        const PRODUCERS: usize = 6;
        const PER_PRODUCER: u64 = 4000;

        let (tx, mut rx) = mpsc::<u64>(1024);

        thread::scope(|scope| {
            for p in 0..PRODUCERS {
                let tx = tx.clone();
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let tag = (p as u64) << 32 | i;
                        loop {
                            let mut res = tx.reserve(1);
                            if res.capacity() == 0 {
                                core::hint::spin_loop();
                                continue;
                            }
                            res.write(tag);
                            res.commit();
                            break;
                        }
                    }
                });
            }

            let mut seen = vec![0u64; PRODUCERS];
            let mut total = 0u64;
            while total < (PRODUCERS as u64) * PER_PRODUCER {
                let mut peek = rx.peek(64);
                let mut n = 0;
                while let Some(tag) = peek.read() {
                    let producer = (tag >> 32) as usize;
                    let seq = tag & 0xffff_ffff;
                    assert_eq!(seq, seen[producer], "out-of-order delivery from one producer");
                    seen[producer] += 1;
                    n += 1;
                }
                peek.release();
                total += n as u64;
            }
        });
    }
}
