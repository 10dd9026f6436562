//! The per-thread hot loop: poll, receive, hand the batch to the NF,
//! send/drop what it decided, sweep completions. Translated from
//! `original_source/lib/flash/nf/flash_txrx.c`'s
//! `flash__recvmsg`/`flash__sendmsg`/`__reserve_fq`/`__reserve_tx`/
//! `__complete_tx_rx_first`.

use nfmesh_ring::{Descriptor, FramePool, MpscProducer};
use nfmesh_xsk::xdp::XdpDesc;
use nfmesh_xsk::DeviceQueue;

use crate::attach::ThreadAttachment;
use crate::context::RuntimeContext;
use crate::error::Error;
use crate::stats::{SocketStats, StatsRegistry};

/// One entry per descriptor in a batch: `true` means this slot should be
/// forwarded / dropped respectively. A slot may be neither (the NF is still
/// holding it, e.g. a non-final fragment) but never both.
pub type ForwardMask = Vec<bool>;
pub type DropMask = Vec<bool>;

pub struct WorkerConfig {
    pub batch_size: u32,
    pub poll_timeout_ms: i32,
    pub busy_poll: bool,
    pub copy_mode: bool,
}

fn from_xdp(d: XdpDesc) -> Descriptor {
    Descriptor { addr: d.addr, len: d.len, options: d.options }
}

fn to_xdp(d: Descriptor) -> XdpDesc {
    XdpDesc { addr: d.addr, len: d.len, options: d.options }
}

/// Stamps outgoing descriptors with a round-robin sibling index and hands
/// them to the matching downstream sibling thread's ring, bypassing the
/// kernel entirely. Grounded in `original_source/examples/unit-tests/
/// userspace-chain.c`'s owner/guest ring pair: each sibling is one MPSC
/// ring's producer side, its consumer owned by that sibling's own thread.
pub struct SiblingRouter {
    producers: Vec<MpscProducer<Descriptor>>,
    counter: u64,
}

impl SiblingRouter {
    pub fn new(producers: Vec<MpscProducer<Descriptor>>) -> Self {
        SiblingRouter { producers, counter: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// `c % next_size` round-robin fan-out (`spec.md` §4.G "Sibling
    /// routing"). Returns `false` if the chosen sibling's ring is full.
    pub fn route(&mut self, desc: Descriptor) -> bool {
        if self.producers.is_empty() {
            return false;
        }
        let index = (self.counter % self.producers.len() as u64) as usize;
        self.counter += 1;
        let tagged = desc.with_sibling_tag(index as u16);
        let mut reservation = self.producers[index].reserve(1);
        if reservation.capacity() == 0 {
            return false;
        }
        reservation.write(tagged);
        reservation.commit();
        true
    }
}

/// `recv(batch[0..max]) -> nrecv`: peek up to `max` descriptors off RX,
/// copy them out, and release the ring slots. Never blocks on the kernel
/// beyond the prior poll.
pub fn recv(thread: &mut ThreadAttachment, buf: &mut [Descriptor], max: u32, stats: &mut SocketStats) -> u32 {
    let mut guard = thread.rx.receive(max);
    let n = guard.len();
    for slot in buf.iter_mut().take(n as usize) {
        let raw = guard.read().expect("guard.len() bounds this loop");
        *slot = from_xdp(raw);
    }
    drop(guard);

    let mut eop = 0u64;
    for slot in buf.iter().take(n as usize) {
        if !slot.is_fragment_continuation() {
            eop += 1;
        }
    }
    stats.rx_npkts += eop;
    stats.rx_frags += u64::from(n);
    n
}

/// Block until `num` FILL slots are reserved, driving the busy-poll /
/// `recvfrom` kick retry loop described by `flash_txrx.c`'s `__reserve_fq`.
fn reserve_fill<'a>(fill: &'a mut DeviceQueue, num: u32, busy_poll: bool, stats: &mut SocketStats) -> nfmesh_xsk::WriteFill<'a> {
    let mut attempts = 0;
    loop {
        let guard = fill.fill(num);
        if guard.len() == num {
            if attempts > 0 {
                stats.backpressure += 1;
            }
            return guard;
        }
        drop(guard);
        attempts += 1;
        if busy_poll || fill.needs_wakeup() {
            stats.fill_fail_polls += 1;
            let _ = fill.wake();
        }
    }
}

/// `drop(batch[0..n]) -> ndropped`: return the original frame addresses to
/// FILL. Blocks (via [`reserve_fill`]) until the slots are available.
pub fn drop_batch(thread: &mut ThreadAttachment, addrs: &[u64], busy_poll: bool, stats: &mut SocketStats) -> u32 {
    if addrs.is_empty() {
        return 0;
    }
    let mut guard = reserve_fill(&mut thread.fill, addrs.len() as u32, busy_poll, stats);
    for &addr in addrs {
        guard.insert(addr);
    }
    drop(guard);
    stats.drop_npkts += addrs.len() as u64;
    addrs.len() as u32
}

/// Peek up to `outstanding_tx` COMPLETION entries and recycle them into
/// FILL, kicking the driver with a zero-byte `sendto` first if the bind is
/// in copy mode. Translated from `__complete_tx_rx_first`.
pub fn complete(thread: &mut ThreadAttachment, outstanding_tx: &mut u32, config: &WorkerConfig, stats: &mut SocketStats) {
    if *outstanding_tx == 0 {
        return;
    }
    if config.copy_mode {
        stats.copy_tx_sendtos += 1;
        let _ = thread.tx.wake();
    }

    let num = (*outstanding_tx).min(config.batch_size);
    let mut scratch = Vec::with_capacity(num as usize);
    {
        let mut comp = thread.fill.complete(num);
        while let Some(addr) = comp.read() {
            scratch.push(addr);
        }
    }
    if scratch.is_empty() {
        return;
    }

    let mut guard = reserve_fill(&mut thread.fill, scratch.len() as u32, config.busy_poll, stats);
    for addr in scratch.drain(..) {
        guard.insert(addr);
    }
    let completed = guard.len();
    drop(guard);
    *outstanding_tx -= completed;
}

fn complete_tx_only(
    fill: &mut DeviceQueue,
    tx: &mut nfmesh_xsk::TxRing,
    outstanding_tx: &mut u32,
    config: &WorkerConfig,
    stats: &mut SocketStats,
) {
    if *outstanding_tx == 0 {
        return;
    }
    if config.copy_mode {
        stats.copy_tx_sendtos += 1;
        let _ = tx.wake();
    }
    let num = (*outstanding_tx).min(config.batch_size);
    let mut scratch = Vec::with_capacity(num as usize);
    {
        let mut comp = fill.complete(num);
        while let Some(addr) = comp.read() {
            scratch.push(addr);
        }
    }
    if scratch.is_empty() {
        return;
    }
    let mut guard = reserve_fill(fill, scratch.len() as u32, config.busy_poll, stats);
    for addr in scratch.drain(..) {
        guard.insert(addr);
    }
    let completed = guard.len();
    drop(guard);
    *outstanding_tx -= completed;
}

/// `send(batch[0..n]) -> nsent`: `nsent == n` by construction, since the
/// caller has already gone through backpressure reservation.
pub fn send(thread: &mut ThreadAttachment, batch: &[Descriptor], outstanding_tx: &mut u32, config: &WorkerConfig, stats: &mut SocketStats) -> u32 {
    if batch.is_empty() {
        return 0;
    }
    let mut eop = 0u64;
    loop {
        let mut guard = thread.tx.transmit(batch.len() as u32);
        if guard.len() == batch.len() as u32 {
            for desc in batch {
                if !desc.is_fragment_continuation() {
                    eop += 1;
                }
                let options = if desc.is_fragment_continuation() { Descriptor::OPT_CONTD } else { 0 };
                guard.insert(to_xdp(Descriptor { addr: desc.addr, len: desc.len, options }));
            }
            drop(guard);
            break;
        }
        drop(guard);
        complete_tx_only(&mut thread.fill, &mut thread.tx, outstanding_tx, config, stats);
        if config.busy_poll || thread.tx.needs_wakeup() {
            stats.tx_wakeup_sendtos += 1;
            let _ = thread.tx.wake();
        }
    }
    *outstanding_tx += batch.len() as u32;
    stats.tx_npkts += eop;
    stats.tx_frags += batch.len() as u64;
    batch.len() as u32
}

/// `alloc(batch[0..max]) -> nalloc`: pull frame addresses from this
/// thread's own pool (for traffic generators originating packets, not
/// forwarding received ones).
pub fn alloc(pool: &mut FramePool, buf: &mut [u64], max: u32) -> u32 {
    let mut n = 0;
    for slot in buf.iter_mut().take(max as usize) {
        match pool.get() {
            Some(addr) => {
                *slot = addr;
                n += 1;
            }
            None => break,
        }
    }
    n
}

/// Run the per-thread hot loop until `ctx` observes shutdown. `on_batch`
/// is the NF's own capability (`spec.md` §9 "Dynamic dispatch"): it
/// partitions each received descriptor into forward, drop, or neither.
/// `registry`/`thread_index` receive a snapshot of this thread's own
/// counters (including a driver-stats refresh) after every batch, mirroring
/// the original's single-process shared `ring_stats` struct without needing
/// unsynchronized cross-thread field access.
pub fn run<F>(
    thread: &mut ThreadAttachment,
    ctx: &RuntimeContext,
    config: &WorkerConfig,
    registry: &StatsRegistry,
    thread_index: usize,
    mut on_batch: F,
) -> Result<(), Error>
where
    F: FnMut(&mut [Descriptor]) -> (ForwardMask, DropMask),
{
    let batch = config.batch_size as usize;
    let mut recv_buf = vec![Descriptor::default(); batch];
    let mut send_buf = Vec::with_capacity(batch);
    let mut drop_buf = Vec::with_capacity(batch);
    let mut outstanding_tx: u32 = 0;
    let mut stats = SocketStats::default();

    while !ctx.is_done() {
        stats.opt_polls += 1;
        let mut pfd = libc::pollfd { fd: thread.rx.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let ready = unsafe { libc::poll(&mut pfd, 1, config.poll_timeout_ms) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Error::Io(err));
        }
        if ready == 0 {
            continue;
        }

        complete(thread, &mut outstanding_tx, config, &mut stats);

        let nrecv = recv(thread, &mut recv_buf, config.batch_size, &mut stats);
        if nrecv == 0 {
            if config.busy_poll || thread.fill.needs_wakeup() {
                stats.rx_empty_polls += 1;
                let _ = thread.fill.wake();
            }
            stats.refresh_driver_counters(&thread.fill);
            registry.update(thread_index, stats);
            continue;
        }

        let received = &mut recv_buf[..nrecv as usize];
        let (forward_mask, drop_mask) = on_batch(received);

        send_buf.clear();
        drop_buf.clear();
        for (i, desc) in received.iter().enumerate() {
            if forward_mask.get(i).copied().unwrap_or(false) {
                send_buf.push(*desc);
            } else if drop_mask.get(i).copied().unwrap_or(false) {
                drop_buf.push(desc.addr);
            }
        }

        if !send_buf.is_empty() {
            reserve_tx_for(thread, &mut outstanding_tx, send_buf.len() as u32, config, &mut stats);
            send(thread, &send_buf, &mut outstanding_tx, config, &mut stats);
        }
        if !drop_buf.is_empty() {
            drop_batch(thread, &drop_buf, config.busy_poll, &mut stats);
        }

        stats.refresh_driver_counters(&thread.fill);
        registry.update(thread_index, stats);
    }
    Ok(())
}

/// Block until `num` TX slots are free, without writing to them yet (the
/// write happens afterward in [`send`]); this is the mandatory-reserve
/// half of the backpressure discipline described in `spec.md` §4.G.
fn reserve_tx_for(thread: &mut ThreadAttachment, outstanding_tx: &mut u32, num: u32, config: &WorkerConfig, stats: &mut SocketStats) {
    let mut attempts = 0;
    loop {
        if thread.tx.pending(num) >= num {
            if attempts > 0 {
                stats.backpressure += 1;
            }
            return;
        }
        attempts += 1;
        complete_tx_only(&mut thread.fill, &mut thread.tx, outstanding_tx, config, stats);
        if config.busy_poll || thread.tx.needs_wakeup() {
            stats.tx_wakeup_sendtos += 1;
            let _ = thread.tx.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_router_stamps_round_robin_index() {
        let (p0, mut c0) = nfmesh_ring::mpsc::<Descriptor>(8);
        let (p1, mut c1) = nfmesh_ring::mpsc::<Descriptor>(8);
        let mut router = SiblingRouter::new(vec![p0, p1]);

        for i in 0..4u64 {
            let desc = Descriptor { addr: i, len: 64, options: 0 };
            assert!(router.route(desc));
        }

        let mut peek0 = c0.peek(8);
        assert_eq!(peek0.capacity(), 2);
        assert_eq!(peek0.read().unwrap().sibling_tag(), 0);
        assert_eq!(peek0.read().unwrap().sibling_tag(), 0);
        drop(peek0);

        let mut peek1 = c1.peek(8);
        assert_eq!(peek1.capacity(), 2);
        assert_eq!(peek1.read().unwrap().sibling_tag(), 1);
        drop(peek1);
    }

    #[test]
    fn empty_router_never_routes() {
        let mut router = SiblingRouter::new(Vec::new());
        assert!(router.is_empty());
        assert!(!router.route(Descriptor::default()));
    }
}
