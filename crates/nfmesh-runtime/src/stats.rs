//! Per-socket counters (`spec.md` §4.H) and the periodic delta printer,
//! translated from `original_source/lib/flash/nf/flash_stats.c`'s
//! `flash__dump_stats`/`flash__stats_thread`, using `log` instead of a
//! `printf`+clear-screen dashboard.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nfmesh_xsk::DeviceQueue;

use crate::context::RuntimeContext;

/// One socket's counters. Written only by its owning worker thread;
/// snapshotted by the stats thread through a [`StatsRegistry`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketStats {
    pub rx_npkts: u64,
    pub rx_frags: u64,
    pub tx_npkts: u64,
    pub tx_frags: u64,
    pub drop_npkts: u64,

    /// Driver-maintained counters, refreshed from `getsockopt(SOL_XDP,
    /// XDP_STATISTICS)` rather than counted by the hot loop itself.
    pub rx_dropped_npkts: u64,
    pub rx_invalid_npkts: u64,
    pub tx_invalid_npkts: u64,
    pub rx_fill_empty_npkts: u64,
    pub tx_ring_empty_npkts: u64,

    pub rx_empty_polls: u64,
    pub fill_fail_polls: u64,
    pub copy_tx_sendtos: u64,
    pub tx_wakeup_sendtos: u64,
    pub opt_polls: u64,
    pub backpressure: u64,
}

impl SocketStats {
    /// Pull the kernel's own drop/invalid-descriptor counters for this
    /// socket. Best-effort: older kernels support only the v1 subset, and a
    /// failed `getsockopt` just leaves the previous values in place.
    pub fn refresh_driver_counters(&mut self, fill: &DeviceQueue) {
        if let Ok(d) = fill.driver_stats() {
            self.rx_dropped_npkts = d.rx_dropped;
            self.rx_invalid_npkts = d.rx_invalid_descs;
            self.tx_invalid_npkts = d.tx_invalid_descs;
            self.rx_fill_empty_npkts = d.rx_fill_ring_empty_descs;
            self.tx_ring_empty_npkts = d.tx_ring_empty_descs;
        }
    }
}

/// Shared snapshot slots, one per attached socket, updated by worker
/// threads and read by the stats thread at a bounded cadence.
#[derive(Clone)]
pub struct StatsRegistry {
    inner: Arc<Mutex<Vec<SocketStats>>>,
}

impl StatsRegistry {
    pub fn new(sockets: usize) -> Self {
        StatsRegistry { inner: Arc::new(Mutex::new(vec![SocketStats::default(); sockets])) }
    }

    pub fn update(&self, index: usize, snapshot: SocketStats) {
        self.inner.lock().expect("stats registry mutex poisoned")[index] = snapshot;
    }

    pub fn snapshot(&self) -> Vec<SocketStats> {
        self.inner.lock().expect("stats registry mutex poisoned").clone()
    }
}

fn rate(current: u64, previous: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    current.saturating_sub(previous) as f64 / elapsed_secs
}

/// Runs until `ctx` observes shutdown, logging a per-second delta line per
/// socket at `interval` cadence.
pub fn print_loop(registry: StatsRegistry, ctx: RuntimeContext, interval: Duration) {
    let mut prev = registry.snapshot();
    let mut last = Instant::now();

    while !ctx.is_done() {
        std::thread::sleep(interval);
        if ctx.is_done() {
            break;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last).as_secs_f64();
        last = now;

        let current = registry.snapshot();
        for (i, (cur, prev)) in current.iter().zip(prev.iter()).enumerate() {
            log::info!(
                "socket {i}: rx {:.0} pkt/s ({} total, {} frags) tx {:.0} pkt/s ({} total, {} frags) \
                 drop {:.0} pkt/s ({} total) rx_dropped={} rx_invalid={} tx_invalid={} \
                 rx_fill_empty={} tx_ring_empty={} rx_empty_polls={} fill_fail_polls={} \
                 copy_tx_sendtos={} tx_wakeup_sendtos={} opt_polls={} backpressure={}",
                rate(cur.rx_npkts, prev.rx_npkts, elapsed),
                cur.rx_npkts,
                cur.rx_frags,
                rate(cur.tx_npkts, prev.tx_npkts, elapsed),
                cur.tx_npkts,
                cur.tx_frags,
                rate(cur.drop_npkts, prev.drop_npkts, elapsed),
                cur.drop_npkts,
                cur.rx_dropped_npkts,
                cur.rx_invalid_npkts,
                cur.tx_invalid_npkts,
                cur.rx_fill_empty_npkts,
                cur.tx_ring_empty_npkts,
                cur.rx_empty_polls,
                cur.fill_fail_polls,
                cur.copy_tx_sendtos,
                cur.tx_wakeup_sendtos,
                cur.opt_polls,
                cur.backpressure,
            );
        }
        prev = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_delta_over_elapsed_time() {
        assert_eq!(rate(1100, 1000, 1.0), 100.0);
        assert_eq!(rate(1000, 1000, 2.0), 0.0);
    }

    #[test]
    fn rate_clamps_on_counter_reset() {
        assert_eq!(rate(5, 1000, 1.0), 0.0);
    }

    #[test]
    fn registry_update_is_visible_to_snapshot() {
        let registry = StatsRegistry::new(2);
        let mut stats = SocketStats::default();
        stats.rx_npkts = 42;
        registry.update(1, stats);

        let snap = registry.snapshot();
        assert_eq!(snap[0].rx_npkts, 0);
        assert_eq!(snap[1].rx_npkts, 42);
    }
}
