//! `nfmesh-demo-firewall`: forwards packets whose 5-tuple is in a permitted
//! session table, drops everything else. Translated from
//! `original_source/examples/firewall/main.c`'s `socket_routine`, with the
//! session table loaded from a standalone JSON file instead of negotiated
//! over IPC with a paired load balancer.

mod packet;
mod session_table;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use nfmesh_ring::Descriptor;
use nfmesh_runtime::{pin_current_thread, stats, worker, CommonArgs, FrameView, NfHandle, RuntimeContext, StatsRegistry, WorkerConfig};
use session_table::SessionTable;

#[derive(Debug, Parser)]
#[command(name = "nfmesh-demo-firewall")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// JSON file listing the permitted 5-tuples (`spec.md` §3 "Session
    /// state"): `{"valid_sessions": [{"src_ip": ..., "src_port": ...,
    /// "dst_ip": ..., "dst_port": ..., "proto": "tcp"|"udp"}]}`.
    #[arg(long)]
    sessions: PathBuf,

    #[arg(long, default_value_t = 64)]
    batch_size: u32,

    #[arg(long, default_value_t = 1000)]
    poll_timeout_ms: i32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let args = Args::parse();
    let table = Arc::new(SessionTable::load(&args.sessions)?);
    log::info!("loaded {} permitted session(s)", table.len());

    let ctx = RuntimeContext::install_signal_handler();
    let mut handle = NfHandle::attach(&args.common)?;
    let frame_view = handle.frame_view();

    let config = Arc::new(WorkerConfig {
        batch_size: args.batch_size,
        poll_timeout_ms: args.poll_timeout_ms,
        busy_poll: false,
        copy_mode: false,
    });
    let registry = StatsRegistry::new(handle.threads.len());
    let cpus: Vec<usize> = args.common.cpu_range().collect();
    let stats_cpu = args.common.stats_cpu;
    let stats_interval = Duration::from_secs(args.common.stats_interval_secs);

    let stats_handle = {
        let registry = registry.clone();
        let ctx = ctx.clone();
        thread::spawn(move || {
            if let Some(cpu) = stats_cpu {
                pin_current_thread(cpu);
            }
            stats::print_loop(registry, ctx, stats_interval);
        })
    };

    let mut worker_handles = Vec::new();
    for (index, mut thread_attachment) in handle.threads.drain(..).enumerate() {
        let ctx = ctx.clone();
        let config = config.clone();
        let registry = registry.clone();
        let table = table.clone();
        let cpu = cpus[index % cpus.len()];
        worker_handles.push(thread::spawn(move || {
            pin_current_thread(cpu);
            let on_batch = |batch: &mut [Descriptor]| filter_batch(frame_view, &table, batch);
            if let Err(e) = worker::run(&mut thread_attachment, &ctx, &config, &registry, index, on_batch) {
                log::error!("worker thread {index} exited with error: {e}");
            }
        }));
    }

    for h in worker_handles {
        let _ = h.join();
    }
    ctx.done.store(true, std::sync::atomic::Ordering::SeqCst);
    let _ = stats_handle.join();

    handle.detach()?;
    Ok(())
}

/// Forward every packet whose 5-tuple is in `table`; drop everything else,
/// including anything that doesn't parse as a TCP/UDP-over-IPv4 segment.
fn filter_batch(frame_view: FrameView, table: &SessionTable, batch: &mut [Descriptor]) -> (worker::ForwardMask, worker::DropMask) {
    let mut forward = vec![false; batch.len()];
    let mut drop = vec![false; batch.len()];
    for (i, desc) in batch.iter().enumerate() {
        let bytes = unsafe { frame_view.bytes(desc.addr) };
        let admitted = match packet::session_key(bytes, desc.len as usize) {
            Some(key) => table.contains(&key),
            None => false,
        };
        if admitted {
            forward[i] = true;
        } else {
            drop[i] = true;
        }
    }
    (forward, drop)
}
