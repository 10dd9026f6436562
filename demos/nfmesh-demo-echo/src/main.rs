//! `nfmesh-demo-echo`: answers ICMP echo-requests in place, forwards
//! everything else unchanged. Translated from
//! `original_source/examples/ip4ping/main.c`.

mod packet;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use nfmesh_ring::Descriptor;
use nfmesh_runtime::{pin_current_thread, stats, worker, CommonArgs, FrameView, NfHandle, RuntimeContext, StatsRegistry, WorkerConfig};

#[derive(Debug, Parser)]
#[command(name = "nfmesh-demo-echo")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Descriptors handled per poll iteration.
    #[arg(long, default_value_t = 64)]
    batch_size: u32,

    /// Poll timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    poll_timeout_ms: i32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let args = Args::parse();
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
        let cpu = cpus[index % cpus.len()];
        worker_handles.push(thread::spawn(move || {
            pin_current_thread(cpu);
            let on_batch = |batch: &mut [Descriptor]| echo_batch(frame_view, batch);
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

/// Rewrite every ICMP echo-request in the batch into a reply in place and
/// forward it; everything else is forwarded untouched.
fn echo_batch(frame_view: FrameView, batch: &mut [Descriptor]) -> (worker::ForwardMask, worker::DropMask) {
    let forward = vec![true; batch.len()];
    let drop = vec![false; batch.len()];
    for desc in batch.iter() {
        let bytes = unsafe { frame_view.bytes(desc.addr) };
        let _ = packet::handle_frame(bytes, desc.len as usize);
    }
    (forward, drop)
}
