//! `nfmesh-demo-vlan-drop`: a minimal drop-policy NF. Every VLAN-tagged
//! frame (EtherType `0x8100`) is dropped; everything else is forwarded
//! unchanged. Grounded in the same Ethernet-parsing style as
//! `original_source/examples/ip4ping/main.c`'s `socket_routine`, applied to
//! a single-field policy decision instead of an ICMP rewrite.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use nfmesh_ring::Descriptor;
use nfmesh_runtime::{pin_current_thread, stats, worker, CommonArgs, FrameView, NfHandle, RuntimeContext, StatsRegistry, WorkerConfig};

const ETH_HLEN: usize = 14;
const ETHERTYPE_VLAN: [u8; 2] = [0x81, 0x00];

#[derive(Debug, Parser)]
#[command(name = "nfmesh-demo-vlan-drop")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, default_value_t = 64)]
    batch_size: u32,

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
            let on_batch = |batch: &mut [Descriptor]| vlan_drop_batch(frame_view, batch);
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

fn vlan_drop_batch(frame_view: FrameView, batch: &mut [Descriptor]) -> (worker::ForwardMask, worker::DropMask) {
    let mut forward = vec![false; batch.len()];
    let mut drop = vec![false; batch.len()];
    for (i, desc) in batch.iter().enumerate() {
        let bytes = unsafe { frame_view.bytes(desc.addr) };
        let is_vlan = desc.len as usize >= ETH_HLEN && bytes[12..14] == ETHERTYPE_VLAN;
        if is_vlan {
            drop[i] = true;
        } else {
            forward[i] = true;
        }
    }
    (forward, drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vlan_tagged_ethertype_is_recognized() {
        let mut frame = [0u8; ETH_HLEN];
        frame[12..14].copy_from_slice(&ETHERTYPE_VLAN);
        assert_eq!(&frame[12..14], &ETHERTYPE_VLAN);
    }
}
