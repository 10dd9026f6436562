//! `nfmesh-monitord`: the control-plane binary.

use std::sync::Arc;

use clap::Parser;
use nfmesh_ipc::Listener;
use nfmesh_monitor::{on_sigabrt, run, MonitorError, RuntimeContext};
use nfmesh_topology::Topology;

/// Monitor control-plane daemon brokering UMEM and AF_XDP socket creation
/// between NF processes.
#[derive(Debug, Parser)]
#[command(name = "nfmesh-monitord")]
struct Args {
    /// Path to the topology JSON file (`spec.md` §6).
    #[arg(long)]
    topology: std::path::PathBuf,

    /// Rendezvous socket path; overrides `NFMESH_SOCK` if given.
    #[arg(long)]
    sock: Option<std::path::PathBuf>,
}

fn main() -> Result<(), MonitorError> {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let args = Args::parse();
    if let Some(sock) = &args.sock {
        std::env::set_var("NFMESH_SOCK", sock);
    }

    let topology = Arc::new(Topology::load(&args.topology)?);
    log::info!(
        "loaded topology: {} umem group(s), {} route entries",
        topology.umem.len(),
        topology.route.len()
    );

    let ctx = RuntimeContext::new();

    // SIGABRT per `original_source/monitor/main.c`'s `int_exit` registration.
    unsafe {
        libc::signal(libc::SIGABRT, on_sigabrt as libc::sighandler_t);
    }
    // SIGINT/SIGTERM via `ctrlc`, touching the same shared flag.
    let done = ctx.done.clone();
    ctrlc::set_handler(move || {
        done.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .expect("failed to install SIGINT/SIGTERM handler");

    let listener = Listener::bind(nfmesh_ipc::socket_path())?;
    log::info!("listening on {}", nfmesh_ipc::socket_path().display());

    run(listener, topology, ctx)
}
