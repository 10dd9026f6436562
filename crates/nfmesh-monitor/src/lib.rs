//! Monitor control-plane daemon: a `UnixListener` accept loop handing out
//! UMEM/socket fds to attaching NF processes, translated from
//! `original_source/monitor/main.c` and `lib/flash/monitor/flash_monitor.c`.

mod connection;
mod context;
mod error;
mod registry;

pub use context::{on_sigabrt, RuntimeContext};
pub use error::MonitorError;
pub use registry::{UmemEntry, UmemRegistry};

use std::os::unix::io::RawFd;
use std::sync::Arc;

use nfmesh_ipc::{IpcError, Listener};
use nfmesh_topology::Topology;

/// Budget for the accept-loop `poll()`, matching `worker__uds_server`'s
/// 100ms timeout so the loop re-checks `done` at a bounded cadence instead
/// of blocking on `accept()` forever.
const ACCEPT_POLL_MS: i32 = 100;

/// Run the accept loop until `ctx` observes a shutdown request, spawning
/// one thread per accepted connection (`handle_nf` in the original).
pub fn run(listener: Listener, topology: Arc<Topology>, ctx: RuntimeContext) -> Result<(), MonitorError> {
    listener.set_nonblocking(true)?;
    let registry = Arc::new(UmemRegistry::new());
    let mut handles = Vec::new();

    while !ctx.is_done() {
        if !poll_readable(listener.as_raw_fd(), ACCEPT_POLL_MS) {
            handles.retain(|h: &std::thread::JoinHandle<()>| !h.is_finished());
            continue;
        }
        match listener.accept() {
            Ok(channel) => {
                let topology = topology.clone();
                let registry = registry.clone();
                handles.push(std::thread::spawn(move || {
                    if let Err(e) = connection::handle_nf(channel, topology, registry) {
                        log::warn!("nf connection handler exited with error: {e}");
                    }
                }));
            }
            Err(IpcError::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("accept failed: {e}"),
        }
        handles.retain(|h| !h.is_finished());
    }

    log::info!("shutdown requested, waiting for {} live nf connection(s)", handles.len());
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn poll_readable(fd: RawFd, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    ret > 0 && pfd.revents & libc::POLLIN != 0
}
