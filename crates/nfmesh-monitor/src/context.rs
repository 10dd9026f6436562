//! Shared shutdown state for the accept loop and every connection handler
//! it spawns, per `spec.md` §5/§9: one flag, flipped only by a signal
//! handler, consulted at loop boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// `ctrlc` covers `SIGINT`/`SIGTERM` by cloning `done` into its closure.
/// `SIGABRT` (installed separately in `main`, mirroring
/// `original_source/monitor/main.c`'s `int_exit` registration for it) can't
/// safely touch an arbitrary `Arc`'s heap allocation from a C signal
/// handler, so it sets this process-wide flag instead; [`RuntimeContext::is_done`]
/// checks both.
pub(crate) static SIGABRT_RECEIVED: AtomicBool = AtomicBool::new(false);

pub(crate) extern "C" fn on_sigabrt(_signum: libc::c_int) {
    SIGABRT_RECEIVED.store(true, Ordering::SeqCst);
}

#[derive(Clone)]
pub struct RuntimeContext {
    pub done: Arc<AtomicBool>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        RuntimeContext { done: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst) || SIGABRT_RECEIVED.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.done.store(true, Ordering::SeqCst);
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}
