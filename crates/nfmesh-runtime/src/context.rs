//! Shared shutdown state for the worker and stats threads, per `spec.md`
//! §5/§9: `ctrlc` flips one flag; every thread polls it at loop boundaries
//! rather than being torn down directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct RuntimeContext {
    pub done: Arc<AtomicBool>,
}

impl RuntimeContext {
    pub fn new() -> Self {
        RuntimeContext { done: Arc::new(AtomicBool::new(false)) }
    }

    /// Install `SIGINT`/`SIGTERM` handling via `ctrlc`, returning a context
    /// whose `done` flag the handler flips.
    pub fn install_signal_handler() -> Self {
        let ctx = Self::new();
        let done = ctx.done.clone();
        ctrlc::set_handler(move || done.store(true, Ordering::SeqCst))
            .expect("failed to install SIGINT/SIGTERM handler");
        ctx
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}
