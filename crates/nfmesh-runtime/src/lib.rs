//! NF attach sequence, per-thread receive/process/send loop, backpressure,
//! and stats collection, built atop `nfmesh-xsk`'s socket/ring primitives.
//! Demo binaries under `demos/` supply only the packet-decision closure
//! (`worker::run`'s `on_batch`); everything else here is shared.

pub mod affinity;
pub mod attach;
pub mod cli;
pub mod context;
pub mod error;
pub mod session;
pub mod stats;
pub mod worker;

pub use affinity::pin_current_thread;
pub use attach::{FrameView, NfHandle, ThreadAttachment};
pub use cli::CommonArgs;
pub use context::RuntimeContext;
pub use error::Error;
pub use session::SessionKey;
pub use stats::{SocketStats, StatsRegistry};
pub use worker::{DropMask, ForwardMask, SiblingRouter, WorkerConfig};
