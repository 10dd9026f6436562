use thiserror::Error;

/// Everything that can go wrong loading or validating a topology file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading topology file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing topology json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid flag string {flags:?}: {reason}")]
    InvalidFlags { flags: String, reason: String },

    #[error("umem {umem_id} mode {mode:?} is not one of \"\"/b/m/p")]
    InvalidMode { umem_id: u16, mode: String },

    #[error("duplicate nf_id {nf_id}")]
    DuplicateNf { nf_id: u16 },

    #[error("nf {nf_id} has duplicate thread_id {thread_id}")]
    DuplicateThread { nf_id: u16, thread_id: u16 },

    #[error("route entry for nf {from} references unknown nf {to}")]
    UnknownRouteTarget { from: u16, to: u16 },

    #[error("route entry key {key:?} does not name a known nf id")]
    UnknownRouteSource { key: String },

    #[error("umem {umem_id}: {thread_count} threads but {queue_count} distinct queues (need a 1:1 mapping)")]
    QueueCountMismatch {
        umem_id: u16,
        thread_count: usize,
        queue_count: usize,
    },

    #[error("umem {umem_id} declares no nf entries")]
    EmptyUmem { umem_id: u16 },
}
