use thiserror::Error;

/// Everything that can go wrong on the Monitor<->NF rendezvous channel.
///
/// Per the propagation policy, any of these closes the channel; the NF
/// side aborts its own bring-up rather than retrying.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("io error on rendezvous channel: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer closed the connection")]
    Disconnected,

    #[error("unrecognized command code {0}")]
    UnknownCommand(u32),

    #[error("expected command {expected:?}, got {actual:?}")]
    UnexpectedCommand { expected: crate::CommandCode, actual: crate::CommandCode },

    #[error("sendmsg/recvmsg did not carry the expected ancillary fd")]
    MissingAncillaryFd,

    #[error("fd-passing syscall failed: {0}")]
    Errno(i32),
}
