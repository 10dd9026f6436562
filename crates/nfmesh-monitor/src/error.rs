use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("topology error: {0}")]
    Config(#[from] nfmesh_topology::ConfigError),

    #[error("ipc error: {0}")]
    Ipc(#[from] nfmesh_ipc::IpcError),

    #[error("xdp socket/umem error: {0}")]
    Xsk(#[from] nfmesh_xsk::Errno),

    #[error("unexpected command {0:?} for connection state {1}")]
    UnexpectedCommand(nfmesh_ipc::CommandCode, &'static str),

    #[error("umem {0} is not registered")]
    UnknownUmem(u16),

    #[error("umem {umem_id} has no nf entry {nf_id}")]
    UnknownNf { umem_id: u16, nf_id: u16 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
