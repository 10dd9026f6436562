use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("topology error: {0}")]
    Config(#[from] nfmesh_topology::ConfigError),

    #[error("ipc error: {0}")]
    Ipc(#[from] nfmesh_ipc::IpcError),

    #[error("xdp socket/umem error: {0}")]
    Xsk(#[from] nfmesh_xsk::Errno),

    #[error("umem {0} is not present in the topology file")]
    UnknownUmem(u16),

    #[error("umem {umem_id} has no nf entry {nf_id}")]
    UnknownNf { umem_id: u16, nf_id: u16 },

    #[error("frame pool exhausted: {0}")]
    Frame(&'static str),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
