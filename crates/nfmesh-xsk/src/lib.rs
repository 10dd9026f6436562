//! AF_XDP socket setup: UMEM registration, the four kernel-shared rings,
//! and the batch reserve/peek views an NF's receive/transmit loop drives.
//!
//! This crate only talks to one kernel socket at a time; chaining frames
//! between NF threads on the same host is `nfmesh-ring`'s job, not this
//! crate's.

mod iface;
mod remote;
mod ring;
mod shared;
mod socket;
pub mod umem;
mod user;
/// Bindings for XDP (kernel-interface).
pub mod xdp;

pub use iface::{IfCtx, IfInfo, SocketMmapOffsets};
pub use remote::RemoteSocket;
pub use shared::{create_shared, map_shared_fd, parse_flag_chars, BindFlags, BusyPoll, XdpFlags};
pub use socket::Socket;
pub use umem::{DeviceQueue, RxTx, SocketConfig, Umem, UmemConfig};
pub use user::{ReadComplete, ReadRx, RxRing, TxRing, WriteFill, WriteTx};

pub(crate) use socket::SocketFd;

/// `SOL_XDP`, not present in the `libc` crate as of this writing.
pub(crate) const SOL_XDP: libc::c_int = 283;

/// An index into a ring's backing array, always used modulo the ring's
/// power-of-two size.
#[derive(Debug, Default, Copy, Clone)]
pub struct BufIdx(pub(crate) u32);

pub(crate) struct LastErrno;

/// A raw `errno` value, with `Display`/`Debug` via `strerror`.
pub struct Errno(libc::c_int);

impl From<LastErrno> for Errno {
    fn from(LastErrno: LastErrno) -> Self {
        Errno::new()
    }
}

impl Errno {
    pub(crate) fn new() -> Self {
        Errno(unsafe { *libc::__errno_location() })
    }

    pub(crate) fn from_raw(code: libc::c_int) -> Self {
        Errno(code)
    }

    pub fn raw_os_error(&self) -> libc::c_int {
        self.0
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { core::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl std::fmt::Debug for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

impl std::error::Error for Errno {}
