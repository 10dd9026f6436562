//! The Monitor<->NF rendezvous protocol: a 4-byte command code, an optional
//! fixed-size payload, and an optional `SCM_RIGHTS`-passed file descriptor,
//! all on one `AF_UNIX` stream socket per NF connection.
//!
//! Grounded on `lib/flash/uds/flash_uds.c`'s `send_cmd`/`recv_cmd`/
//! `send_fd`/`recv_fd`, generalized from that file's single always-open
//! `int` command field into the full ten-command vocabulary this system
//! needs (the original only distinguished `CREATE_UMEM`/`GET_UMEM`/
//! `CREATE_SOCKET`/`CLOSE_CONN`/`GET_THREAD_INFO`/`GET_UMEM_OFFSET`; the
//! `REPLY_*` counterparts are synchronous replies on the same connection,
//! not separate commands, in the original — split out here so each
//! direction of the exchange has its own distinct, matchable value).

mod error;

use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

pub use error::IpcError;

/// Default rendezvous path, overridable with `NFMESH_SOCK` so tests and
/// non-root hosts don't need to share `/var/run`.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/flash/sock";

pub fn socket_path() -> PathBuf {
    std::env::var_os("NFMESH_SOCK")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

/// The command vocabulary of §4.E, one 4-byte little-endian code per
/// message, always sent before its payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandCode {
    CreateUmem = 1,
    GetUmem = 2,
    ReplyUmem = 3,
    GetThreadInfo = 4,
    ReplyThreadInfo = 5,
    CreateSocket = 6,
    ReplySocket = 7,
    GetFrOffset = 8,
    ReplyFrOffset = 9,
    CloseConn = 10,
}

impl TryFrom<u32> for CommandCode {
    type Error = IpcError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => CommandCode::CreateUmem,
            2 => CommandCode::GetUmem,
            3 => CommandCode::ReplyUmem,
            4 => CommandCode::GetThreadInfo,
            5 => CommandCode::ReplyThreadInfo,
            6 => CommandCode::CreateSocket,
            7 => CommandCode::ReplySocket,
            8 => CommandCode::GetFrOffset,
            9 => CommandCode::ReplyFrOffset,
            10 => CommandCode::CloseConn,
            other => return Err(IpcError::UnknownCommand(other)),
        })
    }
}

/// `GET_UMEM` payload.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetUmem {
    pub nf_id: u16,
    pub umem_id: u16,
}

/// `REPLY_UMEM` payload; the UMEM fd itself travels as ancillary data.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ReplyUmem {
    pub thread_count: u16,
    pub umem_size: u64,
}

/// `REPLY_THREAD_INFO` payload.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ReplyThreadInfo {
    pub total_sockets: u16,
}

/// `CREATE_SOCKET` payload.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CreateSocket {
    pub nf_id: u16,
    pub thread_index: u16,
}

/// `REPLY_FR_OFFSET` payload.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ReplyFrOffset {
    pub offset: i32,
}

/// `CLOSE_CONN` payload.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CloseConn {
    pub umem_id: u16,
    pub nf_id: u16,
}

/// One end of the rendezvous connection: a command code followed by its
/// payload and optional ancillary fd, all synchronous.
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        Ok(Channel { stream: UnixStream::connect(path.as_ref())? })
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Channel { stream }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.stream.as_raw_fd()
    }

    pub fn send_command(&mut self, cmd: CommandCode) -> Result<(), IpcError> {
        self.stream.write_all(&(cmd as u32).to_ne_bytes())?;
        Ok(())
    }

    pub fn recv_command(&mut self) -> Result<CommandCode, IpcError> {
        let mut buf = [0u8; 4];
        self.read_exact_or_disconnect(&mut buf)?;
        CommandCode::try_from(u32::from_ne_bytes(buf))
    }

    pub fn expect_command(&mut self, expected: CommandCode) -> Result<(), IpcError> {
        let actual = self.recv_command()?;
        if actual != expected {
            return Err(IpcError::UnexpectedCommand { expected, actual });
        }
        Ok(())
    }

    /// Write `value`'s raw bytes as the payload of the message just sent
    /// with [`send_command`](Self::send_command). Safe for the `#[repr(C)]`
    /// fixed-size structs in this module; never used for anything else.
    pub fn send_payload<T: Copy>(&mut self, value: &T) -> Result<(), IpcError> {
        let bytes = unsafe {
            std::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
        };
        self.stream.write_all(bytes)?;
        Ok(())
    }

    pub fn recv_payload<T: Copy + Default>(&mut self) -> Result<T, IpcError> {
        let mut value = T::default();
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(&mut value as *mut T as *mut u8, core::mem::size_of::<T>())
        };
        self.read_exact_or_disconnect(bytes)?;
        Ok(value)
    }

    fn read_exact_or_disconnect(&mut self, buf: &mut [u8]) -> Result<(), IpcError> {
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(IpcError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }

    /// Send `fd` as `SCM_RIGHTS` ancillary data, with one byte of real
    /// payload (required by `sendmsg` to actually carry ancillary data).
    pub fn send_fd(&mut self, fd: RawFd) -> Result<(), IpcError> {
        use std::os::unix::io::AsRawFd;

        let mut cmsg_buf = [0u8; 32];
        let iov_byte: [u8; 1] = [0];
        let mut iov = libc::iovec {
            iov_base: iov_byte.as_ptr() as *mut libc::c_void,
            iov_len: 1,
        };

        let mut msg: libc::msghdr = unsafe { core::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len();

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(core::mem::size_of::<RawFd>() as u32) as libc::size_t;
            core::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
        }

        let sent = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, 0) };
        if sent < 0 {
            return Err(IpcError::Errno(unsafe { *libc::__errno_location() }));
        }
        Ok(())
    }

    /// Receive one `SCM_RIGHTS`-passed fd.
    pub fn recv_fd(&mut self) -> Result<RawFd, IpcError> {
        use std::os::unix::io::AsRawFd;

        let mut cmsg_buf = [0u8; 32];
        let mut iov_byte = [0u8; 1];
        let mut iov = libc::iovec {
            iov_base: iov_byte.as_mut_ptr() as *mut libc::c_void,
            iov_len: 1,
        };

        let mut msg: libc::msghdr = unsafe { core::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len();

        let received = unsafe { libc::recvmsg(self.stream.as_raw_fd(), &mut msg, 0) };
        if received < 0 {
            return Err(IpcError::Errno(unsafe { *libc::__errno_location() }));
        }

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            return Err(IpcError::MissingAncillaryFd);
        }

        let fd = unsafe { core::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd) };
        Ok(fd)
    }
}

/// The Monitor's listening end of the rendezvous path: binds, sets
/// group-writable permissions, and unlinks on drop.
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
}

impl Listener {
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let inner = UnixListener::bind(&path)?;

        let c_path = std::ffi::CString::new(path.as_os_str().to_string_lossy().into_owned())
            .map_err(|_| IpcError::Errno(libc::EINVAL))?;
        unsafe { libc::chmod(c_path.as_ptr(), 0o770) };

        Ok(Listener { inner, path })
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), IpcError> {
        self.inner.set_nonblocking(nonblocking)?;
        Ok(())
    }

    pub fn accept(&self) -> Result<Channel, IpcError> {
        let (stream, _addr) = self.inner.accept()?;
        Ok(Channel::from_stream(stream))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.inner.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn command_roundtrips_through_try_from() {
        for code in [
            CommandCode::CreateUmem,
            CommandCode::GetUmem,
            CommandCode::ReplyUmem,
            CommandCode::GetThreadInfo,
            CommandCode::ReplyThreadInfo,
            CommandCode::CreateSocket,
            CommandCode::ReplySocket,
            CommandCode::GetFrOffset,
            CommandCode::ReplyFrOffset,
            CommandCode::CloseConn,
        ] {
            assert_eq!(CommandCode::try_from(code as u32).unwrap(), code);
        }
    }

    #[test]
    fn unknown_command_code_is_rejected() {
        assert!(matches!(CommandCode::try_from(999), Err(IpcError::UnknownCommand(999))));
    }

    #[test]
    fn command_and_payload_roundtrip_over_a_socketpair() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut client = Channel::from_stream(a);
        let mut server = Channel::from_stream(b);

        client.send_command(CommandCode::GetUmem).unwrap();
        client.send_payload(&GetUmem { nf_id: 7, umem_id: 3 }).unwrap();

        server.expect_command(CommandCode::GetUmem).unwrap();
        let payload: GetUmem = server.recv_payload().unwrap();
        assert_eq!(payload.nf_id, 7);
        assert_eq!(payload.umem_id, 3);
    }

    #[test]
    fn disconnect_mid_read_is_reported_distinctly() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let mut server = Channel::from_stream(b);
        assert!(matches!(server.recv_command(), Err(IpcError::Disconnected)));
    }

    #[test]
    fn fd_passes_over_scm_rights() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut client = Channel::from_stream(a);
        let mut server = Channel::from_stream(b);

        let tmp = std::env::temp_dir().join("nfmesh-ipc-fd-test");
        let file = std::fs::File::create(&tmp).unwrap();
        client.send_fd(file.as_raw_fd()).unwrap();

        let received = server.recv_fd().unwrap();
        assert!(received >= 0);
        unsafe { libc::close(received) };
        let _ = std::fs::remove_file(&tmp);
    }
}
