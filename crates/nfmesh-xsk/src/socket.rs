//! The raw XDP socket file descriptor and the per-interface binding atop it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{Errno, IfInfo, LastErrno, Umem};

/// Reference-counted XDP socket options, `SO_NETNS_COOKIE` at bind time.
pub struct Socket {
    pub(crate) fd: Arc<SocketFd>,
    pub(crate) info: Arc<IfInfo>,
    /// Set only for sockets created via [`Socket::with_shared`]: the
    /// originating `Umem`'s live-socket count, decremented on drop.
    umem_refcount: Option<Arc<AtomicUsize>>,
}

/// The raw kernel socket. Exactly one of these is ever created per
/// independent `socket(AF_XDP, ...)` call; every other handle shares it
/// through an `Arc`, and the descriptor is closed when the last one drops.
pub(crate) struct SocketFd(libc::c_int);

impl Socket {
    const SO_NETNS_COOKIE: libc::c_int = 71;
    const INIT_NS: u64 = 1;

    /// Open a new, unshared XDP socket bound to `interface`.
    pub fn new(interface: &IfInfo) -> Result<Self, Errno> {
        let fd = Arc::new(SocketFd::new()?);
        Self::with_xdp_socket(interface, fd, None)
    }

    /// Open a socket that shares its `Umem`'s underlying file descriptor.
    /// The `Umem`'s [`refcount`](Umem::refcount) is incremented for the
    /// lifetime of the returned `Socket`.
    pub fn with_shared(interface: &IfInfo, umem: &Umem) -> Result<Self, Errno> {
        let refcount = umem.refcount_handle();
        refcount.fetch_add(1, Ordering::AcqRel);
        match Self::with_xdp_socket(interface, umem.fd_handle(), Some(refcount.clone())) {
            Ok(socket) => Ok(socket),
            Err(err) => {
                refcount.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    fn with_xdp_socket(
        interface: &IfInfo,
        fd: Arc<SocketFd>,
        umem_refcount: Option<Arc<AtomicUsize>>,
    ) -> Result<Self, Errno> {
        let mut info = Arc::new(*interface);

        let mut netnscookie: u64 = 0;
        let mut optlen: libc::socklen_t = core::mem::size_of_val(&netnscookie) as libc::socklen_t;
        let err = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                Self::SO_NETNS_COOKIE,
                (&mut netnscookie) as *mut _ as *mut libc::c_void,
                &mut optlen,
            )
        };

        match err {
            0 => {}
            _ if unsafe { *libc::__errno_location() } == libc::ENOPROTOOPT => netnscookie = Self::INIT_NS,
            _ => return Err(LastErrno.into()),
        }

        Arc::make_mut(&mut info).ctx.netnscookie = netnscookie;

        log::debug!(
            "opened xdp socket fd={} ifindex={} queue={} netns={}",
            fd.as_raw_fd(),
            info.ctx.ifindex,
            info.ctx.queue_id,
            netnscookie
        );

        Ok(Socket { fd, info, umem_refcount })
    }

    pub fn as_raw_fd(&self) -> libc::c_int {
        self.fd.as_raw_fd()
    }

    pub fn info(&self) -> &IfInfo {
        &self.info
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(refcount) = &self.umem_refcount {
            refcount.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl SocketFd {
    pub(crate) fn new() -> Result<Self, Errno> {
        let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(LastErrno.into());
        }
        Ok(SocketFd(fd))
    }

    /// Wrap an fd this process now owns exclusively (e.g. one just received
    /// over `SCM_RIGHTS`) without opening a new kernel socket.
    ///
    /// # Safety
    /// `fd` must be a valid, open descriptor not already owned elsewhere.
    pub(crate) unsafe fn from_raw_fd(fd: libc::c_int) -> Self {
        SocketFd(fd)
    }

    pub(crate) fn as_raw_fd(&self) -> libc::c_int {
        self.0
    }

    /// Query a socket option into a scratch value sized exactly for `T`,
    /// returning the length the kernel actually wrote (some options have a
    /// shorter legacy layout, distinguished by this length).
    pub(crate) fn get_opt<T>(&self, level: libc::c_int, name: libc::c_int, value: &T) -> Result<libc::socklen_t, Errno> {
        let mut len = core::mem::size_of::<T>() as libc::socklen_t;
        let err = unsafe {
            libc::getsockopt(
                self.0,
                level,
                name,
                value as *const T as *mut libc::c_void,
                &mut len,
            )
        };
        if err != 0 {
            return Err(Errno::new());
        }
        Ok(len)
    }

    pub(crate) fn set_opt<T>(&self, level: libc::c_int, name: libc::c_int, value: &T) -> Result<(), Errno> {
        let err = unsafe {
            libc::setsockopt(
                self.0,
                level,
                name,
                value as *const T as *const libc::c_void,
                core::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if err != 0 {
            return Err(Errno::new());
        }
        Ok(())
    }
}

impl Drop for SocketFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}
