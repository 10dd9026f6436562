//! Anonymous sealed-memory UMEMs for `SCM_RIGHTS` hand-off to sibling NF
//! processes, and the topology file's flag vocabulary.

use core::ffi::CStr;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::{Errno, LastErrno, Umem, UmemConfig};

/// XDP program attach mode. One bit set per topology `xdp_flags` character.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct XdpFlags(pub u32);

impl XdpFlags {
    pub const SKB_MODE: u32 = 1 << 1;
    pub const DRV_MODE: u32 = 1 << 2;
    pub const HW_MODE: u32 = 1 << 3;
}

/// Socket bind mode. One bit set per topology `bind_flags` character.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BindFlags(pub u16);

impl BindFlags {
    pub const SHARED_UMEM: u16 = 1 << 0;
    pub const COPY: u16 = 1 << 1;
    pub const ZEROCOPY: u16 = 1 << 2;
    pub const USE_NEED_WAKEUP: u16 = 1 << 3;
}

/// Parse a topology file's per-character `xdp_flags`/`bind_flags` string
/// (`s`/`d`/`h`/`c`/`z`; `b`/`m`/`p` select queue polling mode and carry no
/// socket flag of their own) into the kernel bitmasks.
///
/// The kernel itself refuses software copy mode (`s`) combined with
/// zerocopy (`z`); this rejects that combination up front.
pub fn parse_flag_chars(chars: &str) -> Result<(XdpFlags, BindFlags), Errno> {
    let mut xdp = 0u32;
    let mut bind = 0u16;
    for c in chars.chars() {
        match c {
            's' => xdp |= XdpFlags::SKB_MODE,
            'd' => xdp |= XdpFlags::DRV_MODE,
            'h' => xdp |= XdpFlags::HW_MODE,
            'c' => bind |= BindFlags::COPY,
            'z' => bind |= BindFlags::ZEROCOPY,
            'b' | 'm' | 'p' => {}
            _ => return Err(Errno::from_raw(libc::EINVAL)),
        }
    }
    if xdp & XdpFlags::SKB_MODE != 0 && bind & BindFlags::ZEROCOPY != 0 {
        return Err(Errno::from_raw(libc::EINVAL));
    }
    Ok((XdpFlags(xdp), BindFlags(bind)))
}

/// `SO_PREFER_BUSY_POLL`/`SO_BUSY_POLL`/`SO_BUSY_POLL_BUDGET` as one config
/// value, applied to a socket once it is bound.
#[derive(Debug, Default, Copy, Clone)]
pub struct BusyPoll {
    pub prefer_busy_poll: bool,
    pub busy_poll_usecs: u32,
    pub busy_poll_budget: u32,
}

impl BusyPoll {
    const SO_PREFER_BUSY_POLL: libc::c_int = 69;
    const SO_BUSY_POLL_BUDGET: libc::c_int = 70;

    pub fn apply(&self, fd: libc::c_int) -> Result<(), Errno> {
        unsafe {
            if self.prefer_busy_poll {
                let one: libc::c_int = 1;
                setsockopt(fd, Self::SO_PREFER_BUSY_POLL, &one)?;
            }
            if self.busy_poll_usecs > 0 {
                setsockopt(fd, libc::SO_BUSY_POLL, &self.busy_poll_usecs)?;
            }
            if self.busy_poll_budget > 0 {
                setsockopt(fd, Self::SO_BUSY_POLL_BUDGET, &self.busy_poll_budget)?;
            }
        }
        Ok(())
    }
}

unsafe fn setsockopt<T>(fd: libc::c_int, name: libc::c_int, value: &T) -> Result<(), Errno> {
    let err = libc::setsockopt(
        fd,
        libc::SOL_SOCKET,
        name,
        value as *const T as *const libc::c_void,
        core::mem::size_of::<T>() as libc::socklen_t,
    );
    if err != 0 {
        return Err(Errno::new());
    }
    Ok(())
}

/// Create a `Umem` backed by an anonymous, size-sealed `memfd`, so its file
/// descriptor can be handed to sibling NF processes over `SCM_RIGHTS`
/// without either side being able to resize or unseal the mapping.
///
/// Sealing failure is not fatal: older kernels without `F_ADD_SEALS`
/// support still get a working, merely unsealed, shared region.
pub fn create_shared(size: usize, config: UmemConfig) -> Result<(Umem, OwnedFd), Errno> {
    let name = CStr::from_bytes_with_nul(b"nfmesh-umem\0").expect("static nul-terminated name");
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(LastErrno.into());
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
        return Err(LastErrno.into());
    }

    let mmap = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if mmap == libc::MAP_FAILED {
        return Err(LastErrno.into());
    }

    let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_SEAL;
    unsafe { libc::fcntl(fd, libc::F_ADD_SEALS, seals) };

    let slice = core::ptr::slice_from_raw_parts_mut(mmap as *mut u8, size);
    let area = NonNull::new(slice).expect("mmap returned non-null on success");

    let umem = unsafe { Umem::new(config, area) }?;
    Ok((umem, owned))
}

/// Map a shared memfd this process did not create itself (typically just
/// received as `SCM_RIGHTS` ancillary data from the Monitor) into its own
/// address space, without registering a second `Umem` over it.
///
/// Grounded on `flash_nf.c`'s `xsk_mmap_umem_rings`, which maps a received
/// UMEM fd directly rather than repeating `XDP_UMEM_REG`.
pub fn map_shared_fd(fd: libc::c_int, size: usize) -> Result<NonNull<[u8]>, Errno> {
    let mmap = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if mmap == libc::MAP_FAILED {
        return Err(LastErrno.into());
    }
    let slice = core::ptr::slice_from_raw_parts_mut(mmap as *mut u8, size);
    Ok(NonNull::new(slice).expect("mmap returned non-null on success"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_driver_mode_with_zerocopy() {
        let (xdp, bind) = parse_flag_chars("dz").unwrap();
        assert_eq!(xdp.0, XdpFlags::DRV_MODE);
        assert_eq!(bind.0, BindFlags::ZEROCOPY);
    }

    #[test]
    fn rejects_skb_mode_with_zerocopy() {
        assert!(parse_flag_chars("sz").is_err());
    }

    #[test]
    fn mode_only_characters_set_no_flag() {
        let (xdp, bind) = parse_flag_chars("b").unwrap();
        assert_eq!(xdp.0, 0);
        assert_eq!(bind.0, 0);
    }

    #[test]
    fn rejects_unknown_character() {
        assert!(parse_flag_chars("q").is_err());
    }
}
