//! Interface identification and the kernel-queried ring mmap offsets.

use core::ffi::CStr;

use crate::socket::SocketFd;
use crate::xdp::{XdpMmapOffsets, XdpMmapOffsetsV1, XdpRingOffsets, XdpRingOffsetsV1, XdpStatistics, XdpStatisticsV2};
use crate::{Errno, LastErrno, SOL_XDP};

/// The device-control key: one entry per `(ifindex, queue_id, netns)`
/// triple, used to reject two fill/completion queues claiming the same
/// queue.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IfCtx {
    pub ifindex: u32,
    pub queue_id: u32,
    pub netnscookie: u64,
}

/// Identifies a network interface and queue to bind an XDP socket to.
#[derive(Debug, Copy, Clone)]
pub struct IfInfo {
    pub(crate) ctx: IfCtx,
    ifname: [libc::c_char; libc::IFNAMSIZ],
}

impl IfInfo {
    /// An info referring to no device, suitable to overwrite.
    pub fn invalid() -> Self {
        IfInfo {
            ctx: IfCtx::default(),
            ifname: [0; libc::IFNAMSIZ],
        }
    }

    /// Resolve by interface name (e.g. `eth0`).
    pub fn from_name(&mut self, name: &CStr) -> Result<(), Errno> {
        let bytes = name.to_bytes_with_nul();
        if bytes.len() > self.ifname.len() {
            return Err(Errno::from_raw(libc::EINVAL));
        }

        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(LastErrno.into());
        }

        self.ctx.ifindex = index;
        self.ctx.queue_id = 0;
        self.ctx.netnscookie = 0;
        for (dst, &src) in self.ifname.iter_mut().zip(bytes.iter()) {
            *dst = src as libc::c_char;
        }
        Ok(())
    }

    /// Resolve by kernel interface index.
    pub fn from_ifindex(&mut self, index: libc::c_uint) -> Result<(), Errno> {
        let ok = unsafe { libc::if_indextoname(index, self.ifname.as_mut_ptr()) };
        if ok.is_null() {
            return Err(LastErrno.into());
        }
        self.ctx.ifindex = index;
        Ok(())
    }

    pub fn set_queue(&mut self, queue_id: u32) {
        self.ctx.queue_id = queue_id;
    }

    pub fn ifindex(&self) -> u32 {
        self.ctx.ifindex
    }

    pub fn queue_id(&self) -> u32 {
        self.ctx.queue_id
    }
}

/// The mmap offsets for all four rings of one socket, as reported by the
/// kernel for the running kernel version (pre/post Linux 5.3's addition of
/// the `flags` field).
#[derive(Debug, Default, Copy, Clone)]
pub struct SocketMmapOffsets {
    pub(crate) inner: XdpMmapOffsets,
}

impl SocketMmapOffsets {
    const OPT_V1: libc::socklen_t = core::mem::size_of::<XdpMmapOffsetsV1>() as libc::socklen_t;
    const OPT_LATEST: libc::socklen_t = core::mem::size_of::<XdpMmapOffsets>() as libc::socklen_t;

    pub(crate) fn query(sock: &SocketFd) -> Result<Self, Errno> {
        fn fixup_v1(v1: XdpRingOffsetsV1) -> XdpRingOffsets {
            XdpRingOffsets {
                producer: v1.producer,
                consumer: v1.consumer,
                desc: v1.desc,
                flags: v1.consumer + core::mem::size_of::<u32>() as u64,
            }
        }

        union Offsets {
            v1: XdpMmapOffsetsV1,
            latest: XdpMmapOffsets,
        }

        let scratch = Offsets { latest: XdpMmapOffsets::default() };
        let probe = unsafe { &scratch.latest };
        let len = sock.get_opt(SOL_XDP, crate::umem::XDP_MMAP_OFFSETS, probe)?;

        match len {
            Self::OPT_V1 => {
                let v1 = unsafe { scratch.v1 };
                Ok(SocketMmapOffsets {
                    inner: XdpMmapOffsets {
                        rx: fixup_v1(v1.rx),
                        tx: fixup_v1(v1.tx),
                        fr: fixup_v1(v1.fr),
                        cr: fixup_v1(v1.cr),
                    },
                })
            }
            Self::OPT_LATEST => Ok(SocketMmapOffsets { inner: unsafe { scratch.latest } }),
            _ => Err(Errno::from_raw(libc::EINVAL)),
        }
    }
}

pub(crate) fn query_statistics(sock: &SocketFd) -> Result<XdpStatistics, Errno> {
    let stats = XdpStatistics::default();
    sock.get_opt(SOL_XDP, crate::umem::XDP_STATISTICS, &stats)?;
    Ok(stats)
}

pub(crate) fn query_statistics_v2(sock: &SocketFd) -> Result<XdpStatisticsV2, Errno> {
    let stats = XdpStatisticsV2::default();
    sock.get_opt(SOL_XDP, crate::umem::XDP_STATISTICS, &stats)?;
    Ok(stats)
}
