//! The NF attach sequence: connect to the Monitor, negotiate the shared
//! UMEM and one socket per configured thread, map everything locally, and
//! seed the FILL ring. Translated from `original_source/lib/flash/nf/
//! flash_nf.c`'s `__configure`/`flash__populate_fill_ring`.

use core::ptr::NonNull;

use nfmesh_ipc::{Channel, CloseConn, CommandCode, CreateSocket, GetUmem, ReplyFrOffset, ReplyThreadInfo, ReplyUmem};
use nfmesh_ring::FramePool;
use nfmesh_topology::{NfConfig, Topology, UmemGroup};
use nfmesh_xsk::{map_shared_fd, DeviceQueue, RemoteSocket, RxRing, SocketConfig, TxRing};

use crate::cli::CommonArgs;
use crate::error::Error;

/// Frame size assumed for every UMEM this runtime attaches to. The
/// topology file doesn't carry one (unlike `UmemConfig` on the Monitor
/// side, which is entirely a Monitor-internal detail); both sides agree on
/// it as a fixed constant, matching `flash_nf.c`'s hardcoded `FRAME_SIZE`.
pub const FRAME_SIZE: u32 = 1 << 12;

/// Total frames budgeted per thread when the Monitor sizes the shared
/// region, matching `nfmesh-monitor::registry::FRAMES_PER_THREAD`. Half
/// seed the FILL ring at attach, half become this thread's local
/// allocation pool for frames it originates (TX-only packets).
const FRAMES_PER_THREAD: u32 = 2 * 2048;
const FILL_SEED_PER_THREAD: u32 = 2048;
const RX_RING_SIZE: u32 = 2048;
const TX_RING_SIZE: u32 = 2048;

/// One attached thread's mapped rings. Every thread maps its own
/// fill/completion pair: the kernel keys FILL/COMPLETION registration to
/// the bound `(ifindex, queue_id, netns)` triple, not to the UMEM as a
/// whole, and topology validation guarantees every thread in a group binds
/// a distinct queue, so each needs its own `DeviceQueue`.
pub struct ThreadAttachment {
    pub thread_id: u16,
    pub queue: u8,
    pub rx: RxRing,
    pub tx: TxRing,
    pub fill: DeviceQueue,
    /// This thread's own frame addresses for originating packets (the half
    /// of its budgeted stride not handed to the FILL ring at attach).
    pub pool: FramePool,
}

/// A fully attached NF: the mapped UMEM region, every configured thread's
/// rings, and the sibling-routing fan-out list for this NF's id.
pub struct NfHandle {
    pub nf_id: u16,
    pub umem_id: u16,
    pub frame_size: u32,
    pub headroom: i32,
    pub umem_area: NonNull<[u8]>,
    pub threads: Vec<ThreadAttachment>,
    pub next_hops: Vec<u16>,
    channel: Channel,
}

// Safety: `umem_area` is a mmap'd region this handle alone mutates through
// `frame_bytes`, one frame at a time, never concurrently for the same
// frame from two threads (enforced by FILL/COMPLETION ownership).
unsafe impl Send for NfHandle {}

impl NfHandle {
    /// Run the full attach sequence.
    pub fn attach(args: &CommonArgs) -> Result<NfHandle, Error> {
        let topology = Topology::load(&args.topology)?;
        let group = find_group(&topology, args.umem_id)?;
        let nf = find_nf(group, args.nf_id)?.clone();

        let mut channel = Channel::connect(nfmesh_ipc::socket_path())?;
        let (umem_fd, umem_size) = if args.primary {
            negotiate_primary(&mut channel, group, args.nf_id, args.umem_id)?
        } else {
            negotiate_secondary(&mut channel, args.nf_id, args.umem_id)?
        };

        let umem_area = map_shared_fd(umem_fd, umem_size as usize)?;
        unsafe { libc::close(umem_fd) };

        let nf_base = global_thread_offset(group, args.nf_id)?;

        let mut threads = Vec::with_capacity(nf.thread.len());
        for (index, thread) in nf.thread.iter().enumerate() {
            channel.send_command(CommandCode::CreateSocket)?;
            channel.send_payload(&CreateSocket { nf_id: args.nf_id, thread_index: index as u16 })?;
            channel.expect_command(CommandCode::ReplySocket)?;
            let socket_fd = channel.recv_fd()?;
            let remote = unsafe { RemoteSocket::from_raw_fd(socket_fd) };

            let socket_config = SocketConfig {
                rx_size: core::num::NonZeroU32::new(RX_RING_SIZE),
                tx_size: core::num::NonZeroU32::new(TX_RING_SIZE),
                bind_flags: 0,
            };
            let rxtx = remote.rx_tx(socket_config)?;
            let mut fill = remote.fill_completion(RX_RING_SIZE, TX_RING_SIZE)?;

            let global_offset = nf_base + index as u32;
            let mut pool = FramePool::for_thread_slice(FRAME_SIZE as u64, global_offset, FRAMES_PER_THREAD);
            let rx = rxtx.map_rx()?;
            let tx = rxtx.map_tx()?;
            seed_fill_ring(&mut fill, &mut pool);

            threads.push(ThreadAttachment {
                thread_id: thread.thread_id,
                queue: thread.queue,
                rx,
                tx,
                fill,
                pool,
            });
        }

        channel.send_command(CommandCode::GetFrOffset)?;
        channel.expect_command(CommandCode::ReplyFrOffset)?;
        let offset: ReplyFrOffset = channel.recv_payload()?;

        let handle = NfHandle {
            nf_id: args.nf_id,
            umem_id: args.umem_id,
            frame_size: FRAME_SIZE,
            headroom: offset.offset,
            umem_area,
            threads,
            next_hops: topology.next_hops(args.nf_id).to_vec(),
            channel,
        };
        log::info!(
            "nf {} attached to umem {} with {} thread(s)",
            handle.nf_id,
            handle.umem_id,
            handle.threads.len()
        );
        Ok(handle)
    }

    /// Tell the Monitor this NF is detaching, so it can close the sockets
    /// it's holding open on this NF's behalf and tear the UMEM down once
    /// the last attached NF has done the same.
    pub fn detach(mut self) -> Result<(), Error> {
        self.channel.send_command(CommandCode::CloseConn)?;
        self.channel.send_payload(&CloseConn { umem_id: self.umem_id, nf_id: self.nf_id })?;
        Ok(())
    }

    /// # Safety
    /// `offset` must be a frame address this NF currently owns exclusively
    /// (just received via RX, or just popped from its own frame pool).
    pub unsafe fn frame_bytes(&self, offset: u64) -> &mut [u8] {
        let base = self.umem_area.as_ptr() as *mut u8;
        core::slice::from_raw_parts_mut(base.add(offset as usize), self.frame_size as usize)
    }

    /// A `Send`able, `Copy` raw view of this handle's UMEM region, for
    /// handing one per worker thread once `threads` has been drained and
    /// distributed: every descriptor's `addr` names a frame that thread
    /// alone owns at the time it reads or writes it, so sharing the base
    /// pointer itself across threads is sound.
    pub fn frame_view(&self) -> FrameView {
        FrameView { base: self.umem_area.as_ptr() as *mut u8, frame_size: self.frame_size }
    }
}

#[derive(Clone, Copy)]
pub struct FrameView {
    base: *mut u8,
    frame_size: u32,
}

unsafe impl Send for FrameView {}

impl FrameView {
    /// # Safety
    /// `addr` must be a frame address the calling thread currently owns
    /// exclusively.
    pub unsafe fn bytes(&self, addr: u64) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.base.add(addr as usize), self.frame_size as usize)
    }
}

/// Reserve `FILL_SEED_PER_THREAD` frames out of `pool` and hand them to the
/// kernel FILL ring, matching `flash_nf.c`'s `flash__populate_fill_ring`.
fn seed_fill_ring(fill: &mut DeviceQueue, pool: &mut FramePool) {
    let mut guard = fill.fill(FILL_SEED_PER_THREAD);
    while !guard.is_empty() {
        let Some(addr) = pool.get() else { break };
        guard.insert(addr);
    }
}

/// The global index of this NF's first thread within its UMEM group's flat
/// socket ordering (sum of thread counts of every NF entry preceding it in
/// the topology file's `nf` array). Both the Monitor and every NF load the
/// identical topology file, so this can be derived locally instead of
/// carried over the wire.
fn global_thread_offset(group: &UmemGroup, nf_id: u16) -> Result<u32, Error> {
    let mut offset = 0u32;
    for nf in &group.nf {
        if nf.nf_id == nf_id {
            return Ok(offset);
        }
        offset += nf.thread.len() as u32;
    }
    Err(Error::UnknownNf { umem_id: group.umem_id, nf_id })
}

fn find_group(topology: &Topology, umem_id: u16) -> Result<&UmemGroup, Error> {
    topology.umem.iter().find(|g| g.umem_id == umem_id).ok_or(Error::UnknownUmem(umem_id))
}

fn find_nf<'a>(group: &'a UmemGroup, nf_id: u16) -> Result<&'a NfConfig, Error> {
    group.nf.iter().find(|nf| nf.nf_id == nf_id).ok_or(Error::UnknownNf { umem_id: group.umem_id, nf_id })
}

fn negotiate_primary(channel: &mut Channel, group: &UmemGroup, nf_id: u16, umem_id: u16) -> Result<(i32, u64), Error> {
    channel.send_command(CommandCode::CreateUmem)?;
    channel.send_payload(&GetUmem { nf_id, umem_id })?;

    channel.expect_command(CommandCode::GetThreadInfo)?;
    let total_sockets = group.total_threads() as u16;
    channel.send_command(CommandCode::ReplyThreadInfo)?;
    channel.send_payload(&ReplyThreadInfo { total_sockets })?;

    channel.expect_command(CommandCode::ReplyUmem)?;
    let reply: ReplyUmem = channel.recv_payload()?;
    let fd = channel.recv_fd()?;
    Ok((fd, reply.umem_size))
}

fn negotiate_secondary(channel: &mut Channel, nf_id: u16, umem_id: u16) -> Result<(i32, u64), Error> {
    channel.send_command(CommandCode::GetUmem)?;
    channel.send_payload(&GetUmem { nf_id, umem_id })?;

    channel.expect_command(CommandCode::ReplyUmem)?;
    let reply: ReplyUmem = channel.recv_payload()?;
    let fd = channel.recv_fd()?;
    Ok((fd, reply.umem_size))
}
