//! The per-NF connection state machine: IDLE -> CREATING/ATTACHING ->
//! SERVING -> DETACHING -> IDLE (`spec.md` §4.F), one thread per accepted
//! connection, translated from `original_source/monitor/main.c`'s
//! `handle_nf`.

use std::ffi::CString;
use std::num::NonZeroU32;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use nfmesh_ipc::{
    Channel, CloseConn, CommandCode, CreateSocket, GetUmem, IpcError, ReplyFrOffset, ReplyThreadInfo, ReplyUmem,
};
use nfmesh_topology::{PollMode, Topology, UmemGroup};
use nfmesh_xsk::{BusyPoll, IfInfo, SocketConfig, Umem, UmemConfig};

use crate::error::MonitorError;
use crate::registry::{UmemEntry, UmemRegistry};

const RX_RING_SIZE: u32 = 2048;
const TX_RING_SIZE: u32 = 2048;
const BUSY_POLL_USECS: u32 = 20;
const BUSY_POLL_BUDGET: u32 = 64;

/// Drive one NF connection from its opening `CREATE_UMEM`/`GET_UMEM` all
/// the way to `CLOSE_CONN` or disconnect.
pub fn handle_nf(mut channel: Channel, topology: Arc<Topology>, registry: Arc<UmemRegistry>) -> Result<(), MonitorError> {
    let umem_id = match channel.recv_command()? {
        CommandCode::CreateUmem => attach_primary(&mut channel, &topology, &registry)?,
        CommandCode::GetUmem => attach_secondary(&mut channel, &topology, &registry)?,
        other => return Err(MonitorError::UnexpectedCommand(other, "idle")),
    };

    loop {
        match channel.recv_command() {
            Ok(CommandCode::CreateSocket) => create_socket(&mut channel, umem_id, &topology, &registry)?,
            Ok(CommandCode::GetFrOffset) => send_fr_offset(&mut channel, umem_id, &registry)?,
            Ok(CommandCode::CloseConn) => {
                detach(&mut channel, umem_id, &registry)?;
                break;
            }
            Ok(other) => return Err(MonitorError::UnexpectedCommand(other, "serving")),
            Err(IpcError::Disconnected) => {
                log::warn!("nf disconnected from umem {umem_id} without CLOSE_CONN");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn find_group<'a>(topology: &'a Topology, umem_id: u16) -> Result<&'a UmemGroup, MonitorError> {
    topology
        .umem
        .iter()
        .find(|group| group.umem_id == umem_id)
        .ok_or(MonitorError::UnknownUmem(umem_id))
}

/// `CREATE_UMEM`: the first NF to attach to a UMEM. Asks the connecting NF
/// how many sockets the whole group will eventually need
/// (`GET_THREAD_INFO`/`REPLY_THREAD_INFO`) so the shared region is sized
/// once, up front, translated from `flash_monitor.c`'s `flash__setup_umem`.
fn attach_primary(channel: &mut Channel, topology: &Topology, registry: &UmemRegistry) -> Result<u16, MonitorError> {
    let req: GetUmem = channel.recv_payload()?;
    let _group = find_group(topology, req.umem_id)?;

    channel.send_command(CommandCode::GetThreadInfo)?;
    channel.expect_command(CommandCode::ReplyThreadInfo)?;
    let info: ReplyThreadInfo = channel.recv_payload()?;

    let config = UmemConfig::default();
    let entry = {
        let size = config.frame_size as u64 * info.total_sockets as u64 * crate::registry::FRAMES_PER_THREAD;
        let (umem, memfd) = nfmesh_xsk::create_shared(size as usize, config)?;
        UmemEntry::new(umem, memfd, config, info.total_sockets)
    };

    let mut reg = registry.lock();
    reg.insert(req.umem_id, entry);
    let entry = reg.get_mut(&req.umem_id).expect("just inserted");
    entry.attached_nf.insert(req.nf_id);
    let umem_size = entry.umem_size();
    let fd = entry.memfd_raw();
    drop(reg);

    channel.send_command(CommandCode::ReplyUmem)?;
    channel.send_payload(&ReplyUmem { thread_count: info.total_sockets, umem_size })?;
    channel.send_fd(fd)?;

    log::info!("nf {} created umem {}", req.nf_id, req.umem_id);
    Ok(req.umem_id)
}

/// `GET_UMEM`: a subsequent NF attaching to an already-created UMEM.
fn attach_secondary(channel: &mut Channel, topology: &Topology, registry: &UmemRegistry) -> Result<u16, MonitorError> {
    let req: GetUmem = channel.recv_payload()?;
    let _group = find_group(topology, req.umem_id)?;

    let mut reg = registry.lock();
    let entry = reg.get_mut(&req.umem_id).ok_or(MonitorError::UnknownUmem(req.umem_id))?;
    entry.attached_nf.insert(req.nf_id);
    let umem_size = entry.umem_size();
    let thread_count = entry.total_sockets;
    let fd = entry.memfd_raw();
    drop(reg);

    channel.send_command(CommandCode::ReplyUmem)?;
    channel.send_payload(&ReplyUmem { thread_count, umem_size })?;
    channel.send_fd(fd)?;

    log::info!("nf {} attached to existing umem {}", req.nf_id, req.umem_id);
    Ok(req.umem_id)
}

/// `CREATE_SOCKET`: bind one per-thread AF_XDP socket and hand its fd off.
/// `Umem::fq_cq` registers fill/completion against the socket's bound
/// `(ifindex, queue_id, netns)`, not against the UMEM as a whole, and
/// topology validation guarantees every thread in a group binds a distinct
/// queue, so every socket registers its own fill/completion pair.
fn create_socket(channel: &mut Channel, umem_id: u16, topology: &Topology, registry: &UmemRegistry) -> Result<(), MonitorError> {
    let req: CreateSocket = channel.recv_payload()?;
    let group = find_group(topology, umem_id)?;
    let nf = group
        .nf
        .iter()
        .find(|nf| nf.nf_id == req.nf_id)
        .ok_or(MonitorError::UnknownNf { umem_id, nf_id: req.nf_id })?;
    let thread = nf
        .thread
        .get(req.thread_index as usize)
        .ok_or(MonitorError::UnknownNf { umem_id, nf_id: req.nf_id })?;

    let (_xdp, bind, poll) = group.resolve_flags()?;

    let mut ifinfo = IfInfo::invalid();
    let ifname = CString::new(group.ifname.clone())
        .map_err(|_| MonitorError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "ifname contains NUL")))?;
    ifinfo.from_name(&ifname)?;
    ifinfo.set_queue(thread.queue as u32);

    let mut reg = registry.lock();
    let entry = reg.get_mut(&umem_id).ok_or(MonitorError::UnknownUmem(umem_id))?;

    let socket = nfmesh_xsk::Socket::with_shared(&ifinfo, &entry.umem)?;

    if poll == PollMode::BusyPoll {
        let busy = BusyPoll { prefer_busy_poll: true, busy_poll_usecs: BUSY_POLL_USECS, busy_poll_budget: BUSY_POLL_BUDGET };
        if let Err(e) = busy.apply(socket.as_raw_fd()) {
            log::warn!("busy-poll sockopts unsupported on this kernel: {e}");
        }
    }

    fq_cq(&mut entry.umem, &socket)?;

    let socket_config = SocketConfig {
        rx_size: NonZeroU32::new(RX_RING_SIZE),
        tx_size: NonZeroU32::new(TX_RING_SIZE),
        bind_flags: bind.0 as u32,
    };
    entry.umem.bind(&socket, &socket_config)?;

    let fd = socket.as_raw_fd();
    entry.push_socket(req.nf_id, socket);
    drop(reg);

    channel.send_command(CommandCode::ReplySocket)?;
    channel.send_fd(fd)?;
    Ok(())
}

fn fq_cq(umem: &mut Umem, socket: &nfmesh_xsk::Socket) -> Result<(), MonitorError> {
    // The mapped DeviceQueue is only needed in the NF process; here the
    // call's only purpose is registering XDP_UMEM_{FILL,COMPLETION}_RING
    // with the kernel, so the Monitor's own view of it is dropped at once.
    umem.fq_cq(socket)?;
    Ok(())
}

/// `GET_FR_OFFSET`: the UMEM's configured packet headroom, so the NF knows
/// where within a frame its payload starts.
fn send_fr_offset(channel: &mut Channel, umem_id: u16, registry: &UmemRegistry) -> Result<(), MonitorError> {
    let reg = registry.lock();
    let entry = reg.get(&umem_id).ok_or(MonitorError::UnknownUmem(umem_id))?;
    let offset = entry.config.headroom as i32;
    drop(reg);

    channel.send_command(CommandCode::ReplyFrOffset)?;
    channel.send_payload(&ReplyFrOffset { offset })?;
    Ok(())
}

/// `CLOSE_CONN`: close this NF's sockets, drop it from the UMEM's attached
/// set, and tear the whole UMEM down once the last NF has detached.
fn detach(channel: &mut Channel, umem_id: u16, registry: &UmemRegistry) -> Result<(), MonitorError> {
    let req: CloseConn = channel.recv_payload()?;

    let mut reg = registry.lock();
    if let Some(entry) = reg.get_mut(&umem_id) {
        entry.drop_nf_sockets(req.nf_id);
        entry.attached_nf.remove(&req.nf_id);
        if entry.attached_nf.is_empty() {
            reg.remove(&umem_id);
            log::info!("umem {umem_id} torn down after last nf {} detached", req.nf_id);
        } else {
            log::info!("nf {} detached from umem {umem_id}", req.nf_id);
        }
    }
    drop(reg);
    let _ = channel;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfmesh_ipc::Channel as IpcChannel;
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn sample_topology() -> Topology {
        let doc = r#"{
            "route": {},
            "umem": [
                { "umem_id": 1, "ifname": "lo", "umem_scale": 1,
                  "xdp_flags": "d", "bind_flags": "c", "mode": "",
                  "custom_xsk": false, "frags_enabled": false,
                  "nf": [
                    { "nf_id": 1, "nf_ip": "127.0.0.1", "nf_port": 9000,
                      "thread": [ { "thread_id": 0, "queue": 0 } ] },
                    { "nf_id": 2, "nf_ip": "127.0.0.1", "nf_port": 9001,
                      "thread": [ { "thread_id": 0, "queue": 1 } ] }
                  ] }
            ]
        }"#;
        Topology::parse(doc).unwrap()
    }

    #[test]
    fn detach_of_last_nf_empties_the_registry() {
        let topology = Arc::new(sample_topology());
        let registry = Arc::new(UmemRegistry::new());

        let (client, server) = UnixStream::pair().unwrap();
        let mut client = IpcChannel::from_stream(client);

        let topo = topology.clone();
        let reg = registry.clone();
        let server_thread = thread::spawn(move || {
            let server = IpcChannel::from_stream(server);
            handle_nf(server, topo, reg)
        });

        client.send_command(CommandCode::CreateUmem).unwrap();
        client.send_payload(&GetUmem { nf_id: 1, umem_id: 1 }).unwrap();
        client.expect_command(CommandCode::GetThreadInfo).unwrap();
        client.send_command(CommandCode::ReplyThreadInfo).unwrap();
        client.send_payload(&ReplyThreadInfo { total_sockets: 1 }).unwrap();
        client.expect_command(CommandCode::ReplyUmem).unwrap();
        let _reply: ReplyUmem = client.recv_payload().unwrap();
        let fd = client.recv_fd().unwrap();
        unsafe { libc::close(fd) };

        assert_eq!(registry.len(), 1);

        client.send_command(CommandCode::CloseConn).unwrap();
        client.send_payload(&CloseConn { umem_id: 1, nf_id: 1 }).unwrap();
        drop(client);

        server_thread.join().unwrap().unwrap();
        assert!(registry.is_empty());
    }

    /// Four NFs attached to one UMEM (one `CREATE_UMEM` primary plus three
    /// `GET_UMEM` secondaries): the registry entry must survive every detach
    /// but the last, per `spec.md` §8 scenario 6.
    #[test]
    fn umem_survives_until_every_attached_nf_has_detached() {
        let topology = Arc::new(Topology::parse(
            r#"{
                "route": {},
                "umem": [
                    { "umem_id": 1, "ifname": "lo", "umem_scale": 1,
                      "xdp_flags": "d", "bind_flags": "c", "mode": "",
                      "custom_xsk": false, "frags_enabled": false,
                      "nf": [
                        { "nf_id": 1, "nf_ip": "127.0.0.1", "nf_port": 9000, "thread": [ { "thread_id": 0, "queue": 0 } ] },
                        { "nf_id": 2, "nf_ip": "127.0.0.1", "nf_port": 9001, "thread": [ { "thread_id": 0, "queue": 1 } ] },
                        { "nf_id": 3, "nf_ip": "127.0.0.1", "nf_port": 9002, "thread": [ { "thread_id": 0, "queue": 2 } ] },
                        { "nf_id": 4, "nf_ip": "127.0.0.1", "nf_port": 9003, "thread": [ { "thread_id": 0, "queue": 3 } ] }
                      ] }
                ]
            }"#,
        ).unwrap());
        let registry = Arc::new(UmemRegistry::new());

        let mut clients = Vec::new();
        let mut servers = Vec::new();
        for _ in 0..4 {
            let (client, server) = UnixStream::pair().unwrap();
            clients.push(IpcChannel::from_stream(client));
            servers.push(server);
        }

        let mut server_threads = Vec::new();
        for server in servers {
            let topo = topology.clone();
            let reg = registry.clone();
            server_threads.push(thread::spawn(move || handle_nf(IpcChannel::from_stream(server), topo, reg)));
        }

        // NF 1 creates the umem.
        clients[0].send_command(CommandCode::CreateUmem).unwrap();
        clients[0].send_payload(&GetUmem { nf_id: 1, umem_id: 1 }).unwrap();
        clients[0].expect_command(CommandCode::GetThreadInfo).unwrap();
        clients[0].send_command(CommandCode::ReplyThreadInfo).unwrap();
        clients[0].send_payload(&ReplyThreadInfo { total_sockets: 4 }).unwrap();
        clients[0].expect_command(CommandCode::ReplyUmem).unwrap();
        let _reply: ReplyUmem = clients[0].recv_payload().unwrap();
        unsafe { libc::close(clients[0].recv_fd().unwrap()) };

        // NFs 2-4 attach to the umem NF 1 just created.
        for (i, client) in clients.iter_mut().enumerate().skip(1) {
            client.send_command(CommandCode::GetUmem).unwrap();
            client.send_payload(&GetUmem { nf_id: (i + 1) as u16, umem_id: 1 }).unwrap();
            client.expect_command(CommandCode::ReplyUmem).unwrap();
            let _reply: ReplyUmem = client.recv_payload().unwrap();
            unsafe { libc::close(client.recv_fd().unwrap()) };
        }

        assert_eq!(registry.len(), 1);

        // Detach NFs 1-3 one at a time, joining each connection's thread so
        // its detach() has certainly completed before the next assertion.
        let mut server_threads = server_threads.into_iter();
        for (i, client) in clients.iter_mut().enumerate().take(3) {
            client.send_command(CommandCode::CloseConn).unwrap();
            client.send_payload(&CloseConn { umem_id: 1, nf_id: (i + 1) as u16 }).unwrap();
            server_threads.next().unwrap().join().unwrap().unwrap();
            assert_eq!(registry.len(), 1, "umem torn down before its last nf detached");
        }

        // Detach the last one; the umem must now be gone.
        clients[3].send_command(CommandCode::CloseConn).unwrap();
        clients[3].send_payload(&CloseConn { umem_id: 1, nf_id: 4 }).unwrap();
        server_threads.next().unwrap().join().unwrap().unwrap();
        drop(clients);

        assert!(registry.is_empty());
    }
}
