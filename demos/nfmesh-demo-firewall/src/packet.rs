//! Ethernet/IPv4/TCP/UDP parsing down to the 5-tuple, translated from
//! `original_source/examples/firewall/main.c`'s `socket_routine` header
//! walk (bounds-checked instead of raw pointer casts past `pkt_end`).

use std::net::Ipv4Addr;

use nfmesh_runtime::SessionKey;

const ETH_HLEN: usize = 14;
const IPV4_MIN_HLEN: usize = 20;
const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Extract the 5-tuple of a TCP or UDP segment; `None` for anything else
/// (non-IPv4, non-TCP/UDP, or too short to hold the headers this NF reads).
pub fn session_key(frame: &[u8], len: usize) -> Option<SessionKey> {
    let frame = frame.get(..len)?;
    if frame.len() < ETH_HLEN || frame[12..14] != ETHERTYPE_IPV4 {
        return None;
    }

    let ip_start = ETH_HLEN;
    if frame.len() < ip_start + IPV4_MIN_HLEN {
        return None;
    }
    let ihl = (frame[ip_start] & 0x0f) as usize * 4;
    if ihl < IPV4_MIN_HLEN || frame.len() < ip_start + ihl {
        return None;
    }
    let proto = frame[ip_start + 9];
    if proto != IPPROTO_TCP && proto != IPPROTO_UDP {
        return None;
    }

    let l4_start = ip_start + ihl;
    if frame.len() < l4_start + 4 {
        return None;
    }

    let src_ip = Ipv4Addr::new(frame[ip_start + 12], frame[ip_start + 13], frame[ip_start + 14], frame[ip_start + 15]);
    let dst_ip = Ipv4Addr::new(frame[ip_start + 16], frame[ip_start + 17], frame[ip_start + 18], frame[ip_start + 19]);
    let src_port = u16::from_be_bytes([frame[l4_start], frame[l4_start + 1]]);
    let dst_port = u16::from_be_bytes([frame[l4_start + 2], frame[l4_start + 3]]);

    Some(SessionKey::new(src_ip, dst_ip, src_port, dst_port, proto))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_udp(sport: u16) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HLEN + IPV4_MIN_HLEN + 8];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4);
        frame[14] = 0x45;
        frame[14 + 9] = IPPROTO_UDP;
        frame[14 + 12..14 + 16].copy_from_slice(&[1, 1, 1, 1]);
        frame[14 + 16..14 + 20].copy_from_slice(&[10, 0, 0, 1]);
        frame[34..36].copy_from_slice(&sport.to_be_bytes());
        frame[36..38].copy_from_slice(&80u16.to_be_bytes());
        frame
    }

    #[test]
    fn extracts_the_five_tuple_from_a_udp_packet() {
        let frame = sample_udp(4242);
        let len = frame.len();
        let key = session_key(&frame, len).unwrap();
        assert_eq!(key.src_ip(), Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(key.dst_ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(key.src_port(), 4242);
        assert_eq!(key.dst_port(), 80);
        assert_eq!(key.proto(), IPPROTO_UDP);
    }

    #[test]
    fn non_ip_frame_has_no_session_key() {
        let mut frame = sample_udp(4242);
        frame[12..14].copy_from_slice(&[0x08, 0x06]); // ARP
        let len = frame.len();
        assert!(session_key(&frame, len).is_none());
    }

    #[test]
    fn truncated_frame_has_no_session_key() {
        let frame = vec![0u8; 10];
        assert!(session_key(&frame, 10).is_none());
    }
}
