//! Topology file model: UMEMs, their interfaces, the NFs attached to each,
//! and the `route` graph between NF ids.
//!
//! Grounded on `lib/flash/cfgparser/flash_cfgparser.c`'s `parse_json`; the
//! field set matches the topology JSON shape rather than the original's
//! `ifqueue_mask` hex string (superseded here by an explicit per-thread
//! `queue` field), but the validation invariants (unique nf ids, a route
//! target must exist, thread count must line up with queue count, the
//! `s`+`z` flag rejection) are the same ones `parse_json` enforces.

mod error;

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

use nfmesh_xsk::{parse_flag_chars, BindFlags, XdpFlags};
use serde::Deserialize;

pub use error::ConfigError;

/// A parsed and validated topology file.
#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    /// `nf_id -> [next_nf_id, ...]`, the directed sibling-routing graph.
    pub route: BTreeMap<u16, Vec<u16>>,
    pub umem: Vec<UmemGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UmemGroup {
    pub umem_id: u16,
    pub ifname: String,
    #[serde(default = "default_umem_scale")]
    pub umem_scale: u16,
    pub xdp_flags: String,
    pub bind_flags: String,
    #[serde(default)]
    pub mode: String,
    pub custom_xsk: bool,
    pub frags_enabled: bool,
    pub nf: Vec<NfConfig>,
}

fn default_umem_scale() -> u16 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct NfConfig {
    pub nf_id: u16,
    pub nf_ip: Ipv4Addr,
    pub nf_port: u16,
    pub thread: Vec<ThreadConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ThreadConfig {
    pub thread_id: u16,
    pub queue: u8,
}

/// The queue-polling mode selected by a UMEM's `mode` field: empty string
/// sets `XDP_USE_NEED_WAKEUP` on the bind flags instead of choosing one of
/// the three named polling disciplines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    NeedWakeup,
    BusyPoll,
    NoNeedWakeup,
    Poll,
}

impl UmemGroup {
    /// Resolve this group's `xdp_flags`/`bind_flags`/`mode` strings into
    /// kernel bitmasks and a polling mode, rejecting the `s`+`z`
    /// combination along the way.
    pub fn resolve_flags(&self) -> Result<(XdpFlags, BindFlags, PollMode), ConfigError> {
        let combined = format!("{}{}", self.xdp_flags, self.bind_flags);
        let (xdp, mut bind) = parse_flag_chars(&combined).map_err(|e| ConfigError::InvalidFlags {
            flags: combined.clone(),
            reason: e.to_string(),
        })?;

        let poll_mode = match self.mode.as_str() {
            "" => {
                bind = BindFlags(bind.0 | BindFlags::USE_NEED_WAKEUP);
                PollMode::NeedWakeup
            }
            "b" => PollMode::BusyPoll,
            "m" => PollMode::NoNeedWakeup,
            "p" => PollMode::Poll,
            other => {
                return Err(ConfigError::InvalidMode {
                    umem_id: self.umem_id,
                    mode: other.to_string(),
                })
            }
        };

        Ok((xdp, bind, poll_mode))
    }

    pub fn total_threads(&self) -> usize {
        self.nf.iter().map(|nf| nf.thread.len()).sum()
    }
}

impl Topology {
    /// Load, parse, and validate a topology file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse and validate a topology document already read into memory.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let topology: Topology = serde_json::from_str(text)?;
        topology.validate()?;
        Ok(topology)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_nf_ids = HashSet::new();

        for group in &self.umem {
            if group.nf.is_empty() {
                return Err(ConfigError::EmptyUmem { umem_id: group.umem_id });
            }

            group.resolve_flags()?;

            let mut queues = HashSet::new();
            for nf in &group.nf {
                if !seen_nf_ids.insert(nf.nf_id) {
                    return Err(ConfigError::DuplicateNf { nf_id: nf.nf_id });
                }

                let mut thread_ids = HashSet::new();
                for thread in &nf.thread {
                    if !thread_ids.insert(thread.thread_id) {
                        return Err(ConfigError::DuplicateThread {
                            nf_id: nf.nf_id,
                            thread_id: thread.thread_id,
                        });
                    }
                    queues.insert(thread.queue);
                }
            }

            let total_threads = group.total_threads();
            if queues.len() != total_threads {
                return Err(ConfigError::QueueCountMismatch {
                    umem_id: group.umem_id,
                    thread_count: total_threads,
                    queue_count: queues.len(),
                });
            }
        }

        for (key, targets) in &self.route {
            if !seen_nf_ids.contains(key) {
                return Err(ConfigError::UnknownRouteSource { key: key.to_string() });
            }
            for &target in targets {
                if !seen_nf_ids.contains(&target) {
                    return Err(ConfigError::UnknownRouteTarget { from: *key, to: target });
                }
            }
        }

        Ok(())
    }

    /// The `next[]` list for one NF id, or an empty slice if it has none.
    pub fn next_hops(&self, nf_id: u16) -> &[u16] {
        self.route.get(&nf_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(nf_json: &str, route_json: &str) -> String {
        format!(
            r#"{{
                "route": {route_json},
                "umem": [
                    {{ "umem_id": 1, "ifname": "veth0", "umem_scale": 1,
                       "xdp_flags": "d", "bind_flags": "c", "mode": "",
                       "custom_xsk": false, "frags_enabled": false,
                       "nf": [{nf_json}] }}
                ]
            }}"#
        )
    }

    #[test]
    fn parses_single_thread_echo_topology() {
        let nf = r#"{ "nf_id": 1, "nf_ip": "127.0.0.1", "nf_port": 9000,
                       "thread": [ { "thread_id": 0, "queue": 0 } ] }"#;
        let doc = sample(nf, "{}");
        let topo = Topology::parse(&doc).unwrap();
        assert_eq!(topo.umem.len(), 1);
        assert_eq!(topo.umem[0].total_threads(), 1);
        assert!(topo.next_hops(1).is_empty());
    }

    #[test]
    fn rejects_duplicate_nf_ids() {
        let nf = r#"{ "nf_id": 1, "nf_ip": "127.0.0.1", "nf_port": 9000,
                       "thread": [ { "thread_id": 0, "queue": 0 } ] }"#;
        let doc = format!(
            r#"{{ "route": {{}}, "umem": [
                {{ "umem_id": 1, "ifname": "veth0", "xdp_flags": "d", "bind_flags": "c",
                   "mode": "", "custom_xsk": false, "frags_enabled": false,
                   "nf": [{nf}] }},
                {{ "umem_id": 2, "ifname": "veth1", "xdp_flags": "d", "bind_flags": "c",
                   "mode": "", "custom_xsk": false, "frags_enabled": false,
                   "nf": [{nf}] }}
            ] }}"#
        );
        assert!(matches!(Topology::parse(&doc), Err(ConfigError::DuplicateNf { nf_id: 1 })));
    }

    #[test]
    fn rejects_skb_mode_with_zerocopy() {
        let nf = r#"{ "nf_id": 1, "nf_ip": "127.0.0.1", "nf_port": 9000,
                       "thread": [ { "thread_id": 0, "queue": 0 } ] }"#;
        let doc = format!(
            r#"{{ "route": {{}}, "umem": [
                {{ "umem_id": 1, "ifname": "veth0", "xdp_flags": "s", "bind_flags": "z",
                   "mode": "", "custom_xsk": false, "frags_enabled": false,
                   "nf": [{nf}] }}
            ] }}"#
        );
        assert!(matches!(Topology::parse(&doc), Err(ConfigError::InvalidFlags { .. })));
    }

    #[test]
    fn rejects_route_to_unknown_nf() {
        let nf = r#"{ "nf_id": 1, "nf_ip": "127.0.0.1", "nf_port": 9000,
                       "thread": [ { "thread_id": 0, "queue": 0 } ] }"#;
        let doc = sample(nf, r#"{"1": [99]}"#);
        assert!(matches!(
            Topology::parse(&doc),
            Err(ConfigError::UnknownRouteTarget { from: 1, to: 99 })
        ));
    }

    #[test]
    fn rejects_queue_thread_count_mismatch() {
        let nf = r#"{ "nf_id": 1, "nf_ip": "127.0.0.1", "nf_port": 9000,
                       "thread": [ { "thread_id": 0, "queue": 0 }, { "thread_id": 1, "queue": 0 } ] }"#;
        let doc = sample(nf, "{}");
        assert!(matches!(Topology::parse(&doc), Err(ConfigError::QueueCountMismatch { .. })));
    }

    #[test]
    fn resolves_chained_route_for_sibling_forwarding() {
        let nf1 = r#"{ "nf_id": 1, "nf_ip": "127.0.0.1", "nf_port": 9000,
                       "thread": [ { "thread_id": 0, "queue": 0 } ] }"#;
        let nf2 = r#"{ "nf_id": 2, "nf_ip": "127.0.0.1", "nf_port": 9001,
                       "thread": [ { "thread_id": 0, "queue": 1 } ] }"#;
        let doc = format!(
            r#"{{ "route": {{"1": [2]}}, "umem": [
                {{ "umem_id": 1, "ifname": "veth0", "xdp_flags": "d", "bind_flags": "c",
                   "mode": "", "custom_xsk": false, "frags_enabled": false,
                   "nf": [{nf1}, {nf2}] }}
            ] }}"#
        );
        let topo = Topology::parse(&doc).unwrap();
        assert_eq!(topo.next_hops(1), &[2]);
        assert!(topo.next_hops(2).is_empty());
    }
}
