//! The session state contract: insert-if-absent, lookup, delete, iterate
//! over permitted 5-tuples, loaded once from a JSON file at startup.
//! Translated from `original_source/examples/firewall/main.c`'s
//! `read_json_config`/`hashmap_insert_elem`, using a plain `HashSet` in
//! place of the original's custom open-addressing `hashmap.h`.

use std::collections::HashSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use nfmesh_runtime::SessionKey;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SessionEntry {
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    proto: String,
}

#[derive(Debug, Deserialize)]
struct SessionFile {
    #[serde(default)]
    valid_sessions: Vec<SessionEntry>,
}

/// A permitted-session set, keyed by the same packed 5-tuple the hot loop
/// derives from each packet.
pub struct SessionTable {
    permitted: HashSet<SessionKey>,
}

impl SessionTable {
    pub fn load(path: &Path) -> Result<SessionTable, LoadError> {
        let data = fs::read_to_string(path).map_err(LoadError::Io)?;
        let file: SessionFile = serde_json::from_str(&data).map_err(LoadError::Json)?;

        let mut permitted = HashSet::with_capacity(file.valid_sessions.len());
        for entry in file.valid_sessions {
            let proto = proto_number(&entry.proto).ok_or_else(|| LoadError::UnknownProto(entry.proto.clone()))?;
            permitted.insert(SessionKey::new(entry.src_ip, entry.dst_ip, entry.src_port, entry.dst_port, proto));
        }
        Ok(SessionTable { permitted })
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.permitted.contains(key)
    }

    /// Admit a session if it isn't already present; `false` if it was.
    pub fn insert(&mut self, key: SessionKey) -> bool {
        self.permitted.insert(key)
    }

    pub fn remove(&mut self, key: &SessionKey) -> bool {
        self.permitted.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionKey> {
        self.permitted.iter()
    }

    pub fn len(&self) -> usize {
        self.permitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permitted.is_empty()
    }
}

fn proto_number(name: &str) -> Option<u8> {
    match name.to_ascii_lowercase().as_str() {
        "tcp" => Some(6),
        "udp" => Some(17),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read session file: {0}")]
    Io(std::io::Error),
    #[error("failed to parse session file: {0}")]
    Json(serde_json::Error),
    #[error("unknown protocol in session file: {0}")]
    UnknownProto(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_round_trips() {
        let mut table = SessionTable { permitted: HashSet::new() };
        let key = SessionKey::new(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(10, 0, 0, 1), 4242, 80, 17);
        assert!(table.insert(key));
        assert!(!table.insert(key));
        assert!(table.contains(&key));
        assert!(table.remove(&key));
        assert!(!table.contains(&key));
    }

    #[test]
    fn parses_well_formed_json() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("nfmesh-firewall-test-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"valid_sessions":[{"src_ip":"1.1.1.1","src_port":4242,"dst_ip":"10.0.0.1","dst_port":80,"proto":"udp"}]}"#,
        )
        .unwrap();
        let table = SessionTable::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(table.len(), 1);
        let key = SessionKey::new(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(10, 0, 0, 1), 4242, 80, 17);
        assert!(table.contains(&key));
    }
}
