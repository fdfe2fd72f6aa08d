use serde::{Deserialize, Serialize};
use std::fmt;

/// The three node classes of the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Coordinator,
    Sql,
    Kv,
}

impl NodeKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Coordinator => "coordinator",
            NodeKind::Sql => "sql",
            NodeKind::Kv => "kv",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Up,
    Down,
    Offline,
    Tombstone,
    Unknown,
}

/// A single node as reported by the coordinator or the deployment registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub kind: NodeKind,
    pub ip: String,
    pub port: u16,
    pub status_port: u16,
    #[serde(default)]
    pub version: String,
    pub status: NodeStatus,
}

impl NodeInfo {
    pub fn new<I: Into<String>>(kind: NodeKind, ip: I, port: u16, status_port: u16) -> Self {
        NodeInfo {
            kind,
            ip: ip.into(),
            port,
            status_port,
            version: String::new(),
            status: NodeStatus::Up,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn status_address(&self) -> String {
        format!("{}:{}", self.ip, self.status_port)
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("10.0.1.2:20160"),
            Some(("10.0.1.2".to_string(), 20160))
        );
        assert_eq!(split_host_port("[::1]:4000"), Some(("::1".to_string(), 4000)));
        assert_eq!(split_host_port("no-port"), None);
        assert_eq!(split_host_port(":4000"), None);
        assert_eq!(split_host_port("host:notaport"), None);
    }

    #[test]
    fn test_node_kind_serde() {
        assert_eq!(serde_json::to_string(&NodeKind::Kv).unwrap(), "\"kv\"");
        assert_eq!(
            serde_json::from_str::<NodeKind>("\"coordinator\"").unwrap(),
            NodeKind::Coordinator
        );
    }
}
