//! Node identity and peer status types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque capability set advertised by a node (handshake and discovery).
pub type Capabilities = BTreeMap<String, serde_json::Value>;

/// Connection status of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Known, dial in progress (or about to start).
    Connecting,
    /// A live connection exists in the transport's connection table.
    Connected,
    /// Connection lost or peer timed out. Kept for rediscovery.
    Disconnected,
    /// The last dial attempt failed.
    Error,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Identity of the local node, shared with every collaborator that needs to
/// stamp or advertise it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    /// Process-wide unique node id.
    pub node_id: String,
    /// Port the mesh listener is bound to.
    pub mesh_port: u16,
    /// Capabilities advertised in handshakes and announcements.
    pub capabilities: Capabilities,
}

/// Generate a node id of the form `<host>-<8 hex chars>`.
///
/// The host part comes from `HOSTNAME` (or `COMPUTERNAME` on Windows) and
/// falls back to `node`. Characters other than ASCII alphanumerics, `-` and
/// `_` are replaced so the id stays safe to log and to use as a map key.
pub fn generate_node_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "node".to_string());
    let host: String = host
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_node_id_unique() {
        let a = generate_node_id();
        let b = generate_node_id();
        assert_ne!(a, b);
        let suffix = a.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_peer_status_serde() {
        let json = serde_json::to_string(&PeerStatus::Disconnected).unwrap();
        assert_eq!(json, "\"disconnected\"");
        let back: PeerStatus = serde_json::from_str("\"connecting\"").unwrap();
        assert_eq!(back, PeerStatus::Connecting);
        assert_eq!(PeerStatus::Error.to_string(), "error");
    }
}
