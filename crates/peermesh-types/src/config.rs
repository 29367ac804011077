//! Node configuration.
//!
//! Every field has a default, so a config file only needs to list what it
//! changes. Loading (with includes) lives in `peermesh_kernel::config`.

use crate::error::{MeshError, MeshResult};
use crate::peer::Capabilities;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default TCP port for mesh connections.
pub const DEFAULT_MESH_PORT: u16 = 7400;
/// Default UDP port for discovery datagrams.
pub const DEFAULT_DISCOVERY_PORT: u16 = 7401;

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Fixed node id. Generated from the host name when absent.
    pub node_id: Option<String>,
    /// Interface the mesh listener binds to.
    pub listen_addr: IpAddr,
    /// TCP port for mesh connections (0 picks an ephemeral port).
    pub mesh_port: u16,
    /// UDP port discovery listens on and announces to.
    pub discovery_port: u16,
    /// Explicit announcement targets (`ip:port`). Empty means subnet broadcast.
    pub discovery_targets: Vec<String>,
    /// Statically known peers (`host:port`), dialled at boot.
    pub static_peers: Vec<String>,
    /// Seconds between pings to each connected peer.
    pub heartbeat_interval_secs: u64,
    /// Seconds without traffic after which a connected peer is disconnected.
    pub peer_timeout_secs: u64,
    /// Seconds between prune passes.
    pub prune_interval_secs: u64,
    /// Seconds after which a non-connected peer entry is removed.
    pub peer_eviction_secs: u64,
    /// Seconds between discovery announcements.
    pub discovery_interval_secs: u64,
    /// Seconds allowed for an outbound TCP connect.
    pub connect_timeout_secs: u64,
    /// Seconds a component may spend in `process` before it is abandoned.
    pub process_timeout_secs: u64,
    /// Accept and dial mesh connections.
    pub mesh_enabled: bool,
    /// Announce and listen on the discovery port.
    pub discovery_enabled: bool,
    /// Deliver `DataSync` envelopes to local components.
    pub sync_enabled: bool,
    /// Default log filter (overridden by `RUST_LOG`).
    pub log_level: String,
    /// Capabilities advertised to peers.
    pub capabilities: Capabilities,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mesh_port: DEFAULT_MESH_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            discovery_targets: Vec::new(),
            static_peers: Vec::new(),
            heartbeat_interval_secs: 5,
            peer_timeout_secs: 60,
            prune_interval_secs: 60,
            peer_eviction_secs: 300,
            discovery_interval_secs: 30,
            connect_timeout_secs: 5,
            process_timeout_secs: 30,
            mesh_enabled: true,
            discovery_enabled: true,
            sync_enabled: true,
            log_level: "info".to_string(),
            capabilities: Capabilities::new(),
        }
    }
}

impl MeshConfig {
    /// Address the mesh listener binds to.
    pub fn mesh_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.mesh_port)
    }

    /// Resolved announcement targets. Unparseable entries are skipped.
    pub fn discovery_targets(&self) -> Vec<SocketAddr> {
        if self.discovery_targets.is_empty() {
            return vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                self.discovery_port,
            )];
        }
        self.discovery_targets
            .iter()
            .filter_map(|t| t.parse().ok())
            .collect()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn peer_eviction(&self) -> Duration {
        Duration::from_secs(self.peer_eviction_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }

    /// Reject settings the loops cannot run with.
    pub fn validate(&self) -> MeshResult<()> {
        let intervals = [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("peer_timeout_secs", self.peer_timeout_secs),
            ("prune_interval_secs", self.prune_interval_secs),
            ("discovery_interval_secs", self.discovery_interval_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("process_timeout_secs", self.process_timeout_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(MeshError::Config(format!("{name} must be greater than 0")));
            }
        }
        if self.peer_eviction_secs < self.peer_timeout_secs {
            return Err(MeshError::Config(
                "peer_eviction_secs must not be shorter than peer_timeout_secs".to_string(),
            ));
        }
        for target in &self.discovery_targets {
            if target.parse::<SocketAddr>().is_err() {
                return Err(MeshError::Config(format!(
                    "invalid discovery target '{target}' (expected ip:port)"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.mesh_port, 7400);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.peer_timeout(), Duration::from_secs(60));
        assert_eq!(config.discovery_interval(), Duration::from_secs(30));
        assert!(config.mesh_enabled && config.discovery_enabled && config.sync_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: MeshConfig = toml::from_str(
            r#"
            mesh_port = 9000
            static_peers = ["10.0.0.2:9000"]

            [capabilities]
            role = "worker"
        "#,
        )
        .unwrap();
        assert_eq!(config.mesh_port, 9000);
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.static_peers, vec!["10.0.0.2:9000".to_string()]);
        assert_eq!(config.capabilities["role"], "worker");
    }

    #[test]
    fn test_discovery_targets_default_to_broadcast() {
        let config = MeshConfig {
            discovery_port: 9999,
            ..Default::default()
        };
        assert_eq!(
            config.discovery_targets(),
            vec!["255.255.255.255:9999".parse::<SocketAddr>().unwrap()]
        );

        let config = MeshConfig {
            discovery_targets: vec!["127.0.0.1:5000".into()],
            ..Default::default()
        };
        assert_eq!(
            config.discovery_targets(),
            vec!["127.0.0.1:5000".parse::<SocketAddr>().unwrap()]
        );
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = MeshConfig {
            heartbeat_interval_secs: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval_secs"));
    }

    #[test]
    fn test_validate_rejects_bad_target() {
        let config = MeshConfig {
            discovery_targets: vec!["not-an-addr".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
