//! Peer directory: the authoritative map of node id to peer.
//!
//! The [`PeerDirectory`] is a cheaply clonable handle over a single mutex.
//! Every read returns a snapshot copy so callers never hold the lock across
//! I/O. Transitions that need network work (dialling a new peer, dropping a
//! connection) are emitted as [`PeerCommand`]s on an unbounded channel that
//! the transport drains, so directory calls never block.

use chrono::{DateTime, Utc};
use peermesh_types::peer::{Capabilities, PeerStatus};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Identifier of one live connection in the transport's table.
pub type ConnectionId = u64;

/// How a peer first became known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Discovery,
    Static,
    Inbound,
}

/// A sighting of a peer, fed into [`PeerDirectory::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeerCandidate {
    pub node_id: String,
    pub address: IpAddr,
    /// Mesh port, when the sighting carries it (announcements and handshakes do).
    pub mesh_port: Option<u16>,
    /// Capabilities, when the sighting carries them.
    pub capabilities: Option<Capabilities>,
    pub source: PeerSource,
}

/// An entry representing a single known peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    /// Unique node id of the peer.
    pub node_id: String,
    /// IP address the peer was last seen from.
    pub address: IpAddr,
    /// Mesh port to dial. 0 when never advertised.
    pub mesh_port: u16,
    /// Capabilities advertised by the peer.
    pub capabilities: Capabilities,
    /// Connection status.
    pub status: PeerStatus,
    /// How the peer was first learned about.
    pub source: PeerSource,
    pub first_seen: DateTime<Utc>,
    /// Last announcement, handshake or inbound frame.
    pub last_seen: DateTime<Utc>,
    /// Most recent ping round trip.
    pub latency: Option<Duration>,
    /// Connection recorded when the peer was marked connected.
    pub connection: Option<ConnectionId>,
}

impl PeerEntry {
    /// Mesh socket address of the peer.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.mesh_port)
    }

    fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen).to_std().unwrap_or_default()
    }
}

/// Work the directory hands to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// Open an outbound connection to this peer.
    Dial(PeerEntry),
    /// Close this connection to the peer.
    Disconnect {
        node_id: String,
        connection: ConnectionId,
    },
}

/// Thread-safe directory of all known peers.
#[derive(Debug, Clone)]
pub struct PeerDirectory {
    peers: Arc<Mutex<HashMap<String, PeerEntry>>>,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerDirectory {
    /// Create an empty directory and the receiver for its commands.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let directory = Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
            commands: tx,
        };
        (directory, rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PeerEntry>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, command: PeerCommand) {
        if self.commands.send(command).is_err() {
            debug!("Peer command dropped: transport is not running");
        }
    }

    /// Record a sighting from discovery or static configuration.
    ///
    /// Unknown peers are inserted as `Connecting` and a dial is requested.
    /// Known peers get their last-seen time, address and capabilities
    /// refreshed without a status change; a known peer sitting in `Error` or
    /// `Disconnected` gets a fresh dial. Returns true if the peer was new.
    pub fn upsert(&self, candidate: PeerCandidate) -> bool {
        self.upsert_with(candidate, true)
    }

    /// Record a peer that connected to us. Never requests a dial.
    pub fn upsert_inbound(&self, candidate: PeerCandidate) -> bool {
        self.upsert_with(candidate, false)
    }

    fn upsert_with(&self, candidate: PeerCandidate, dial: bool) -> bool {
        let now = Utc::now();
        let (inserted, dial_target) = {
            let mut peers = self.lock();
            match peers.get_mut(&candidate.node_id) {
                Some(entry) => {
                    entry.last_seen = now;
                    entry.address = candidate.address;
                    if let Some(port) = candidate.mesh_port {
                        entry.mesh_port = port;
                    }
                    if let Some(capabilities) = candidate.capabilities {
                        entry.capabilities = capabilities;
                    }
                    let redial = dial
                        && entry.mesh_port != 0
                        && matches!(entry.status, PeerStatus::Error | PeerStatus::Disconnected);
                    (false, redial.then(|| entry.clone()))
                }
                None => {
                    let entry = PeerEntry {
                        node_id: candidate.node_id.clone(),
                        address: candidate.address,
                        mesh_port: candidate.mesh_port.unwrap_or(0),
                        capabilities: candidate.capabilities.unwrap_or_default(),
                        status: PeerStatus::Connecting,
                        source: candidate.source,
                        first_seen: now,
                        last_seen: now,
                        latency: None,
                        connection: None,
                    };
                    info!(
                        peer = %entry.node_id,
                        addr = %entry.socket_addr(),
                        source = ?entry.source,
                        "New peer"
                    );
                    let target = (dial && entry.mesh_port != 0).then(|| entry.clone());
                    peers.insert(candidate.node_id, entry);
                    (true, target)
                }
            }
        };

        if let Some(entry) = dial_target {
            self.emit(PeerCommand::Dial(entry));
        }
        inserted
    }

    /// Transition to `Connected` on `connection`. Returns false for unknown peers.
    pub fn mark_connected(&self, node_id: &str, connection: ConnectionId) -> bool {
        let mut peers = self.lock();
        match peers.get_mut(node_id) {
            Some(entry) => {
                entry.status = PeerStatus::Connected;
                entry.connection = Some(connection);
                entry.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Transition to `Connecting` (a dial is starting).
    pub fn mark_connecting(&self, node_id: &str) {
        let mut peers = self.lock();
        if let Some(entry) = peers.get_mut(node_id) {
            entry.status = PeerStatus::Connecting;
        }
    }

    /// Transition to `Error` after a failed dial.
    pub fn mark_error(&self, node_id: &str) {
        let mut peers = self.lock();
        if let Some(entry) = peers.get_mut(node_id) {
            entry.status = PeerStatus::Error;
            entry.connection = None;
        }
    }

    /// Transition to `Disconnected` and ask the transport to drop the live
    /// connection, if any. Returns true if the status changed.
    pub fn mark_disconnected(&self, node_id: &str) -> bool {
        let dropped = {
            let mut peers = self.lock();
            let Some(entry) = peers.get_mut(node_id) else {
                return false;
            };
            if entry.status == PeerStatus::Disconnected {
                return false;
            }
            entry.status = PeerStatus::Disconnected;
            entry.connection.take()
        };

        if let Some(connection) = dropped {
            self.emit(PeerCommand::Disconnect {
                node_id: node_id.to_string(),
                connection,
            });
        }
        true
    }

    /// The transport lost `connection`. Marks the peer disconnected only if
    /// that connection is still the one on record.
    pub fn mark_connection_lost(&self, node_id: &str, connection: ConnectionId) -> bool {
        let mut peers = self.lock();
        match peers.get_mut(node_id) {
            Some(entry) if entry.connection == Some(connection) => {
                entry.status = PeerStatus::Disconnected;
                entry.connection = None;
                true
            }
            _ => false,
        }
    }

    /// Whether `node_id` is connected and routed through `connection`.
    pub fn is_connected_via(&self, node_id: &str, connection: ConnectionId) -> bool {
        self.lock().get(node_id).is_some_and(|p| {
            p.status == PeerStatus::Connected && p.connection == Some(connection)
        })
    }

    /// Record inbound traffic from a peer.
    pub fn touch(&self, node_id: &str) {
        let mut peers = self.lock();
        if let Some(entry) = peers.get_mut(node_id) {
            entry.last_seen = Utc::now();
        }
    }

    pub fn update_capabilities(&self, node_id: &str, capabilities: Capabilities) {
        let mut peers = self.lock();
        if let Some(entry) = peers.get_mut(node_id) {
            entry.capabilities = capabilities;
        }
    }

    pub fn record_latency(&self, node_id: &str, latency: Duration) {
        let mut peers = self.lock();
        if let Some(entry) = peers.get_mut(node_id) {
            entry.latency = Some(latency);
            entry.last_seen = Utc::now();
        }
    }

    /// Connected peers not seen for longer than `timeout`. The caller is
    /// responsible for transitioning them.
    pub fn prune(&self, timeout: Duration) -> Vec<PeerEntry> {
        self.prune_at(Utc::now(), timeout)
    }

    pub fn prune_at(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<PeerEntry> {
        let peers = self.lock();
        peers
            .values()
            .filter(|p| p.status == PeerStatus::Connected && p.age_at(now) > timeout)
            .cloned()
            .collect()
    }

    /// Remove non-connected peers not seen for longer than `ttl`.
    pub fn reap(&self, ttl: Duration) -> Vec<String> {
        self.reap_at(Utc::now(), ttl)
    }

    pub fn reap_at(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let mut peers = self.lock();
        let stale: Vec<String> = peers
            .values()
            .filter(|p| p.status != PeerStatus::Connected && p.age_at(now) > ttl)
            .map(|p| p.node_id.clone())
            .collect();
        for node_id in &stale {
            peers.remove(node_id);
        }
        stale
    }

    /// Get a snapshot of a specific peer.
    pub fn get(&self, node_id: &str) -> Option<PeerEntry> {
        self.lock().get(node_id).cloned()
    }

    /// Get all peers, in no particular order.
    pub fn all(&self) -> Vec<PeerEntry> {
        self.lock().values().cloned().collect()
    }

    /// Get all connected peers.
    pub fn connected(&self) -> Vec<PeerEntry> {
        self.lock()
            .values()
            .filter(|p| p.status == PeerStatus::Connected)
            .cloned()
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|p| p.status == PeerStatus::Connected)
            .count()
    }

    /// Total number of peers, in any status.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// True if a connected peer advertises this mesh address.
    pub fn is_connected_addr(&self, addr: SocketAddr) -> bool {
        self.lock()
            .values()
            .any(|p| p.status == PeerStatus::Connected && p.socket_addr() == addr)
    }
}
