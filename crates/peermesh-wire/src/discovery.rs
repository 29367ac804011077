//! UDP discovery.
//!
//! Each node periodically broadcasts an [`Announcement`] on the discovery
//! port and listens for the announcements of others. Every valid sighting is
//! fed into the [`PeerDirectory`], which decides whether a dial is needed.
//!
//! ```text
//! {"node_id": "host-1a2b3c4d", "mesh_port": 7400, "capabilities": {}}
//! ```

use crate::directory::{PeerCandidate, PeerDirectory, PeerSource};
use crate::error::WireError;
use crate::shutdown::shutdown_requested;

use peermesh_types::peer::{Capabilities, NodeInfo};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Largest datagram we accept.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Backoff bounds for send/receive failures.
const BACKOFF_MIN: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const BACKOFF_JITTER: f64 = 0.2;

/// Presence datagram broadcast by every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub node_id: String,
    pub mesh_port: u16,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl From<&NodeInfo> for Announcement {
    fn from(node: &NodeInfo) -> Self {
        Self {
            node_id: node.node_id.clone(),
            mesh_port: node.mesh_port,
            capabilities: node.capabilities.clone(),
        }
    }
}

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Address the UDP socket binds to.
    pub bind_addr: SocketAddr,
    /// Where announcements are sent.
    pub targets: Vec<SocketAddr>,
    /// Time between announcements. The first goes out immediately.
    pub interval: Duration,
}

/// Exponential backoff with multiplicative jitter.
#[derive(Debug, Clone)]
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay for the next retry: `min(min * 2^attempt, max) * (1 + rand * jitter)`.
    fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let base = BACKOFF_MIN.saturating_mul(factor).min(BACKOFF_MAX);
        self.attempt = self.attempt.saturating_add(1);
        let frac: f64 = rand::thread_rng().gen_range(0.0..1.0);
        base.mul_f64(1.0 + frac * BACKOFF_JITTER).min(BACKOFF_MAX)
    }
}

/// Announces this node and listens for the announcements of others.
pub struct DiscoveryService {
    socket: UdpSocket,
    announcement: Announcement,
    targets: Vec<SocketAddr>,
    interval: Duration,
    directory: PeerDirectory,
}

impl DiscoveryService {
    /// Bind the discovery socket with broadcast enabled.
    pub async fn bind(
        node: &NodeInfo,
        config: DiscoveryConfig,
        directory: PeerDirectory,
    ) -> Result<Self, WireError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| WireError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        socket.set_broadcast(true)?;

        info!(
            addr = ?socket.local_addr().ok(),
            targets = config.targets.len(),
            interval_secs = config.interval.as_secs(),
            "Discovery listening"
        );

        Ok(Self {
            socket,
            announcement: Announcement::from(node),
            targets: config.targets,
            interval: config.interval,
            directory,
        })
    }

    /// Actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, WireError> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the announce and listen loops. Both stop on shutdown.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> (JoinHandle<()>, JoinHandle<()>) {
        let service = Arc::new(self);
        let announcer = tokio::spawn(Arc::clone(&service).announce_loop(shutdown.clone()));
        let listener = tokio::spawn(service.listen_loop(shutdown));
        (announcer, listener)
    }

    /// Send one announcement to every target. Returns how many sends succeeded.
    pub async fn announce(&self) -> Result<usize, WireError> {
        let datagram = serde_json::to_vec(&self.announcement)?;
        let mut sent = 0;
        let mut last_error = None;
        for target in &self.targets {
            match self.socket.send_to(&datagram, target).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    debug!(%target, error = %e, "Announcement send failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if sent == 0 => Err(WireError::Io(e)),
            _ => Ok(sent),
        }
    }

    async fn announce_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new();
        loop {
            let delay = match self.announce().await {
                Ok(sent) => {
                    trace!(sent, "Announced presence");
                    backoff.reset();
                    self.interval
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "Discovery announce failed"
                    );
                    delay
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        debug!("Discovery announce loop stopped");
    }

    async fn listen_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut backoff = Backoff::new();
        loop {
            let received = tokio::select! {
                r = self.socket.recv_from(&mut buffer) => r,
                _ = shutdown_requested(&mut shutdown) => break,
            };
            match received {
                Ok((len, from)) => {
                    backoff.reset();
                    self.handle_datagram(&buffer[..len], from);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "Discovery receive failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
            }
        }
        debug!("Discovery listen loop stopped");
    }

    /// Parse a datagram and record the sighting. Returns the candidate that
    /// was fed to the directory, if any.
    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) -> Option<PeerCandidate> {
        let announcement: Announcement = match serde_json::from_slice(datagram) {
            Ok(a) => a,
            Err(e) => {
                debug!(%from, error = %e, "Ignoring malformed discovery datagram");
                return None;
            }
        };
        if announcement.node_id == self.announcement.node_id {
            return None;
        }
        if announcement.node_id.is_empty() || announcement.mesh_port == 0 {
            debug!(%from, "Ignoring announcement without node id or port");
            return None;
        }

        let candidate = PeerCandidate {
            node_id: announcement.node_id,
            address: from.ip(),
            mesh_port: Some(announcement.mesh_port),
            capabilities: Some(announcement.capabilities),
            source: PeerSource::Discovery,
        };
        if self.directory.upsert(candidate.clone()) {
            debug!(peer = %candidate.node_id, %from, "Discovered peer");
        }
        Some(candidate)
    }
}
