//! Heartbeat supervisor: liveness pings, latency and dead-peer eviction.
//!
//! Two background loops share a [`PingTracker`]:
//!
//! - the **ping loop** sends a `Ping` to every connected peer each interval
//!   and records `(message id → peer, send instant)`;
//! - the **prune loop** disconnects connected peers that have been silent
//!   for longer than the peer timeout, expires pings that were never
//!   answered, evicts long-dead entries from the directory and re-dials
//!   static peers that have no live connection.
//!
//! Pongs are matched by the router, which calls [`PingTracker::complete`]
//! and stores the round trip on the peer.

use crate::error::{KernelError, KernelResult};
use dashmap::DashMap;
use peermesh_types::envelope::Envelope;
use peermesh_wire::{shutdown_requested, EnvelopeSink, MeshTransport, PeerDirectory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// A ping waiting for its pong.
struct PendingPing {
    node_id: String,
    sent_at: Instant,
    waiter: Option<oneshot::Sender<Duration>>,
}

/// Outstanding pings, keyed by the ping envelope id.
#[derive(Default)]
pub struct PingTracker {
    pending: DashMap<String, PendingPing>,
}

impl PingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a ping sent to `node_id`.
    pub fn track(&self, message_id: &str, node_id: &str) {
        self.insert(message_id, node_id, None);
    }

    /// Record a ping and get notified with the round trip when it completes.
    pub fn track_with_waiter(&self, message_id: &str, node_id: &str) -> oneshot::Receiver<Duration> {
        let (tx, rx) = oneshot::channel();
        self.insert(message_id, node_id, Some(tx));
        rx
    }

    fn insert(&self, message_id: &str, node_id: &str, waiter: Option<oneshot::Sender<Duration>>) {
        self.pending.insert(
            message_id.to_string(),
            PendingPing {
                node_id: node_id.to_string(),
                sent_at: Instant::now(),
                waiter,
            },
        );
    }

    /// Match a pong. `from` must be the node the ping went to when the pong
    /// names its sender. Returns the peer and round trip.
    pub fn complete(&self, reply_to: &str, from: Option<&str>) -> Option<(String, Duration)> {
        let (_, ping) = self
            .pending
            .remove_if(reply_to, |_, p| from.map_or(true, |f| f == p.node_id))?;
        let rtt = ping.sent_at.elapsed();
        if let Some(waiter) = ping.waiter {
            let _ = waiter.send(rtt);
        }
        Some((ping.node_id, rtt))
    }

    /// Forget a ping whose send failed or whose caller gave up.
    pub fn cancel(&self, message_id: &str) {
        self.pending.remove(message_id);
    }

    /// Drop pings older than `max_age`. Returns how many were dropped.
    pub fn expire(&self, max_age: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.sent_at.elapsed() <= max_age);
        before.saturating_sub(self.pending.len())
    }

    /// Number of pings without a pong.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Heartbeat timing.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between ping rounds.
    pub ping_interval: Duration,
    /// Silence after which a connected peer is disconnected.
    pub peer_timeout: Duration,
    /// Time between prune passes.
    pub prune_interval: Duration,
    /// Age after which a non-connected entry is removed.
    pub peer_eviction: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(60),
            prune_interval: Duration::from_secs(60),
            peer_eviction: Duration::from_secs(300),
        }
    }
}

/// What one prune pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruneReport {
    /// Peers transitioned to `Disconnected` for silence.
    pub disconnected: Vec<String>,
    /// Pings dropped without a pong.
    pub expired_pings: usize,
    /// Entries removed from the directory.
    pub evicted: Vec<String>,
}

/// Statically configured peers the prune loop keeps connected.
struct StaticPeers {
    transport: Arc<MeshTransport>,
    addrs: Vec<String>,
}

/// Drives the ping and prune loops.
pub struct HeartbeatSupervisor {
    config: HeartbeatConfig,
    directory: PeerDirectory,
    sink: Arc<dyn EnvelopeSink>,
    tracker: Arc<PingTracker>,
    static_peers: Option<StaticPeers>,
}

impl HeartbeatSupervisor {
    pub fn new(
        config: HeartbeatConfig,
        directory: PeerDirectory,
        sink: Arc<dyn EnvelopeSink>,
        tracker: Arc<PingTracker>,
    ) -> Self {
        Self {
            config,
            directory,
            sink,
            tracker,
            static_peers: None,
        }
    }

    /// Re-dial these addresses from the prune loop while they are unconnected.
    pub fn with_static_peers(mut self, transport: Arc<MeshTransport>, addrs: Vec<String>) -> Self {
        if !addrs.is_empty() {
            self.static_peers = Some(StaticPeers { transport, addrs });
        }
        self
    }

    pub fn tracker(&self) -> &Arc<PingTracker> {
        &self.tracker
    }

    /// Ping every connected peer once. Returns how many pings went out.
    pub async fn ping_all(&self) -> usize {
        let mut sent = 0;
        for peer in self.directory.connected() {
            let ping = Envelope::ping(&peer.node_id);
            let id = ping.id.clone();
            self.tracker.track(&id, &peer.node_id);
            match self.sink.send(ping).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    self.tracker.cancel(&id);
                    debug!(peer = %peer.node_id, error = %e, "Heartbeat ping failed");
                }
            }
        }
        sent
    }

    /// Send one ping and wait for its pong.
    pub async fn ping(&self, node_id: &str, timeout: Duration) -> KernelResult<Duration> {
        let ping = Envelope::ping(node_id);
        let id = ping.id.clone();
        let waiter = self.tracker.track_with_waiter(&id, node_id);
        if let Err(e) = self.sink.send(ping).await {
            self.tracker.cancel(&id);
            return Err(e.into());
        }
        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(rtt)) => Ok(rtt),
            _ => {
                self.tracker.cancel(&id);
                Err(KernelError::PingTimeout(node_id.to_string()))
            }
        }
    }

    /// One prune pass over the directory and the ping tracker.
    pub fn prune_once(&self) -> PruneReport {
        let mut report = PruneReport::default();
        for peer in self.directory.prune(self.config.peer_timeout) {
            warn!(
                peer = %peer.node_id,
                last_seen = %peer.last_seen,
                "Peer timed out, disconnecting"
            );
            if self.directory.mark_disconnected(&peer.node_id) {
                report.disconnected.push(peer.node_id);
            }
        }
        report.expired_pings = self.tracker.expire(self.config.peer_timeout);
        report.evicted = self.directory.reap(self.config.peer_eviction);
        for node_id in &report.evicted {
            info!(peer = %node_id, "Evicted stale peer");
        }
        report
    }

    /// Dial every static peer that has no live connection and no dial in
    /// flight. Returns how many dials were started.
    pub async fn redial_static_peers(&self) -> usize {
        let Some(statics) = &self.static_peers else {
            return 0;
        };
        let mut started = 0;
        for addr in &statics.addrs {
            let resolved = match tokio::net::lookup_host(addr.as_str()).await {
                Ok(iter) => iter.collect::<Vec<_>>(),
                Err(e) => {
                    debug!(%addr, error = %e, "Static peer did not resolve");
                    continue;
                }
            };
            if resolved.iter().any(|a| {
                self.directory.is_connected_addr(*a) || statics.transport.has_open_connection_to(*a)
            }) {
                continue;
            }
            if statics.transport.spawn_dial_addr(addr.clone()) {
                debug!(%addr, "Re-dialling static peer");
                started += 1;
            }
        }
        started
    }

    /// Ping loop. Runs until shutdown.
    pub async fn run_ping_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.ping_interval.as_millis() as u64,
            "Heartbeat ping loop started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.ping_interval) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
            let sent = self.ping_all().await;
            debug!(sent, pending = self.tracker.pending(), "Heartbeat round");
        }
        debug!("Heartbeat ping loop stopped");
    }

    /// Prune loop. Runs until shutdown.
    pub async fn run_prune_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.prune_interval.as_millis() as u64,
            timeout_ms = self.config.peer_timeout.as_millis() as u64,
            "Heartbeat prune loop started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.prune_interval) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
            let report = self.prune_once();
            if report != PruneReport::default() {
                info!(
                    disconnected = report.disconnected.len(),
                    expired_pings = report.expired_pings,
                    evicted = report.evicted.len(),
                    "Prune pass"
                );
            }
            let redialled = self.redial_static_peers().await;
            if redialled > 0 {
                info!(redialled, "Re-dialling static peers");
            }
        }
        debug!("Heartbeat prune loop stopped");
    }
}
