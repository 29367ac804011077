//! The PeerMesh kernel: owns every subsystem of one mesh node.

use crate::config::load_config;
use crate::error::{KernelError, KernelResult};
use crate::heartbeat::{HeartbeatConfig, HeartbeatSupervisor, PingTracker};
use crate::registry::{ComponentRegistry, ComponentSummary};
use crate::router::{MessageRouter, RouterConfig, RouterStats};
use crate::supervisor::Supervisor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peermesh_types::component::Component;
use peermesh_types::config::MeshConfig;
use peermesh_types::envelope::Envelope;
use peermesh_types::error::MeshError;
use peermesh_types::peer::{generate_node_id, NodeInfo, PeerStatus};
use peermesh_wire::{
    DiscoveryConfig, DiscoveryService, EnvelopeSink, MeshTransport, PeerDirectory,
    TransportConfig, WireError,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Time allowed for the farewell broadcast.
const SHUTDOWN_BROADCAST_TIMEOUT: Duration = Duration::from_secs(2);
/// Time allowed for connections to close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Time allowed for background loops to stop before they are aborted.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One peer as reported by [`MeshKernel::status`].
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub node_id: String,
    pub address: SocketAddr,
    pub status: PeerStatus,
    pub last_seen: DateTime<Utc>,
    pub latency_ms: Option<f64>,
}

/// Snapshot of a running node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub mesh_addr: Option<SocketAddr>,
    pub peers: Vec<PeerSummary>,
    pub connected_peers: usize,
    pub components: Vec<ComponentSummary>,
    pub pending_pings: usize,
    pub panic_count: u64,
    pub router: RouterStats,
    pub shutting_down: bool,
}

/// Sink used when the mesh is disabled: nothing is reachable.
struct DetachedSink;

#[async_trait]
impl EnvelopeSink for DetachedSink {
    async fn send(&self, envelope: Envelope) -> Result<usize, WireError> {
        match envelope.to_node_id {
            Some(to) => Err(WireError::NoRoute(to)),
            None => Ok(0),
        }
    }
}

/// The main PeerMesh kernel.
pub struct MeshKernel {
    node: NodeInfo,
    config: MeshConfig,
    supervisor: Arc<Supervisor>,
    directory: PeerDirectory,
    components: ComponentRegistry,
    transport: Option<Arc<MeshTransport>>,
    sink: Arc<dyn EnvelopeSink>,
    router: Arc<MessageRouter>,
    heartbeat: Arc<HeartbeatSupervisor>,
    stopping: AtomicBool,
}

impl MeshKernel {
    /// Boot with the config file at `config_path` (or the default path).
    pub async fn boot(config_path: Option<&Path>) -> KernelResult<Arc<Self>> {
        Self::boot_with_config(load_config(config_path)).await
    }

    /// Boot with an explicit configuration.
    ///
    /// Binding the mesh listener is the only step that can fail; every other
    /// subsystem degrades to a logged warning.
    pub async fn boot_with_config(config: MeshConfig) -> KernelResult<Arc<Self>> {
        config.validate()?;

        let node_id = config
            .node_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_node_id);
        info!(node_id = %node_id, "Booting PeerMesh kernel");

        let supervisor = Arc::new(Supervisor::new());
        let (directory, commands) = PeerDirectory::new();
        let components = ComponentRegistry::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let mut node = NodeInfo {
            node_id,
            mesh_port: 0,
            capabilities: config.capabilities.clone(),
        };

        let transport = if config.mesh_enabled {
            let transport_config = TransportConfig {
                listen_addr: config.mesh_listen_addr(),
                node_id: node.node_id.clone(),
                capabilities: node.capabilities.clone(),
                connect_timeout: config.connect_timeout(),
            };
            let (transport, accept) = MeshTransport::start(
                transport_config,
                directory.clone(),
                inbound_tx.clone(),
                supervisor.subscribe(),
            )
            .await
            .map_err(|e| KernelError::BootFailed(e.to_string()))?;
            supervisor.adopt("mesh-accept", accept);
            supervisor.spawn("peer-commands", Arc::clone(&transport).run_commands(commands));
            node.mesh_port = transport.local_addr().port();
            Some(transport)
        } else {
            info!("Mesh disabled, running local-only");
            None
        };

        let sink: Arc<dyn EnvelopeSink> = match &transport {
            Some(t) => Arc::clone(t) as Arc<dyn EnvelopeSink>,
            None => Arc::new(DetachedSink),
        };

        let pings = Arc::new(PingTracker::new());
        let router = Arc::new(MessageRouter::new(
            node.clone(),
            directory.clone(),
            components.clone(),
            Arc::clone(&sink),
            Arc::clone(&pings),
            Arc::clone(&supervisor),
            RouterConfig {
                process_timeout: config.process_timeout(),
                sync_enabled: config.sync_enabled,
            },
            inbound_tx,
        ));
        supervisor.spawn(
            "router",
            Arc::clone(&router).run(inbound_rx, supervisor.subscribe()),
        );

        let mut heartbeat = HeartbeatSupervisor::new(
            HeartbeatConfig {
                ping_interval: config.heartbeat_interval(),
                peer_timeout: config.peer_timeout(),
                prune_interval: config.prune_interval(),
                peer_eviction: config.peer_eviction(),
            },
            directory.clone(),
            Arc::clone(&sink),
            pings,
        );
        if let Some(transport) = &transport {
            heartbeat = heartbeat.with_static_peers(Arc::clone(transport), config.static_peers.clone());
        }
        let heartbeat = Arc::new(heartbeat);
        supervisor.spawn(
            "heartbeat-ping",
            Arc::clone(&heartbeat).run_ping_loop(supervisor.subscribe()),
        );
        supervisor.spawn(
            "heartbeat-prune",
            Arc::clone(&heartbeat).run_prune_loop(supervisor.subscribe()),
        );

        if transport.is_some() && config.discovery_enabled {
            let discovery_config = DiscoveryConfig {
                bind_addr: SocketAddr::new(config.listen_addr, config.discovery_port),
                targets: config.discovery_targets(),
                interval: config.discovery_interval(),
            };
            match DiscoveryService::bind(&node, discovery_config, directory.clone()).await {
                Ok(discovery) => {
                    let (announce, listen) = discovery.spawn(supervisor.subscribe());
                    supervisor.adopt("discovery-announce", announce);
                    supervisor.adopt("discovery-listen", listen);
                }
                Err(e) => warn!(error = %e, "Discovery unavailable, continuing without it"),
            }
        }

        if let Some(transport) = &transport {
            for addr in &config.static_peers {
                transport.spawn_dial_addr(addr.clone());
            }
        }

        info!(
            node_id = %node.node_id,
            mesh_port = node.mesh_port,
            discovery = config.discovery_enabled,
            static_peers = config.static_peers.len(),
            "PeerMesh kernel booted"
        );

        Ok(Arc::new(Self {
            node,
            config,
            supervisor,
            directory,
            components,
            transport,
            sink,
            router,
            heartbeat,
            stopping: AtomicBool::new(false),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Bound mesh address, when the mesh is enabled.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(|t| t.local_addr())
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Start a component and make it routable. A component registered under
    /// an existing id replaces (and stops) the previous one.
    pub async fn register_component(&self, component: Arc<dyn Component>) -> KernelResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(MeshError::ShuttingDown.into());
        }
        component.start().await?;
        if let Some(previous) = self.components.register(Arc::clone(&component)) {
            if !Arc::ptr_eq(&previous.component, &component) {
                if let Err(e) = previous.component.stop().await {
                    warn!(
                        component = previous.component.id(),
                        error = %e,
                        "Replaced component failed to stop"
                    );
                }
            }
        }
        Ok(())
    }

    /// Send an envelope.
    ///
    /// Addressed to this node it is routed locally; addressed to a peer it
    /// goes to that peer's connection (`NoRoute` if there is none); without a
    /// destination it is written to every peer connected right now. Returns
    /// the number of deliveries.
    pub async fn send(&self, mut envelope: Envelope) -> KernelResult<usize> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(MeshError::ShuttingDown.into());
        }
        envelope.validate().map_err(WireError::from)?;
        if envelope.from_node_id.is_none() {
            envelope.from_node_id = Some(self.node.node_id.clone());
        }
        if envelope.to_node_id.as_deref() == Some(self.node.node_id.as_str()) {
            self.router.enqueue(envelope);
            return Ok(1);
        }
        Ok(self.sink.send(envelope).await?)
    }

    /// Ping a peer and wait for the round trip.
    pub async fn ping(&self, node_id: &str, timeout: Duration) -> KernelResult<Duration> {
        self.heartbeat.ping(node_id, timeout).await
    }

    pub fn status(&self) -> NodeStatus {
        let mut peers: Vec<PeerSummary> = self
            .directory
            .all()
            .into_iter()
            .map(|p| PeerSummary {
                address: p.socket_addr(),
                node_id: p.node_id,
                status: p.status,
                last_seen: p.last_seen,
                latency_ms: p.latency.map(|l| l.as_secs_f64() * 1000.0),
            })
            .collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        let health = self.supervisor.health();

        NodeStatus {
            node_id: self.node.node_id.clone(),
            mesh_addr: self.local_addr(),
            connected_peers: self.directory.connected_count(),
            peers,
            components: self.components.summaries(),
            pending_pings: self.heartbeat.tracker().pending(),
            panic_count: health.panic_count,
            router: self.router.stats(),
            shutting_down: health.is_shutting_down,
        }
    }

    /// Orderly shutdown: tell peers, stop loops, close connections, stop
    /// components newest first, join every task. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node_id = %self.node.node_id, "Shutting down PeerMesh kernel");

        if self.transport.is_some() {
            let farewell = Envelope::shutdown("node shutting down").from_node(&self.node.node_id);
            match tokio::time::timeout(SHUTDOWN_BROADCAST_TIMEOUT, self.sink.send(farewell)).await {
                Ok(Ok(n)) => debug!(peers = n, "Shutdown broadcast sent"),
                Ok(Err(e)) => debug!(error = %e, "Shutdown broadcast failed"),
                Err(_) => warn!("Shutdown broadcast timed out"),
            }
        }

        self.supervisor.shutdown();

        if let Some(transport) = &self.transport {
            if tokio::time::timeout(CLOSE_TIMEOUT, transport.close_all())
                .await
                .is_err()
            {
                warn!("Timed out closing mesh connections");
            }
        }

        for component in self.components.all().into_iter().rev() {
            if let Err(e) = component.stop().await {
                warn!(component = component.id(), error = %e, "Component failed to stop");
            }
        }

        let aborted = self.supervisor.join(JOIN_TIMEOUT).await;
        info!(aborted, "PeerMesh kernel stopped");
    }
}
