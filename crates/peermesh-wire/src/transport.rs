//! Mesh transport: the only owner of live TCP connections.
//!
//! A [`MeshTransport`] binds the mesh listener and accepts inbound
//! connections, dials peers on request from the [`PeerDirectory`], and keeps
//! a connection table keyed by node id. Every connection, accepted or
//! dialled, runs its own read loop that decodes frames and forwards the
//! envelopes to the router queue.
//!
//! A connection belongs to exactly one node id. Dialled connections are
//! bound to the peer they were opened for; any other connection is bound by
//! the first `Handshake` it carries. Traffic before that handshake, or
//! naming a different sender, is dropped. A bound connection is registered
//! in the table if the node has no routable one; otherwise it stays open as
//! receive-only and takes over if the registered one goes away.

use crate::directory::{
    ConnectionId, PeerCandidate, PeerCommand, PeerDirectory, PeerEntry, PeerSource,
};
use crate::error::WireError;
use crate::message::{decode_envelope, encode_frame, read_frame, write_frame};
use crate::shutdown::shutdown_requested;

use async_trait::async_trait;
use peermesh_types::envelope::{Envelope, MessageKind};
use peermesh_types::peer::{Capabilities, NodeInfo};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Upper bound on a single frame write before the connection is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can put an envelope on the mesh.
///
/// The router talks to the transport through this trait so it can be
/// exercised without sockets.
#[async_trait]
pub trait EnvelopeSink: Send + Sync + 'static {
    /// Deliver an envelope. Returns the number of peers written to.
    async fn send(&self, envelope: Envelope) -> Result<usize, WireError>;
}

/// Configuration for a [`MeshTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// This node's unique id.
    pub node_id: String,
    /// Capabilities sent in handshakes.
    pub capabilities: Capabilities,
    /// Time allowed for an outbound connect.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            node_id: peermesh_types::peer::generate_node_id(),
            capabilities: Capabilities::new(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// One live TCP connection.
struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    /// Node on the other end, set once.
    node_id: OnceLock<String>,
    /// Serializes frames written to this connection.
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: watch::Sender<bool>,
}

impl Connection {
    async fn write(&self, frame: &[u8]) -> Result<(), WireError> {
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(WRITE_TIMEOUT, write_frame(&mut *writer, frame))
            .await
            .map_err(|_| WireError::Timeout(format!("write to {}", self.peer_addr)))?
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn bound(&self) -> Option<&str> {
        self.node_id.get().map(String::as_str)
    }
}

/// The local mesh endpoint.
pub struct MeshTransport {
    node: NodeInfo,
    directory: PeerDirectory,
    /// Router queue for decoded inbound envelopes.
    inbound: mpsc::UnboundedSender<Envelope>,
    /// Routable connections, keyed by node id.
    table: Mutex<HashMap<String, Arc<Connection>>>,
    /// Every open connection, routable or not.
    live: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_connection_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Static addresses with a dial in flight.
    pending_dials: Mutex<HashSet<String>>,
    local_addr: SocketAddr,
    connect_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl MeshTransport {
    /// Bind the listener and spawn the accept loop.
    ///
    /// A bind failure is the one fatal transport error.
    pub async fn start(
        config: TransportConfig,
        directory: PeerDirectory,
        inbound: mpsc::UnboundedSender<Envelope>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| WireError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            node_id = %config.node_id,
            "Mesh transport listening"
        );

        let transport = Arc::new(Self {
            node: NodeInfo {
                node_id: config.node_id,
                mesh_port: local_addr.port(),
                capabilities: config.capabilities,
            },
            directory,
            inbound,
            table: Mutex::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            pending_dials: Mutex::new(HashSet::new()),
            local_addr,
            connect_timeout: config.connect_timeout,
            shutdown,
        });

        let accept_handle = tokio::spawn(Arc::clone(&transport).accept_loop(listener));
        Ok((transport, accept_handle))
    }

    /// Actual bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identity advertised by this transport.
    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    /// Whether a routable connection to `node_id` exists.
    pub fn has_connection(&self, node_id: &str) -> bool {
        self.lock_table().contains_key(node_id)
    }

    /// Node ids with a routable connection.
    pub fn connected_nodes(&self) -> Vec<String> {
        self.lock_table().keys().cloned().collect()
    }

    /// Number of open connections, routable or not.
    pub fn open_connections(&self) -> usize {
        self.lock_live().len()
    }

    /// Whether any open connection, handshaken or not, goes to `addr`.
    pub fn has_open_connection_to(&self, addr: SocketAddr) -> bool {
        self.lock_live().values().any(|c| c.peer_addr == addr)
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_live(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Accept loop, runs in a spawned task.
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "Accepted mesh connection");
                        self.install(stream, addr, None);
                    }
                    Err(e) => {
                        error!(error = %e, "Mesh accept error");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = shutdown_requested(&mut shutdown) => break,
                        }
                    }
                },
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        debug!("Mesh accept loop stopped");
    }

    /// Split a stream, record it as live and spawn its read loop.
    fn install(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        node_id: Option<&str>,
    ) -> Arc<Connection> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (closed_tx, closed_rx) = watch::channel(false);
        let bound = node_id
            .map(|id| OnceLock::from(id.to_string()))
            .unwrap_or_default();
        let connection = Arc::new(Connection {
            id,
            peer_addr,
            node_id: bound,
            writer: tokio::sync::Mutex::new(writer),
            closed: closed_tx,
        });
        self.lock_live().insert(id, Arc::clone(&connection));

        let handle = tokio::spawn(Arc::clone(self).read_loop(
            reader,
            Arc::clone(&connection),
            closed_rx,
        ));
        self.track(handle);
        connection
    }

    /// Read/decode loop for one connection.
    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        connection: Arc<Connection>,
        mut closed: watch::Receiver<bool>,
    ) {
        let mut shutdown = self.shutdown.clone();
        let peer_addr = connection.peer_addr;

        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut reader) => frame,
                _ = shutdown_requested(&mut closed) => break,
                _ = shutdown_requested(&mut shutdown) => break,
            };
            let body = match frame {
                Ok(body) => body,
                Err(WireError::ConnectionClosed) => {
                    debug!(%peer_addr, "Mesh connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(%peer_addr, error = %e, "Mesh connection failed, closing");
                    break;
                }
            };

            let envelope = match decode_envelope(&body) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(%peer_addr, error = %e, "Dropping malformed frame");
                    continue;
                }
            };

            if envelope.from_node_id.as_deref() == Some(self.node.node_id.as_str()) {
                debug!(%peer_addr, "Ignoring envelope carrying our own node id");
                continue;
            }
            let Some(envelope) = self.attribute(&connection, envelope) else {
                continue;
            };

            if self.inbound.send(envelope).is_err() {
                debug!(%peer_addr, "Router queue closed, stopping read loop");
                break;
            }
        }

        self.release(&connection);
    }

    /// Check `envelope` against the node `connection` is bound to, binding
    /// it on the first handshake. Returns the envelope with its sender
    /// filled in, or `None` if it must be dropped.
    fn attribute(&self, connection: &Arc<Connection>, mut envelope: Envelope) -> Option<Envelope> {
        let peer_addr = connection.peer_addr;
        let claimed = match &envelope.kind {
            MessageKind::Handshake(h) => Some(h.node_id.clone()),
            _ => None,
        };

        let node_id = match (connection.bound(), claimed) {
            (Some(bound), Some(claimed)) if bound != claimed => {
                warn!(%peer_addr, bound, claimed = %claimed, "Dropping handshake for a different node");
                return None;
            }
            (Some(bound), _) => bound.to_string(),
            (None, Some(claimed)) => {
                if claimed.is_empty() || claimed == self.node.node_id {
                    debug!(%peer_addr, "Ignoring handshake without a usable node id");
                    return None;
                }
                connection.node_id.get_or_init(|| claimed).clone()
            }
            (None, None) => {
                debug!(
                    %peer_addr,
                    message_type = envelope.message_type(),
                    "Dropping envelope received before handshake"
                );
                return None;
            }
        };

        match envelope.from_node_id.as_deref() {
            None => envelope.from_node_id = Some(node_id.clone()),
            Some(from) if from != node_id => {
                warn!(%peer_addr, bound = %node_id, from, "Dropping envelope with mismatched sender");
                return None;
            }
            Some(_) => {}
        }

        self.observe(connection, &node_id, &envelope);
        Some(envelope)
    }

    /// Record traffic from `from` on `connection`, registering the
    /// connection if the node has no routable one.
    fn observe(&self, connection: &Arc<Connection>, from: &str, envelope: &Envelope) {
        let registered = {
            let mut table = self.lock_table();
            if table.contains_key(from) {
                false
            } else {
                table.insert(from.to_string(), Arc::clone(connection));
                true
            }
        };

        if !registered {
            self.directory.touch(from);
            return;
        }

        let (mesh_port, capabilities) = match &envelope.kind {
            MessageKind::Handshake(h) => (Some(h.mesh_port), Some(h.capabilities.clone())),
            _ => (None, None),
        };
        self.directory.upsert_inbound(PeerCandidate {
            node_id: from.to_string(),
            address: connection.peer_addr.ip(),
            mesh_port,
            capabilities,
            source: PeerSource::Inbound,
        });
        self.directory.mark_connected(from, connection.id);
        info!(
            peer = %from,
            addr = %connection.peer_addr,
            connection = connection.id,
            "Peer connected"
        );
    }

    /// Forget a connection: unregister it and mark any peer that was routed
    /// through it as disconnected. Idempotent.
    fn release(&self, connection: &Connection) {
        connection.close();
        self.lock_live().remove(&connection.id);
        let lost: Vec<String> = {
            let mut table = self.lock_table();
            let ids: Vec<String> = table
                .iter()
                .filter(|(_, c)| c.id == connection.id)
                .map(|(node_id, _)| node_id.clone())
                .collect();
            for node_id in &ids {
                table.remove(node_id);
            }
            ids
        };
        for node_id in lost {
            if self.directory.mark_connection_lost(&node_id, connection.id) {
                info!(peer = %node_id, connection = connection.id, "Peer disconnected");
            }
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, WireError> {
        tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| WireError::Timeout(format!("connect to {addr}")))?
            .map_err(WireError::from)
    }

    /// Open an outbound connection to a known peer and send our handshake.
    ///
    /// On failure the peer is marked `Error`; there is no automatic retry.
    pub async fn dial(self: &Arc<Self>, peer: &PeerEntry) -> Result<(), WireError> {
        if self.has_connection(&peer.node_id) {
            debug!(peer = %peer.node_id, "Already connected, skipping dial");
            return Ok(());
        }

        let addr = peer.socket_addr();
        info!(peer = %peer.node_id, %addr, "Dialling peer");
        self.directory.mark_connecting(&peer.node_id);

        let stream = match self.connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer.node_id, %addr, error = %e, "Dial failed");
                self.directory.mark_error(&peer.node_id);
                return Err(e);
            }
        };

        let connection = self.install(stream, addr, Some(peer.node_id.as_str()));
        let routable = {
            let mut table = self.lock_table();
            let entry = table
                .entry(peer.node_id.clone())
                .or_insert_with(|| Arc::clone(&connection));
            entry.id == connection.id
        };
        if routable {
            self.directory.mark_connected(&peer.node_id, connection.id);
            info!(peer = %peer.node_id, connection = connection.id, "Peer connected");
        }

        let handshake = Envelope::handshake(&self.node)
            .to(peer.node_id.as_str())
            .expecting_response();
        self.write_to(&connection, &handshake).await
    }

    /// Dial a static address whose node id is not known yet. The peer is
    /// registered when its handshake reply arrives.
    pub async fn dial_addr(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, WireError> {
        let resolved = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| WireError::NoRoute(addr.to_string()))?;
        info!(addr = %resolved, "Dialling static peer");

        let stream = self.connect(resolved).await?;
        let connection = self.install(stream, resolved, None);
        let handshake = Envelope::handshake(&self.node).expecting_response();
        self.write_to(&connection, &handshake).await?;
        Ok(resolved)
    }

    /// Run [`dial_addr`](Self::dial_addr) in a tracked task that stops on
    /// shutdown. Returns false without dialling while a dial to `addr` is in
    /// flight or a connection to it is already open.
    pub fn spawn_dial_addr(self: &Arc<Self>, addr: String) -> bool {
        if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
            if self.has_open_connection_to(socket_addr) {
                return false;
            }
        }
        if !self.lock_pending_dials().insert(addr.clone()) {
            debug!(%addr, "Static dial already in flight");
            return false;
        }

        let transport = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                result = transport.dial_addr(&addr) => {
                    if let Err(e) = result {
                        warn!(%addr, error = %e, "Static peer dial failed");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {}
            }
            transport.lock_pending_dials().remove(&addr);
        });
        self.track(handle);
        true
    }

    fn lock_pending_dials(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending_dials.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The registered connection for `node_id`, if the directory still
    /// routes the peer through it. A peer marked disconnected stops being
    /// routable at once, before its `Disconnect` command closes the socket.
    fn route_to(&self, node_id: &str) -> Option<Arc<Connection>> {
        let connection = self.lock_table().get(node_id).cloned()?;
        self.directory
            .is_connected_via(node_id, connection.id)
            .then_some(connection)
    }

    async fn write_to(&self, connection: &Connection, envelope: &Envelope) -> Result<(), WireError> {
        let frame = encode_frame(envelope)?;
        self.write_frame_to(connection, &frame).await
    }

    async fn write_frame_to(&self, connection: &Connection, frame: &[u8]) -> Result<(), WireError> {
        if let Err(e) = connection.write(frame).await {
            warn!(
                addr = %connection.peer_addr,
                connection = connection.id,
                error = %e,
                "Mesh write failed, dropping connection"
            );
            self.release(connection);
            return Err(e);
        }
        Ok(())
    }

    /// Send an envelope.
    ///
    /// Without a destination the envelope is written to every routable
    /// connection that exists at the moment of the call; individual failures
    /// are logged and skipped. With a destination it goes to that node's
    /// connection or fails with [`WireError::NoRoute`].
    pub async fn send(&self, mut envelope: Envelope) -> Result<usize, WireError> {
        if envelope.from_node_id.is_none() {
            envelope.from_node_id = Some(self.node.node_id.clone());
        }
        let frame = encode_frame(&envelope)?;

        match envelope.to_node_id.as_deref() {
            None => {
                let registered: Vec<String> = self.lock_table().keys().cloned().collect();
                let targets: Vec<(String, Arc<Connection>)> = registered
                    .into_iter()
                    .filter_map(|node_id| self.route_to(&node_id).map(|c| (node_id, c)))
                    .collect();
                let mut delivered = 0;
                for (node_id, connection) in targets {
                    match self.write_frame_to(&connection, &frame).await {
                        Ok(()) => delivered += 1,
                        Err(e) => {
                            debug!(peer = %node_id, error = %e, "Broadcast skipped peer");
                        }
                    }
                }
                debug!(
                    id = %envelope.id,
                    message_type = envelope.message_type(),
                    delivered,
                    "Broadcast envelope"
                );
                Ok(delivered)
            }
            Some(node_id) => {
                let connection = self
                    .route_to(node_id)
                    .ok_or_else(|| WireError::NoRoute(node_id.to_string()))?;
                self.write_frame_to(&connection, &frame).await?;
                Ok(1)
            }
        }
    }

    /// Close the routable connection to `node_id` if it is still `connection`.
    pub fn close_connection(&self, node_id: &str, connection: ConnectionId) {
        let removed = {
            let mut table = self.lock_table();
            match table.get(node_id) {
                Some(c) if c.id == connection => table.remove(node_id),
                _ => None,
            }
        };
        if let Some(c) = removed {
            info!(peer = %node_id, connection, "Closing peer connection");
            c.close();
        }
    }

    /// Execute directory commands until shutdown.
    pub async fn run_commands(self: Arc<Self>, mut commands: mpsc::UnboundedReceiver<PeerCommand>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let command = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                _ = shutdown_requested(&mut shutdown) => break,
            };

            match command {
                PeerCommand::Dial(peer) => {
                    let transport = Arc::clone(&self);
                    let handle = tokio::spawn(async move {
                        if let Err(e) = transport.dial(&peer).await {
                            debug!(peer = %peer.node_id, error = %e, "Dial attempt ended");
                        }
                    });
                    self.track(handle);
                }
                PeerCommand::Disconnect {
                    node_id,
                    connection,
                } => self.close_connection(&node_id, connection),
            }
        }
        debug!("Peer command loop stopped");
    }

    /// Close every connection and wait for their read loops and dials.
    pub async fn close_all(&self) {
        let connections: Vec<Arc<Connection>> = self.lock_live().values().cloned().collect();
        for connection in &connections {
            connection.close();
        }
        self.lock_table().clear();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Connection task panicked");
                }
            }
        }
        info!(closed = connections.len(), "Mesh connections closed");
    }
}

#[async_trait]
impl EnvelopeSink for MeshTransport {
    async fn send(&self, envelope: Envelope) -> Result<usize, WireError> {
        MeshTransport::send(self, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::write_envelope;
    use peermesh_types::envelope::Payload;
    use peermesh_types::peer::PeerStatus;
    use tokio::io::AsyncWriteExt;

    struct TestNode {
        transport: Arc<MeshTransport>,
        directory: PeerDirectory,
        inbound: mpsc::UnboundedReceiver<Envelope>,
        _shutdown: watch::Sender<bool>,
    }

    async fn start_node(node_id: &str) -> TestNode {
        let (directory, commands) = PeerDirectory::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = TransportConfig {
            node_id: node_id.to_string(),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let (transport, _accept) = MeshTransport::start(config, directory.clone(), tx, shutdown_rx)
            .await
            .unwrap();
        tokio::spawn(Arc::clone(&transport).run_commands(commands));
        TestNode {
            transport,
            directory,
            inbound: rx,
            _shutdown: shutdown_tx,
        }
    }

    fn sighting(node: &TestNode) -> PeerCandidate {
        PeerCandidate {
            node_id: node.transport.node_id().to_string(),
            address: node.transport.local_addr().ip(),
            mesh_port: Some(node.transport.local_addr().port()),
            capabilities: None,
            source: PeerSource::Discovery,
        }
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached: {what}");
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("inbound channel closed")
    }

    /// Handshake as sent by a hand-rolled client.
    fn handshake_as(node_id: &str) -> Envelope {
        Envelope::handshake(&NodeInfo {
            node_id: node_id.to_string(),
            mesh_port: 1,
            capabilities: Capabilities::new(),
        })
    }

    async fn connect_pair(a: &TestNode, b: &TestNode) {
        a.directory.upsert(sighting(b));
        let b_id = b.transport.node_id().to_string();
        let a_id = a.transport.node_id().to_string();
        eventually("a sees b connected", || a.transport.has_connection(&b_id)).await;
        eventually("b sees a connected", || b.transport.has_connection(&a_id)).await;
    }

    #[tokio::test]
    async fn test_dial_connects_both_sides() {
        let a = start_node("node-a").await;
        let mut b = start_node("node-b").await;
        connect_pair(&a, &b).await;

        assert_eq!(
            a.directory.get("node-b").unwrap().status,
            PeerStatus::Connected
        );
        let inbound = b.directory.get("node-a").unwrap();
        assert_eq!(inbound.status, PeerStatus::Connected);
        assert_eq!(inbound.source, PeerSource::Inbound);
        assert_eq!(inbound.mesh_port, a.transport.local_addr().port());

        let handshake = recv(&mut b.inbound).await;
        assert!(matches!(handshake.kind, MessageKind::Handshake(_)));
        assert!(handshake.requires_response);
        assert_eq!(handshake.from_node_id.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_unicast_without_connection_is_no_route() {
        let a = start_node("node-a").await;
        let err = a
            .transport
            .send(Envelope::custom("Hello", Payload::new()).to("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::NoRoute(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_unicast_reaches_peer_in_order() {
        let a = start_node("node-a").await;
        let mut b = start_node("node-b").await;
        connect_pair(&a, &b).await;
        let _handshake = recv(&mut b.inbound).await;

        let mut sent = Vec::new();
        for i in 0..20 {
            let mut payload = Payload::new();
            payload.insert("seq".into(), i.into());
            let env = Envelope::custom("Seq", payload).to("node-b");
            sent.push(env.id.clone());
            assert_eq!(a.transport.send(env).await.unwrap(), 1);
        }
        for id in sent {
            let got = recv(&mut b.inbound).await;
            assert_eq!(got.id, id);
            assert_eq!(got.from_node_id.as_deref(), Some("node-a"));
        }
    }

    #[tokio::test]
    async fn test_broadcast_only_reaches_peers_connected_at_call() {
        let hub = start_node("hub").await;
        let mut b = start_node("node-b").await;
        let mut c = start_node("node-c").await;
        connect_pair(&hub, &b).await;
        connect_pair(&hub, &c).await;
        let _ = recv(&mut b.inbound).await;
        let _ = recv(&mut c.inbound).await;

        let env = Envelope::data_sync(Payload::new());
        let id = env.id.clone();
        assert_eq!(hub.transport.send(env).await.unwrap(), 2);
        assert_eq!(recv(&mut b.inbound).await.id, id);
        assert_eq!(recv(&mut c.inbound).await.id, id);

        let mut late = start_node("node-late").await;
        connect_pair(&hub, &late).await;
        let handshake = recv(&mut late.inbound).await;
        assert!(matches!(handshake.kind, MessageKind::Handshake(_)));
        let nothing = tokio::time::timeout(Duration::from_millis(100), late.inbound.recv()).await;
        assert!(nothing.is_err(), "late peer must not see the earlier broadcast");
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let mut b = start_node("node-b").await;
        let mut stream = TcpStream::connect(b.transport.local_addr()).await.unwrap();
        write_envelope(&mut stream, &handshake_as("raw-client")).await.unwrap();

        let first = Envelope::custom("Hello", Payload::new()).from_node("raw-client");
        write_envelope(&mut stream, &first).await.unwrap();
        let garbage = b"{definitely not an envelope";
        stream
            .write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(garbage).await.unwrap();
        let second = Envelope::custom("Hello", Payload::new()).from_node("raw-client");
        write_envelope(&mut stream, &second).await.unwrap();

        assert!(matches!(recv(&mut b.inbound).await.kind, MessageKind::Handshake(_)));
        assert_eq!(recv(&mut b.inbound).await.id, first.id);
        assert_eq!(recv(&mut b.inbound).await.id, second.id);
        assert!(b.transport.has_connection("raw-client"));
    }

    #[tokio::test]
    async fn test_sender_is_bound_by_first_handshake() {
        let mut b = start_node("node-b").await;
        let mut stream = TcpStream::connect(b.transport.local_addr()).await.unwrap();
        write_envelope(&mut stream, &handshake_as("node-y")).await.unwrap();

        let spoofed = Envelope::custom("Hello", Payload::new())
            .from_node("node-x")
            .to("node-b");
        let unsigned = Envelope::custom("Hello", Payload::new());
        let rebind = handshake_as("node-x");
        let genuine = Envelope::custom("Hello", Payload::new()).from_node("node-y");
        for env in [&spoofed, &unsigned, &rebind, &genuine] {
            write_envelope(&mut stream, env).await.unwrap();
        }

        let handshake = recv(&mut b.inbound).await;
        assert_eq!(handshake.from_node_id.as_deref(), Some("node-y"));
        let got = recv(&mut b.inbound).await;
        assert_eq!(got.id, unsigned.id);
        assert_eq!(got.from_node_id.as_deref(), Some("node-y"));
        assert_eq!(recv(&mut b.inbound).await.id, genuine.id);

        assert!(b.directory.get("node-x").is_none());
        assert!(!b.transport.has_connection("node-x"));
        assert_eq!(b.transport.connected_nodes(), vec!["node-y".to_string()]);
    }

    #[tokio::test]
    async fn test_traffic_before_handshake_is_dropped() {
        let mut b = start_node("node-b").await;
        let mut stream = TcpStream::connect(b.transport.local_addr()).await.unwrap();
        let early = Envelope::custom("Hello", Payload::new()).from_node("node-x");
        write_envelope(&mut stream, &early).await.unwrap();
        write_envelope(&mut stream, &handshake_as("node-y")).await.unwrap();

        let first = recv(&mut b.inbound).await;
        assert!(matches!(first.kind, MessageKind::Handshake(_)));
        assert!(b.directory.get("node-x").is_none());
        assert_eq!(
            b.directory.get("node-y").unwrap().status,
            PeerStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_forced_close_marks_disconnected_and_unroutable() {
        let mut b = start_node("node-b").await;
        let mut stream = TcpStream::connect(b.transport.local_addr()).await.unwrap();
        write_envelope(&mut stream, &handshake_as("node-y")).await.unwrap();
        let _ = recv(&mut b.inbound).await;
        assert_eq!(
            b.directory.get("node-y").unwrap().status,
            PeerStatus::Connected
        );

        drop(stream);
        eventually("node-y disconnected", || {
            b.directory.get("node-y").map(|p| p.status) == Some(PeerStatus::Disconnected)
        })
        .await;

        let err = b
            .transport
            .send(Envelope::custom("Hello", Payload::new()).to("node-y"))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::NoRoute(_)));
    }

    #[tokio::test]
    async fn test_failed_dial_marks_error() {
        let a = start_node("node-a").await;
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        a.directory.upsert(PeerCandidate {
            node_id: "node-gone".to_string(),
            address: "127.0.0.1".parse().unwrap(),
            mesh_port: Some(closed_port),
            capabilities: None,
            source: PeerSource::Discovery,
        });
        eventually("dial failure recorded", || {
            a.directory.get("node-gone").map(|p| p.status) == Some(PeerStatus::Error)
        })
        .await;
    }

    #[tokio::test]
    async fn test_mark_disconnected_closes_both_ends() {
        let a = start_node("node-a").await;
        let b = start_node("node-b").await;
        connect_pair(&a, &b).await;

        assert!(a.directory.mark_disconnected("node-b"));
        eventually("a dropped b", || !a.transport.has_connection("node-b")).await;
        eventually("b saw the close", || {
            b.directory.get("node-a").map(|p| p.status) == Some(PeerStatus::Disconnected)
        })
        .await;
    }

    #[tokio::test]
    async fn test_disconnected_peer_is_unroutable_at_once() {
        let a = start_node("node-a").await;
        let b = start_node("node-b").await;
        connect_pair(&a, &b).await;
        assert_eq!(
            a.directory.get("node-b").unwrap().status,
            PeerStatus::Connected
        );

        // Nothing yields between the transition and the sends, so the
        // command loop has not closed the socket yet.
        assert!(a.directory.mark_disconnected("node-b"));
        assert!(a.transport.has_connection("node-b"));
        let err = a
            .transport
            .send(Envelope::custom("Hello", Payload::new()).to("node-b"))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::NoRoute(ref id) if id == "node-b"));
        assert_eq!(
            a.transport
                .send(Envelope::data_sync(Payload::new()))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_static_dial_is_not_duplicated() {
        let a = start_node("node-a").await;
        // Accepts but never answers the handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        assert!(a.transport.spawn_dial_addr(target.to_string()));
        assert!(!a.transport.spawn_dial_addr(target.to_string()));
        let (_first, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        eventually("connection open", || a.transport.has_open_connection_to(target)).await;

        assert!(!a.transport.spawn_dial_addr(target.to_string()));
        let second = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err(), "a second connection was opened");
    }

    #[tokio::test]
    async fn test_invalid_envelope_is_refused() {
        let a = start_node("node-a").await;
        let err = a
            .transport
            .send(Envelope::custom("Pong", Payload::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::InvalidEnvelope(_)));
    }

    #[tokio::test]
    async fn test_dial_static_addr_registers_on_reply() {
        let a = start_node("node-a").await;
        let b = start_node("node-b").await;
        let addr = b.transport.local_addr().to_string();
        a.transport.dial_addr(&addr).await.unwrap();
        eventually("b registered a", || b.transport.has_connection("node-a")).await;

        // b answers on its routable connection; a learns b's id from it.
        b.transport
            .send(Envelope::handshake(b.transport.node()).to("node-a"))
            .await
            .unwrap();
        eventually("a registered b", || a.transport.has_connection("node-b")).await;
        assert!(a
            .directory
            .is_connected_addr(b.transport.local_addr()));
    }

    #[tokio::test]
    async fn test_close_all_stops_read_loops() {
        let a = start_node("node-a").await;
        let b = start_node("node-b").await;
        connect_pair(&a, &b).await;

        tokio::time::timeout(Duration::from_secs(2), a.transport.close_all())
            .await
            .unwrap();
        assert_eq!(a.transport.open_connections(), 0);
        assert!(a.transport.connected_nodes().is_empty());
    }
}
