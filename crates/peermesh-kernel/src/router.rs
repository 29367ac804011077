//! Message router: one FIFO queue, one dispatch loop.
//!
//! Every envelope the node handles (decoded from a connection or sent
//! locally) is enqueued here and dispatched in arrival order:
//!
//! 0. addressed to another node → dropped (nodes never relay)
//! 1. `Handshake` → capabilities recorded, reply on request
//! 2. `Ping` → `Pong` on request
//! 3. `Pong` → pending ping completed, latency stored
//! 4. `Shutdown` → sender marked disconnected
//! 5. `ComponentStatus` / `DataSync` → every local component
//! 6. anything else → newest component registered for `component_type`
//!
//! Component errors, timeouts and panics are caught here and never stop the
//! loop.

use crate::heartbeat::PingTracker;
use crate::registry::ComponentRegistry;
use crate::supervisor::Supervisor;

use futures::FutureExt;
use peermesh_types::component::Component;
use peermesh_types::envelope::{Envelope, MessageKind, Payload};
use peermesh_types::peer::NodeInfo;
use peermesh_wire::{shutdown_requested, EnvelopeSink, PeerDirectory};
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Upper bound on one `Component::process` call.
    pub process_timeout: Duration,
    /// Deliver `DataSync` envelopes.
    pub sync_enabled: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            process_timeout: Duration::from_secs(30),
            sync_enabled: true,
        }
    }
}

/// Why a component call failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    Error(String),
    Timeout,
    Panic(String),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(e) => write!(f, "{e}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Panic(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

/// Why an envelope was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    /// No `component_type` to route by.
    NoComponentType,
    /// No component registered for this type.
    NoComponent(String),
    /// `DataSync` while sync is disabled.
    SyncDisabled,
    /// A pong that matches no pending ping.
    UnmatchedPong,
    /// A reply was due but the envelope names no sender.
    NoSender,
    /// Writing to the mesh failed.
    SendFailed(String),
    /// Addressed to a different node.
    NotForThisNode(String),
}

/// What happened to one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A control message was consumed and answered.
    Replied,
    /// A control message was consumed.
    Handled,
    /// Offered to every local component.
    FannedOut { delivered: usize, failed: usize },
    /// Processed by one component.
    Delivered { component_id: String },
    /// The target component failed.
    Failed {
        component_id: String,
        failure: Failure,
    },
    Dropped(DropReason),
}

/// Running totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub dispatched: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Routes envelopes between the mesh and local components.
pub struct MessageRouter {
    node: NodeInfo,
    directory: PeerDirectory,
    components: ComponentRegistry,
    sink: Arc<dyn EnvelopeSink>,
    pings: Arc<PingTracker>,
    supervisor: Arc<Supervisor>,
    config: RouterConfig,
    queue: mpsc::UnboundedSender<Envelope>,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: NodeInfo,
        directory: PeerDirectory,
        components: ComponentRegistry,
        sink: Arc<dyn EnvelopeSink>,
        pings: Arc<PingTracker>,
        supervisor: Arc<Supervisor>,
        config: RouterConfig,
        queue: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            node,
            directory,
            components,
            sink,
            pings,
            supervisor,
            config,
            queue,
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Queue an envelope for dispatch. Never blocks.
    pub fn enqueue(&self, envelope: Envelope) {
        if self.queue.send(envelope).is_err() {
            debug!("Router queue closed, envelope discarded");
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Dispatch loop. Runs until shutdown or until every sender is gone.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(node_id = %self.node.node_id, "Message router started");
        loop {
            let envelope = tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
                _ = shutdown_requested(&mut shutdown) => break,
            };
            let id = envelope.id.clone();
            let outcome = self.dispatch(envelope).await;
            trace!(id = %id, outcome = ?outcome, "Dispatched");
        }
        debug!("Message router stopped");
    }

    /// Dispatch a single envelope.
    pub async fn dispatch(&self, envelope: Envelope) -> DispatchOutcome {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let outcome = self.route(envelope).await;
        match &outcome {
            DispatchOutcome::Dropped(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::Failed { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        outcome
    }

    async fn route(&self, envelope: Envelope) -> DispatchOutcome {
        if let Some(to) = envelope.to_node_id.as_deref() {
            if to != self.node.node_id {
                let reason = DropReason::NotForThisNode(to.to_string());
                return self.drop_envelope(&envelope, reason);
            }
        }

        match &envelope.kind {
            MessageKind::Handshake(handshake) => {
                let from = envelope
                    .from_node_id
                    .clone()
                    .unwrap_or_else(|| handshake.node_id.clone());
                self.directory
                    .update_capabilities(&from, handshake.capabilities.clone());
                debug!(peer = %from, "Handshake received");
                if envelope.requires_response {
                    let reply = Envelope::handshake(&self.node).to(from);
                    return self.reply(reply).await;
                }
                DispatchOutcome::Handled
            }
            MessageKind::Ping(_) => {
                if !envelope.requires_response {
                    return DispatchOutcome::Handled;
                }
                if envelope.from_node_id.is_none() {
                    return self.drop_envelope(&envelope, DropReason::NoSender);
                }
                self.reply(Envelope::pong(&envelope)).await
            }
            MessageKind::Pong(pong) => {
                match self
                    .pings
                    .complete(&pong.reply_to, envelope.from_node_id.as_deref())
                {
                    Some((node_id, rtt)) => {
                        self.directory.record_latency(&node_id, rtt);
                        trace!(peer = %node_id, rtt_us = rtt.as_micros() as u64, "Pong");
                        DispatchOutcome::Handled
                    }
                    None => self.drop_envelope(&envelope, DropReason::UnmatchedPong),
                }
            }
            MessageKind::Shutdown(shutdown) => {
                if let Some(from) = envelope.from_node_id.as_deref() {
                    info!(peer = %from, reason = %shutdown.reason, "Peer is shutting down");
                    self.directory.mark_disconnected(from);
                }
                DispatchOutcome::Handled
            }
            MessageKind::ComponentStatus(_) => {
                let outcome = self.fan_out(&envelope).await;
                if envelope.requires_response {
                    match envelope.from_node_id.as_deref() {
                        Some(from) if from != self.node.node_id => {
                            let reply = Envelope::component_status(self.status_snapshot()).to(from);
                            if let DispatchOutcome::Dropped(reason) = self.reply(reply).await {
                                debug!(reason = ?reason, "Status reply not sent");
                            }
                        }
                        _ => {}
                    }
                }
                outcome
            }
            MessageKind::DataSync(_) => {
                if !self.config.sync_enabled {
                    return self.drop_envelope(&envelope, DropReason::SyncDisabled);
                }
                self.fan_out(&envelope).await
            }
            MessageKind::Custom { .. } => self.deliver(&envelope).await,
        }
    }

    async fn reply(&self, reply: Envelope) -> DispatchOutcome {
        let to = reply.to_node_id.clone().unwrap_or_default();
        match self.sink.send(reply).await {
            Ok(_) => DispatchOutcome::Replied,
            Err(e) => {
                debug!(peer = %to, error = %e, "Reply not delivered");
                DispatchOutcome::Dropped(DropReason::SendFailed(e.to_string()))
            }
        }
    }

    fn drop_envelope(&self, envelope: &Envelope, reason: DropReason) -> DispatchOutcome {
        debug!(
            id = %envelope.id,
            message_type = envelope.message_type(),
            from = ?envelope.from_node_id,
            reason = ?reason,
            "Dropping envelope"
        );
        DispatchOutcome::Dropped(reason)
    }

    /// `{"node_id": .., "components": [..]}` for status replies.
    fn status_snapshot(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("node_id".to_string(), self.node.node_id.clone().into());
        let components = serde_json::to_value(self.components.summaries())
            .unwrap_or_else(|_| serde_json::Value::Array(Vec::new()));
        payload.insert("components".to_string(), components);
        payload
    }

    async fn fan_out(&self, envelope: &Envelope) -> DispatchOutcome {
        let mut delivered = 0;
        let mut failed = 0;
        for component in self.components.all() {
            match self.invoke(&component, envelope).await {
                Ok(()) => delivered += 1,
                Err(_) => failed += 1,
            }
        }
        DispatchOutcome::FannedOut { delivered, failed }
    }

    async fn deliver(&self, envelope: &Envelope) -> DispatchOutcome {
        let Some(component_type) = envelope.component_type.as_deref() else {
            warn!(
                id = %envelope.id,
                message_type = envelope.message_type(),
                "Envelope has no component type, dropping"
            );
            return DispatchOutcome::Dropped(DropReason::NoComponentType);
        };
        let Some(component) = self.components.find_by_type(component_type) else {
            warn!(
                id = %envelope.id,
                component_type,
                "No component registered for type, dropping"
            );
            return DispatchOutcome::Dropped(DropReason::NoComponent(component_type.to_string()));
        };
        let component_id = component.id().to_string();
        match self.invoke(&component, envelope).await {
            Ok(()) => DispatchOutcome::Delivered { component_id },
            Err(failure) => DispatchOutcome::Failed {
                component_id,
                failure,
            },
        }
    }

    /// Call `process` with a timeout, turning errors and panics into a
    /// [`Failure`].
    async fn invoke(&self, component: &Arc<dyn Component>, envelope: &Envelope) -> Result<(), Failure> {
        let call = AssertUnwindSafe(component.process(envelope)).catch_unwind();
        let failure = match tokio::time::timeout(self.config.process_timeout, call).await {
            Ok(Ok(Ok(()))) => return Ok(()),
            Ok(Ok(Err(e))) => Failure::Error(e.to_string()),
            Ok(Err(panic)) => {
                self.supervisor.record_panic();
                Failure::Panic(panic_message(panic.as_ref()))
            }
            Err(_) => Failure::Timeout,
        };
        error!(
            component = component.id(),
            id = %envelope.id,
            message_type = envelope.message_type(),
            failure = %failure,
            "Component failed to process envelope"
        );
        Err(failure)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
