//! Test doubles shared by the kernel's unit tests.

use async_trait::async_trait;
use peermesh_types::component::{Component, ComponentState};
use peermesh_types::envelope::{Envelope, Payload};
use peermesh_types::error::{MeshError, MeshResult};
use peermesh_wire::{EnvelopeSink, WireError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a [`RecordingComponent`] misbehaves.
#[derive(Default)]
pub struct Behaviour {
    /// Envelope ids that make `process` return an error.
    pub fail_ids: HashSet<String>,
    /// Message type that makes `process` panic.
    pub panic_on: Option<String>,
    /// Sleep inside `process`.
    pub delay: Option<Duration>,
    /// Shared log that `stop` appends the component id to.
    pub stop_log: Option<Arc<Mutex<Vec<String>>>>,
}

/// Component that records every envelope it processes.
pub struct RecordingComponent {
    id: String,
    component_type: String,
    behaviour: Behaviour,
    state: Mutex<ComponentState>,
    received: Mutex<Vec<Envelope>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl RecordingComponent {
    pub fn new(id: &str, component_type: &str) -> Arc<Self> {
        Self::with_behaviour(id, component_type, Behaviour::default())
    }

    pub fn with_behaviour(id: &str, component_type: &str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            component_type: component_type.to_string(),
            behaviour,
            state: Mutex::new(ComponentState::Stopped),
            received: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_ids(&self) -> Vec<String> {
        self.received().into_iter().map(|e| e.id).collect()
    }
}

#[async_trait]
impl Component for RecordingComponent {
    fn id(&self) -> &str {
        &self.id
    }

    fn component_type(&self) -> &str {
        &self.component_type
    }

    fn status(&self) -> ComponentState {
        *self.state.lock().unwrap()
    }

    async fn process(&self, envelope: &Envelope) -> MeshResult<()> {
        if let Some(delay) = self.behaviour.delay {
            tokio::time::sleep(delay).await;
        }
        if self.behaviour.panic_on.as_deref() == Some(envelope.message_type()) {
            panic!("component {} refused {}", self.id, envelope.message_type());
        }
        self.received.lock().unwrap().push(envelope.clone());
        if self.behaviour.fail_ids.contains(&envelope.id) {
            return Err(MeshError::ComponentFailed {
                component_id: self.id.clone(),
                reason: format!("rejected envelope {}", envelope.id),
            });
        }
        Ok(())
    }

    fn status_snapshot(&self) -> Payload {
        let mut snapshot = Payload::new();
        snapshot.insert(
            "processed".to_string(),
            self.received.lock().unwrap().len().into(),
        );
        snapshot
    }

    async fn start(&self) -> MeshResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = ComponentState::Running;
        Ok(())
    }

    async fn stop(&self) -> MeshResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = ComponentState::Stopped;
        if let Some(log) = &self.behaviour.stop_log {
            log.lock().unwrap().push(self.id.clone());
        }
        Ok(())
    }
}

/// Sink that records envelopes instead of writing them to sockets.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Envelope>>,
    refused: Mutex<HashSet<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make unicasts to `node_id` fail with `NoRoute`.
    pub fn refuse(&self, node_id: &str) {
        self.refused.lock().unwrap().insert(node_id.to_string());
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EnvelopeSink for RecordingSink {
    async fn send(&self, envelope: Envelope) -> Result<usize, WireError> {
        if let Some(to) = envelope.to_node_id.as_deref() {
            if self.refused.lock().unwrap().contains(to) {
                return Err(WireError::NoRoute(to.to_string()));
            }
        }
        self.sent.lock().unwrap().push(envelope);
        Ok(1)
    }
}
