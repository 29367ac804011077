//! Local component contract.
//!
//! A component is a locally hosted unit of work. The orchestrator registers
//! it, starts it, routes envelopes to it by `component_type`, and stops it on
//! shutdown. Implementations live outside this workspace.

use crate::envelope::{Envelope, Payload};
use crate::error::MeshResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Contract every locally hosted component satisfies.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Unique id within this node.
    fn id(&self) -> &str;

    /// Category label used for routing (`Envelope::component_type`).
    fn component_type(&self) -> &str;

    /// Current lifecycle state.
    fn status(&self) -> ComponentState;

    /// Consume one envelope. Must not block indefinitely; the router wraps
    /// each call in a timeout regardless.
    async fn process(&self, envelope: &Envelope) -> MeshResult<()>;

    /// Opaque status map surfaced to `ComponentStatus` queries.
    fn status_snapshot(&self) -> Payload;

    /// Idempotent. Returns once the component is ready to `process`.
    async fn start(&self) -> MeshResult<()>;

    /// Idempotent.
    async fn stop(&self) -> MeshResult<()>;
}
