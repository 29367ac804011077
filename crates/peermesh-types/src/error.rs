//! Shared error types for the PeerMesh system.

use thiserror::Error;

/// Top-level error type shared by components and the orchestrator.
#[derive(Error, Debug)]
pub enum MeshError {
    /// No component is registered under the given id.
    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    /// A component rejected or failed to process an envelope.
    #[error("Component '{component_id}' failed: {reason}")]
    ComponentFailed {
        /// The component that failed.
        component_id: String,
        /// Why it failed.
        reason: String,
    },

    /// A component did not finish processing within the allowed time.
    #[error("Component '{0}' timed out")]
    ComponentTimeout(String),

    /// The envelope payload does not match what the handler expects.
    #[error("Invalid payload for '{message_type}': {reason}")]
    InvalidPayload {
        /// Message type of the offending envelope.
        message_type: String,
        /// What was wrong.
        reason: String,
    },

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The orchestrator is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Alias for Result with MeshError.
pub type MeshResult<T> = Result<T, MeshError>;
