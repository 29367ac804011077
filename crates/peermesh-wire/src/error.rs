use peermesh_types::envelope::EnvelopeError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from the wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("No route to node {0}")]
    NoRoute(String),
    #[error("Timed out: {0}")]
    Timeout(String),
}
