//! Kernel-specific error types.

use peermesh_types::error::MeshError;
use peermesh_wire::WireError;
use thiserror::Error;

/// Kernel error type wrapping the lower layers with orchestrator context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped MeshError.
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// A wrapped WireError.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The kernel failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),

    /// No pong arrived in time.
    #[error("Ping to {0} timed out")]
    PingTimeout(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
