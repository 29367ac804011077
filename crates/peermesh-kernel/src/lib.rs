//! Core kernel for PeerMesh.
//!
//! The kernel boots one mesh node: it binds the transport, starts discovery,
//! runs the router and heartbeat loops, hosts local components and tears all
//! of it down in order on shutdown.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod kernel;
pub mod registry;
pub mod router;
pub mod supervisor;

#[cfg(test)]
mod test_util;

pub use error::{KernelError, KernelResult};
pub use kernel::{MeshKernel, NodeStatus, PeerSummary};
pub use registry::ComponentRegistry;
pub use router::{DispatchOutcome, MessageRouter};
