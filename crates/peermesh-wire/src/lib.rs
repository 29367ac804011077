//! PeerMesh wire layer: peer discovery and node-to-node transport.
//!
//! Nodes find each other with UDP announcements and talk over persistent TCP
//! connections carrying length-prefixed JSON envelopes.
//!
//! ## Architecture
//!
//! - **PeerDirectory**: Authoritative map of known peers and their status
//! - **DiscoveryService**: UDP presence announcements and listener
//! - **MeshTransport**: TCP listener, dialer and per-connection read loops
//! - **EnvelopeSink**: Trait the router uses to put envelopes on the mesh

pub mod directory;
pub mod discovery;
pub mod error;
pub mod message;
pub mod shutdown;
pub mod transport;

pub use directory::{
    ConnectionId, PeerCandidate, PeerCommand, PeerDirectory, PeerEntry, PeerSource,
};
pub use discovery::{Announcement, DiscoveryConfig, DiscoveryService};
pub use error::WireError;
pub use shutdown::shutdown_requested;
pub use transport::{EnvelopeSink, MeshTransport, TransportConfig};
