//! mesh-peer: WebSocket transport and rendezvous client for mesh-core.
//!
//! The library half exists so integration tests (and other hosts) can drive
//! the same pieces the `mesh-peer` binary uses.

pub mod connection;
pub mod discovery;
pub mod transport;

pub use discovery::{DiscoveryClient, DiscoveryConfig, DiscoveryError};
pub use transport::WsTransport;
