//! mesh-core: peer-to-peer sync of a shared text document over a mesh overlay.
//!
//! This crate provides:
//! - `SharedText`, a Loro-backed replicated text document
//! - `Awareness`, the ephemeral presence table (cursors, names)
//! - The wire protocol: frame tagging, peer handshake, rendezvous messages
//! - The `Transport` abstraction and an in-memory implementation
//! - `MeshProvider`, which dials peers, runs cold-start sync and fans out
//!   every change over the connection registry

pub mod awareness;
pub mod backoff;
pub mod document;
pub mod events;
pub mod peer_id;
pub mod protocol;
pub mod provider;
pub mod registry;
pub mod transport;

pub use awareness::{Awareness, AwarenessChange, AwarenessError, AwarenessUpdate, Origin};
pub use backoff::ReconnectConfig;
pub use document::{DocumentError, SharedText};
pub use events::{EventBus, MeshEvent, Subscription};
pub use peer_id::{ClientId, PeerId, PeerIdError};
pub use protocol::{ClientMessage, Frame, PeerEntry, ServerMessage};
pub use provider::{MeshProvider, ProviderConfig, ProviderError, ProviderState};
pub use registry::ConnectionDirection;
pub use transport::{Channel, Endpoint, MemoryNetwork, Payload, Transport, TransportError};
