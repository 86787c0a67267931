//! Protocol definitions for the mesh.
//!
//! - Peer channel framing (document vs awareness deltas)
//! - Channel handshake for identity-less transports
//! - Rendezvous (discovery) messages

pub mod discovery;
pub mod framing;
pub mod handshake;

pub use discovery::{ClientMessage, PeerEntry, ServerMessage};
pub use framing::{encode_awareness, Frame, FrameError, AWARENESS_TAG};
pub use handshake::{Handshake, HandshakeRole, MAX_FRAME_SIZE, PROTOCOL_VERSION};
