//! Channel handshake.
//!
//! Transports that carry no identity of their own (plain WebSockets) exchange
//! one handshake frame in each direction before the channel is handed to the
//! provider. It names:
//! - Protocol version for forward compatibility
//! - The sender's peer ID and room
//! - Which side opened the channel
//! - Optionally, an address the sender accepts connections on

use crate::PeerId;
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the peer channel format.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (50MB) accepted from a peer channel.
pub const MAX_FRAME_SIZE: usize = 50 * 1024 * 1024;

/// Which side of the channel the sender is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandshakeRole {
    /// Opened the channel
    Dialer,
    /// Accepted the channel
    Acceptor,
}

/// Handshake frame, sent as UTF-8 JSON in a binary frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub msg_type: String,
    pub version: u32,
    pub peer_id: PeerId,
    /// Room the sender collaborates in
    pub room: String,
    pub role: HandshakeRole,
    /// Address the sender accepts channels on (None = dial-only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Handshake {
    pub fn new(peer_id: PeerId, room: &str, role: HandshakeRole, address: Option<String>) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            version: PROTOCOL_VERSION,
            peer_id,
            room: room.to_string(),
            role,
            address,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Handshake serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for anything that is not a handshake, including
    /// ordinary document deltas (which are never valid JSON objects with a
    /// `"type":"handshake"` field).
    pub fn from_json(data: &[u8]) -> Option<Self> {
        if data.first() != Some(&b'{') {
            return None;
        }
        let handshake: Self = serde_json::from_slice(data).ok()?;
        (handshake.msg_type == "handshake").then_some(handshake)
    }

    /// Whether the remote speaks a different protocol version.
    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }
}
