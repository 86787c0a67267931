//! Rendezvous wire protocol.
//!
//! JSON text frames exchanged between a participant and the rendezvous
//! service over a connection upgraded at `/room/{roomId}`.
//!
//! Wire format: `{"type":"joined","peers":[{"userId":"alice"}]}`

use crate::PeerId;
use serde::{Deserialize, Serialize};

/// A room member as announced to other members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    pub user_id: PeerId,
    /// Address the member accepts peer channels on, if it advertised one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl PeerEntry {
    pub fn new(user_id: PeerId, address: Option<String>) -> Self {
        Self { user_id, address }
    }
}

/// Messages sent by the rendezvous service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent once to a new member: everyone already in the room
    Joined { peers: Vec<PeerEntry> },
    /// Another member joined the room
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        user_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    /// A member disconnected
    #[serde(rename_all = "camelCase")]
    PeerLeft { user_id: PeerId },
    /// Reply to [`ClientMessage::Ping`]
    Pong,
}

impl ServerMessage {
    /// Serialize to a JSON string (sent as a text frame).
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage serialization should not fail")
    }

    pub fn from_json(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }
}

/// Messages sent by a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Optional keepalive
    Ping,
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ClientMessage serialization should not fail")
    }

    pub fn from_json(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn test_joined_wire_format() {
        let msg = ServerMessage::Joined {
            peers: vec![PeerEntry::new(id("A"), None)],
        };
        assert_eq!(msg.to_json(), r#"{"type":"joined","peers":[{"userId":"A"}]}"#);
    }

    #[test]
    fn test_joined_empty() {
        let msg = ServerMessage::from_json(r#"{"type":"joined","peers":[]}"#).unwrap();
        assert_eq!(msg, ServerMessage::Joined { peers: vec![] });
    }

    #[test]
    fn test_peer_joined_wire_format() {
        let msg = ServerMessage::PeerJoined {
            user_id: id("B"),
            address: None,
        };
        assert_eq!(msg.to_json(), r#"{"type":"peer-joined","userId":"B"}"#);

        let with_addr = ServerMessage::PeerJoined {
            user_id: id("B"),
            address: Some("ws://h:1".into()),
        };
        assert_eq!(
            ServerMessage::from_json(&with_addr.to_json()),
            Some(with_addr)
        );
    }

    #[test]
    fn test_peer_left_wire_format() {
        let msg = ServerMessage::PeerLeft { user_id: id("B") };
        assert_eq!(msg.to_json(), r#"{"type":"peer-left","userId":"B"}"#);
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(ClientMessage::Ping.to_json(), r#"{"type":"ping"}"#);
        assert_eq!(ClientMessage::from_json(r#"{"type":"ping"}"#), Some(ClientMessage::Ping));
        assert_eq!(ServerMessage::Pong.to_json(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_unknown_or_malformed() {
        assert!(ServerMessage::from_json(r#"{"type":"nope"}"#).is_none());
        assert!(ServerMessage::from_json(r#"{"type":"peer-left"}"#).is_none());
        assert!(ServerMessage::from_json(r#"{"type":"peer-left","userId":""}"#).is_none());
        assert!(ClientMessage::from_json("garbage").is_none());
    }
}
