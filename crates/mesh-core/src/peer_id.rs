//! Identifiers used across the mesh.
//!
//! - [`PeerId`]: opaque string naming a transport endpoint. This is what the
//!   rendezvous service announces and what the provider dials.
//! - [`ClientId`]: u64 naming an awareness participant (and the CRDT peer).
//!   Displays as a 16-character hex string for human readability.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Peer ID cannot be empty")]
    Empty,
    #[error("Peer ID too long ({0} > {MAX_PEER_ID_LEN} bytes)")]
    TooLong(usize),
    #[error("Peer ID contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("Invalid client ID format: expected 16 hex chars")]
    InvalidClientId,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Longest accepted peer identifier, in bytes.
pub const MAX_PEER_ID_LEN: usize = 128;

/// Identifier of a transport endpoint (one running provider).
///
/// Any non-empty string up to [`MAX_PEER_ID_LEN`] bytes without whitespace,
/// `/`, `?`, `&` or `#` (so it survives being placed in a URL path or query).
///
/// # Examples
/// ```
/// use mesh_core::PeerId;
///
/// let id: PeerId = "alice".parse().unwrap();
/// assert_eq!(id.as_str(), "alice");
/// assert!("".parse::<PeerId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a random peer ID (16 lowercase hex chars).
    pub fn generate() -> Self {
        Self(ClientId::generate().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PeerIdError::Empty);
        }
        if s.len() > MAX_PEER_ID_LEN {
            return Err(PeerIdError::TooLong(s.len()));
        }
        if let Some(c) = s
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '?' | '&' | '#'))
        {
            return Err(PeerIdError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of an awareness participant.
///
/// Wraps a u64 internally (for Loro compatibility) but displays as
/// a 16-character hex string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Generate a new random client ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Get the underlying u64 value (for Loro API).
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
            return Ok(Self(id));
        }
        Err(PeerIdError::InvalidClientId)
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ClientId> for u64 {
    fn from(id: ClientId) -> u64 {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_accepts_opaque_strings() {
        for s in ["alice", "a1b2c3d4e5f67890", "user@example.com", "ünïcode"] {
            let id: PeerId = s.parse().unwrap();
            assert_eq!(id.as_str(), s);
        }
    }

    #[test]
    fn test_peer_id_rejects_invalid() {
        assert_eq!("".parse::<PeerId>(), Err(PeerIdError::Empty));
        assert_eq!("a b".parse::<PeerId>(), Err(PeerIdError::InvalidChar(' ')));
        assert_eq!("a/b".parse::<PeerId>(), Err(PeerIdError::InvalidChar('/')));
        assert_eq!("a?b".parse::<PeerId>(), Err(PeerIdError::InvalidChar('?')));
        let long = "x".repeat(MAX_PEER_ID_LEN + 1);
        assert_eq!(long.parse::<PeerId>(), Err(PeerIdError::TooLong(long.len())));
    }

    #[test]
    fn test_peer_id_generate_is_hex() {
        let id = PeerId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(PeerId::generate(), id);
    }

    #[test]
    fn test_peer_id_serde_rejects_invalid() {
        let ok: PeerId = serde_json::from_str("\"bob\"").unwrap();
        assert_eq!(ok.as_str(), "bob");
        assert!(serde_json::from_str::<PeerId>("\"\"").is_err());
    }

    #[test]
    fn test_client_id_display_zero_padded() {
        assert_eq!(ClientId(0xff).to_string(), "00000000000000ff");
    }

    #[test]
    fn test_client_id_parse_uppercase() {
        let id: ClientId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(id.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_client_id_reject_wrong_length() {
        assert!("a1b2c3d4e5f6789".parse::<ClientId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<ClientId>().is_err());
    }

    #[test]
    fn test_client_id_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(ClientId::generate().as_u64(), 0);
        }
    }
}
