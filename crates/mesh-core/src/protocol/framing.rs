//! Peer channel framing.
//!
//! A single binary channel per peer carries two logical streams:
//! - **Document deltas**: sent untagged, in the CRDT's native encoding
//! - **Awareness deltas**: prefixed with the one-byte [`AWARENESS_TAG`]
//!
//! The CRDT encoding never starts with the tag byte, so the first byte alone
//! decides the stream.

use thiserror::Error;

/// Sentinel first byte marking an awareness payload.
pub const AWARENESS_TAG: u8 = 0xA5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,
}

/// A decoded peer channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// CRDT document delta or snapshot
    Document(Vec<u8>),
    /// Awareness delta (tag stripped)
    Awareness(Vec<u8>),
}

impl Frame {
    /// Classify raw bytes received from a channel.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        match data.split_first() {
            None => Err(FrameError::Empty),
            Some((&AWARENESS_TAG, rest)) => Ok(Frame::Awareness(rest.to_vec())),
            Some(_) => Ok(Frame::Document(data.to_vec())),
        }
    }

    /// Bytes to put on the wire.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Document(delta) => delta.clone(),
            Frame::Awareness(delta) => encode_awareness(delta),
        }
    }

    /// Stream name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Document(_) => "document",
            Frame::Awareness(_) => "awareness",
        }
    }
}

/// Tag an encoded awareness delta for the wire.
pub fn encode_awareness(delta: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(delta.len() + 1);
    out.push(AWARENESS_TAG);
    out.extend_from_slice(delta);
    out
}
