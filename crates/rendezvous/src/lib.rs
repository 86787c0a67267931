//! rendezvous: room discovery for mesh-sync peers.
//!
//! Participants connect over WebSocket to `/room/{roomId}`, learn who is
//! already in the room, and are announced to the others. Document data never
//! passes through here; peers connect to each other directly.

pub mod auth;
pub mod config;
pub mod rooms;
pub mod server;

pub use auth::{AuthError, Identity, TokenVerifier};
pub use config::Config;
pub use rooms::RoomTable;
pub use server::{JoinRequest, RejectReason, RendezvousServer};
