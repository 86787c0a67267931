//! Room membership table.
//!
//! Rooms exist only while they have members: the first join creates one and
//! the last leave deletes it. Every join and leave, and every announcement it
//! causes, happens under one lock, so a later joiner's `joined` snapshot
//! always reflects announcements already sent.

use mesh_core::protocol::{PeerEntry, ServerMessage};
use mesh_core::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub type RoomId = String;

/// Identifies one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One connection's membership in a room.
#[derive(Debug)]
pub struct Member {
    pub user_id: PeerId,
    /// Where the member accepts peer channels, if it said
    pub address: Option<String>,
    /// Messages for this member's connection
    pub outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl Member {
    fn entry(&self) -> PeerEntry {
        PeerEntry::new(self.user_id.clone(), self.address.clone())
    }

    fn send(&self, msg: ServerMessage) {
        if self.outbound.send(msg).is_err() {
            debug!("Member {} is gone, dropping message", self.user_id);
        }
    }
}

type Rooms = HashMap<RoomId, HashMap<ConnId, Member>>;

/// Shared room table. Clones refer to the same table.
#[derive(Clone, Default)]
pub struct RoomTable {
    rooms: Arc<Mutex<Rooms>>,
    next_conn: Arc<AtomicU64>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `member` to `room`. The member receives `joined` listing everyone
    /// already there; everyone already there receives `peer-joined`.
    pub fn join(&self, room: &str, member: Member) -> ConnId {
        let conn = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed) + 1);
        let mut rooms = self.lock();
        let members = rooms.entry(room.to_string()).or_default();

        let mut peers: Vec<PeerEntry> = members.values().map(Member::entry).collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        let announcement = ServerMessage::PeerJoined {
            user_id: member.user_id.clone(),
            address: member.address.clone(),
        };
        for other in members.values() {
            other.send(announcement.clone());
        }

        member.send(ServerMessage::Joined { peers });
        info!(
            "{} joined room {} ({} members)",
            member.user_id,
            room,
            members.len() + 1
        );
        members.insert(conn, member);
        conn
    }

    /// Remove a connection. Deletes the room if it is now empty, otherwise
    /// tells the remaining members. Returns the member that left.
    pub fn leave(&self, room: &str, conn: ConnId) -> Option<Member> {
        let mut rooms = self.lock();
        let members = rooms.get_mut(room)?;
        let member = members.remove(&conn)?;

        if members.is_empty() {
            rooms.remove(room);
            info!("{} left room {}; room closed", member.user_id, room);
        } else {
            let msg = ServerMessage::PeerLeft {
                user_id: member.user_id.clone(),
            };
            for other in members.values() {
                other.send(msg.clone());
            }
            info!(
                "{} left room {} ({} members)",
                member.user_id,
                room,
                members.len()
            );
        }
        Some(member)
    }

    /// User IDs currently in `room`, sorted.
    pub fn members(&self, room: &str) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .lock()
            .get(room)
            .map(|m| m.values().map(|m| m.user_id.clone()).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }
}
