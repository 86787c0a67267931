//! Connection registry: at most one channel per remote peer.
//!
//! The registry is owned by the provider's control loop and is never shared.
//! Each attached channel is driven by its own task, which forwards inbound
//! payloads and lifecycle changes as [`ChannelEvent`]s onto the provider's
//! bounded event queue, and writes whatever the registry queues for it.
//!
//! Every entry carries a [`ConnId`]. Events name the connection they came
//! from, so an event from a connection that has since been replaced or
//! dropped is recognised as stale and ignored.

use crate::transport::{Channel, Payload};
use crate::PeerId;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Connection direction from our perspective.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

/// Identifies one channel (or dial reservation) for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Emitted by connection tasks onto the provider's event queue.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened {
        conn: ConnId,
        peer_id: PeerId,
        direction: ConnectionDirection,
    },
    Frame {
        conn: ConnId,
        peer_id: PeerId,
        payload: Payload,
    },
    Closed {
        conn: ConnId,
        peer_id: PeerId,
        error: Option<String>,
    },
}

/// How a channel came to be attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// We dialed it under this reservation.
    Dialed(ConnId),
    /// The remote dialed us.
    Accepted,
}

enum EntryState {
    /// Dial issued, channel not established yet
    Connecting,
    Open { outbound: mpsc::Sender<Vec<u8>> },
}

struct Entry {
    conn: ConnId,
    direction: ConnectionDirection,
    state: EntryState,
    /// Our dial still in flight after an incoming channel took its place
    pending_dial: Option<ConnId>,
}

pub struct Registry {
    local_id: PeerId,
    entries: HashMap<PeerId, Entry>,
    next_conn: u64,
    outbound_capacity: usize,
    events_tx: mpsc::Sender<ChannelEvent>,
}

impl Registry {
    pub fn new(
        local_id: PeerId,
        outbound_capacity: usize,
        events_tx: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        Self {
            local_id,
            entries: HashMap::new(),
            next_conn: 0,
            outbound_capacity: outbound_capacity.max(1),
            events_tx,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Whether `peer` has an entry, connecting or open.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    /// Whether `conn` still owns the entry for `peer`.
    pub fn is_current(&self, peer: &PeerId, conn: ConnId) -> bool {
        self.entries.get(peer).map(|e| e.conn) == Some(conn)
    }

    /// Peers with an open channel, sorted.
    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, EntryState::Open { .. }))
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register an outgoing dial before it completes. Returns `None` for
    /// ourselves or for a peer that already has an entry.
    pub fn reserve(&mut self, peer: PeerId) -> Option<ConnId> {
        if peer == self.local_id || self.entries.contains_key(&peer) {
            return None;
        }
        let conn = self.next_conn_id();
        debug!("Reserved {} for dial to {}", conn, peer);
        self.entries.insert(
            peer,
            Entry {
                conn,
                direction: ConnectionDirection::Outgoing,
                state: EntryState::Connecting,
                pending_dial: None,
            },
        );
        Some(conn)
    }

    /// Take ownership of an established channel and start its task.
    ///
    /// Returns the connection's ID, or `None` if the channel was refused
    /// (ours, superseded, or the losing half of a simultaneous cross-dial).
    /// A refused channel is dropped, which closes it.
    ///
    /// A dial that is still in flight never blocks an established incoming
    /// channel: the incoming one takes the entry and the dial is remembered.
    /// Only two established channels are compared, and then the one
    /// initiated by the lexicographically smaller peer ID is kept. Both peers
    /// evaluate the same rule, so exactly one channel survives.
    pub fn attach(&mut self, channel: Channel, how: Attach) -> Option<ConnId> {
        let peer = channel.peer_id.clone();
        if peer == self.local_id {
            debug!("Refusing channel to ourselves");
            return None;
        }

        let (conn, direction, pending_dial) = match how {
            Attach::Accepted => {
                let pending_dial = match self.entries.get(&peer) {
                    None => None,
                    Some(Entry {
                        conn,
                        state: EntryState::Connecting,
                        ..
                    }) => {
                        debug!("Incoming connection from {} overtakes dial {}", peer, conn);
                        Some(*conn)
                    }
                    Some(existing) => {
                        if !self.replaces(&peer, existing.direction, ConnectionDirection::Incoming) {
                            debug!(
                                "Keeping existing {:?} connection to {}, refusing incoming",
                                existing.direction, peer
                            );
                            return None;
                        }
                        debug!("Incoming connection from {} replaces {}", peer, existing.conn);
                        existing.pending_dial
                    }
                };
                (self.next_conn_id(), ConnectionDirection::Incoming, pending_dial)
            }
            Attach::Dialed(reserved) => {
                let current = self
                    .entries
                    .get(&peer)
                    .map(|e| (e.conn, e.direction, e.pending_dial));
                match current {
                    Some((conn, ..)) if conn == reserved => {
                        (reserved, ConnectionDirection::Outgoing, None)
                    }
                    Some((conn, existing, Some(dial))) if dial == reserved => {
                        if !self.replaces(&peer, existing, ConnectionDirection::Outgoing) {
                            debug!(
                                "Keeping {:?} connection {} to {}, refusing dial {}",
                                existing, conn, peer, reserved
                            );
                            if let Some(entry) = self.entries.get_mut(&peer) {
                                entry.pending_dial = None;
                            }
                            return None;
                        }
                        debug!("Dial {} to {} replaces {}", reserved, peer, conn);
                        (reserved, ConnectionDirection::Outgoing, None)
                    }
                    _ => {
                        debug!("Dial {} to {} was superseded", reserved, peer);
                        return None;
                    }
                }
            }
        };

        let (outbound, outbound_rx) = mpsc::channel(self.outbound_capacity);
        // Replacing an entry drops its outbound sender, which closes that channel.
        self.entries.insert(
            peer.clone(),
            Entry {
                conn,
                direction,
                state: EntryState::Open { outbound },
                pending_dial,
            },
        );
        info!("Connection {} to {} open ({:?})", conn, peer, direction);

        tokio::spawn(run_connection(
            conn,
            direction,
            channel,
            outbound_rx,
            self.events_tx.clone(),
        ));
        Some(conn)
    }

    /// Whether a new channel replaces an open one. Channels from different
    /// initiators go to the smaller initiator; a fresh incoming channel
    /// replaces an older incoming one.
    fn replaces(
        &self,
        peer: &PeerId,
        existing: ConnectionDirection,
        new: ConnectionDirection,
    ) -> bool {
        let initiator = |direction: ConnectionDirection| match direction {
            ConnectionDirection::Outgoing => &self.local_id,
            ConnectionDirection::Incoming => peer,
        };
        existing == new || initiator(new) < initiator(existing)
    }

    /// Queue `data` for every open channel. Returns how many accepted it.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        let mut sent = 0;
        for (peer, entry) in &self.entries {
            if let EntryState::Open { outbound } = &entry.state {
                match outbound.try_send(data.to_vec()) {
                    Ok(()) => sent += 1,
                    Err(e) => debug!("Broadcast to {} failed: {}", peer, e),
                }
            }
        }
        sent
    }

    /// Queue `data` for one peer.
    pub fn send(&self, peer: &PeerId, data: Vec<u8>) -> bool {
        match self.entries.get(peer).map(|e| &e.state) {
            Some(EntryState::Open { outbound }) => match outbound.try_send(data) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Send to {} failed: {}", peer, e);
                    false
                }
            },
            _ => false,
        }
    }

    /// Remove `peer`, closing its channel after queued frames are written.
    /// Idempotent; returns whether an entry existed.
    pub fn drop_peer(&mut self, peer: &PeerId) -> bool {
        match self.entries.remove(peer) {
            Some(entry) => {
                debug!("Dropped {} ({})", peer, entry.conn);
                true
            }
            None => false,
        }
    }

    /// Remove `peer` only if `conn` still owns its entry. Returns whether
    /// that connection was dropped.
    ///
    /// If a dial of ours is still in flight for `peer`, the entry falls back
    /// to that reservation instead of disappearing. A `conn` naming such a
    /// dial just forgets it.
    pub fn drop_if_current(&mut self, peer: &PeerId, conn: ConnId) -> bool {
        let Some(entry) = self.entries.get_mut(peer) else {
            return false;
        };
        if entry.pending_dial == Some(conn) {
            debug!("Dial {} to {} ended after being overtaken", conn, peer);
            entry.pending_dial = None;
            return false;
        }
        if entry.conn != conn {
            return false;
        }
        match entry.pending_dial.take() {
            Some(dial) => {
                debug!("Dropped {} ({}), still dialing ({})", peer, conn, dial);
                *entry = Entry {
                    conn: dial,
                    direction: ConnectionDirection::Outgoing,
                    state: EntryState::Connecting,
                    pending_dial: None,
                };
                true
            }
            None => self.drop_peer(peer),
        }
    }

    /// Drop every entry.
    pub fn destroy(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        debug!("Registry destroyed ({} entries)", count);
    }

    fn next_conn_id(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }
}

/// Drive one channel until either side closes it.
async fn run_connection(
    conn: ConnId,
    direction: ConnectionDirection,
    channel: Channel,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    events_tx: mpsc::Sender<ChannelEvent>,
) {
    let Channel {
        peer_id,
        mut sink,
        mut stream,
    } = channel;

    if events_tx
        .send(ChannelEvent::Opened {
            conn,
            peer_id: peer_id.clone(),
            direction,
        })
        .await
        .is_err()
    {
        return;
    }

    let mut error = None;
    loop {
        tokio::select! {
            out = outbound_rx.recv() => match out {
                Some(data) => {
                    if let Err(e) = sink.send(data).await {
                        error = Some(e.to_string());
                        break;
                    }
                }
                // Entry removed from the registry
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(payload)) => {
                    let event = ChannelEvent::Frame {
                        conn,
                        peer_id: peer_id.clone(),
                        payload,
                    };
                    if events_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    error = Some(e.to_string());
                    break;
                }
                None => break,
            },
        }
    }

    let _ = sink.close().await;
    debug!("Connection {} to {} finished", conn, peer_id);
    let _ = events_tx
        .send(ChannelEvent::Closed {
            conn,
            peer_id,
            error,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, Probe, Transport};

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    /// A channel named `peer` backed by a probe, plus the probe's far end.
    fn pipe(peer: &str) -> (Channel, Probe) {
        let (a_tx, a_rx) = futures::channel::mpsc::unbounded();
        let (b_tx, b_rx) = futures::channel::mpsc::unbounded();
        let near = Probe { tx: a_tx, rx: b_rx }.into_channel(id(peer));
        (near, Probe { tx: b_tx, rx: a_rx })
    }

    fn registry(local: &str) -> (Registry, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (Registry::new(id(local), 16, tx), rx)
    }

    async fn expect_opened(rx: &mut mpsc::Receiver<ChannelEvent>) -> (ConnId, PeerId) {
        match rx.recv().await.unwrap() {
            ChannelEvent::Opened { conn, peer_id, .. } => (conn, peer_id),
            other => panic!("expected Opened, got {other:?}"),
        }
    }

    #[test]
    fn test_reserve_rules() {
        let (tx, _rx) = mpsc::channel(1);
        let mut reg = Registry::new(id("me"), 4, tx);
        assert!(reg.reserve(id("me")).is_none());
        let conn = reg.reserve(id("bob")).unwrap();
        assert!(reg.reserve(id("bob")).is_none());
        assert!(reg.is_current(&id("bob"), conn));
        assert!(reg.open_peers().is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_accept_open_and_exchange() {
        let (mut reg, mut rx) = registry("me");
        let (channel, mut far) = pipe("bob");
        let conn = reg.attach(channel, Attach::Accepted).unwrap();
        assert_eq!(expect_opened(&mut rx).await, (conn, id("bob")));
        assert_eq!(reg.open_peers(), vec![id("bob")]);

        assert_eq!(reg.broadcast(&[1, 2, 3]), 1);
        assert_eq!(far.recv().await, Some(Payload::Binary(vec![1, 2, 3])));

        far.send(Payload::Binary(vec![9])).unwrap();
        match rx.recv().await.unwrap() {
            ChannelEvent::Frame { conn: c, payload, .. } => {
                assert_eq!(c, conn);
                assert_eq!(payload, Payload::Binary(vec![9]));
            }
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_connecting() {
        let (mut reg, mut rx) = registry("me");
        reg.reserve(id("pending")).unwrap();
        let (channel, _far) = pipe("bob");
        reg.attach(channel, Attach::Accepted).unwrap();
        expect_opened(&mut rx).await;
        assert_eq!(reg.broadcast(b"x"), 1);
        assert!(!reg.send(&id("pending"), b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_dialed_channel_attaches_to_reservation() {
        let (mut reg, mut rx) = registry("me");
        let conn = reg.reserve(id("bob")).unwrap();
        let (channel, _far) = pipe("bob");
        assert_eq!(reg.attach(channel, Attach::Dialed(conn)), Some(conn));
        expect_opened(&mut rx).await;
        assert_eq!(reg.open_peers(), vec![id("bob")]);
    }

    #[tokio::test]
    async fn test_cross_dial_smaller_initiator_wins() {
        // "alice" < "bob". Both dials are in flight when the other side's
        // channel arrives, so each side accepts it first.
        let (mut alice, _arx) = registry("alice");
        let alice_dial = alice.reserve(id("bob")).unwrap();
        let (from_bob, mut from_bob_far) = pipe("bob");
        assert!(alice.attach(from_bob, Attach::Accepted).is_some());

        let (mut bob, _brx) = registry("bob");
        let bob_dial = bob.reserve(id("alice")).unwrap();
        let (from_alice, _f1) = pipe("alice");
        let accepted = bob.attach(from_alice, Attach::Accepted).unwrap();
        assert_ne!(accepted, bob_dial);

        // When the dials complete, alice's own dial replaces bob's channel...
        let (to_bob, _f2) = pipe("bob");
        assert_eq!(alice.attach(to_bob, Attach::Dialed(alice_dial)), Some(alice_dial));
        assert!(alice.is_current(&id("bob"), alice_dial));
        assert_eq!(from_bob_far.recv().await, None);

        // ...and bob keeps alice's channel, abandoning his own dial.
        let (to_alice, mut to_alice_far) = pipe("alice");
        assert!(bob.attach(to_alice, Attach::Dialed(bob_dial)).is_none());
        assert!(bob.is_current(&id("alice"), accepted));
        assert_eq!(to_alice_far.recv().await, None);
    }

    #[tokio::test]
    async fn test_pending_dial_does_not_block_incoming() {
        // "zed" > "amy", yet zed's working channel is not refused while
        // amy's own dial to zed hangs.
        let (mut amy, mut rx) = registry("amy");
        let dial = amy.reserve(id("zed")).unwrap();
        let (from_zed, mut far) = pipe("zed");
        let accepted = amy.attach(from_zed, Attach::Accepted).unwrap();
        expect_opened(&mut rx).await;
        assert_eq!(amy.open_peers(), vec![id("zed")]);

        // The hung dial eventually fails; the open channel is untouched.
        assert!(!amy.drop_if_current(&id("zed"), dial));
        assert!(amy.is_current(&id("zed"), accepted));
        assert!(amy.send(&id("zed"), b"hi".to_vec()));
        assert_eq!(far.recv().await, Some(Payload::Binary(b"hi".to_vec())));
    }

    #[tokio::test]
    async fn test_closed_channel_falls_back_to_pending_dial() {
        let (mut reg, _rx) = registry("alice");
        let dial = reg.reserve(id("bob")).unwrap();
        let (from_bob, _far) = pipe("bob");
        let accepted = reg.attach(from_bob, Attach::Accepted).unwrap();

        assert!(reg.drop_if_current(&id("bob"), accepted));
        assert!(reg.contains(&id("bob")));
        assert!(reg.open_peers().is_empty());

        let (to_bob, _far) = pipe("bob");
        assert_eq!(reg.attach(to_bob, Attach::Dialed(dial)), Some(dial));
        assert_eq!(reg.open_peers(), vec![id("bob")]);
    }

    #[tokio::test]
    async fn test_refused_channel_is_closed() {
        let (mut reg, _rx) = registry("alice");
        let dial = reg.reserve(id("bob")).unwrap();
        let (to_bob, _f) = pipe("bob");
        reg.attach(to_bob, Attach::Dialed(dial)).unwrap();

        let (from_bob, mut far) = pipe("bob");
        assert!(reg.attach(from_bob, Attach::Accepted).is_none());
        assert_eq!(far.recv().await, None);
        assert!(reg.is_current(&id("bob"), dial));
    }

    #[tokio::test]
    async fn test_stale_close_is_ignored() {
        let (mut reg, mut rx) = registry("me");
        let (first, mut first_far) = pipe("bob");
        let old = reg.attach(first, Attach::Accepted).unwrap();
        expect_opened(&mut rx).await;

        let (second, _second_far) = pipe("bob");
        let new = reg.attach(second, Attach::Accepted).unwrap();
        assert_ne!(old, new);

        // The replaced channel closes; its Closed event names the old conn.
        assert_eq!(first_far.recv().await, None);
        let mut saw_old_close = false;
        while !saw_old_close {
            if let ChannelEvent::Closed { conn, .. } = rx.recv().await.unwrap() {
                assert_eq!(conn, old);
                saw_old_close = true;
            }
        }
        assert!(!reg.drop_if_current(&id("bob"), old));
        assert_eq!(reg.open_peers(), vec![id("bob")]);
        assert!(reg.drop_if_current(&id("bob"), new));
    }

    #[tokio::test]
    async fn test_drop_flushes_then_closes() {
        let (mut reg, mut rx) = registry("me");
        let (channel, mut far) = pipe("bob");
        reg.attach(channel, Attach::Accepted).unwrap();
        expect_opened(&mut rx).await;

        assert!(reg.send(&id("bob"), b"last".to_vec()));
        assert!(reg.drop_peer(&id("bob")));
        assert!(!reg.drop_peer(&id("bob")));
        assert_eq!(far.recv().await, Some(Payload::Binary(b"last".to_vec())));
        assert_eq!(far.recv().await, None);
    }

    #[tokio::test]
    async fn test_remote_close_emits_closed() {
        let (mut reg, mut rx) = registry("me");
        let (channel, far) = pipe("bob");
        let conn = reg.attach(channel, Attach::Accepted).unwrap();
        expect_opened(&mut rx).await;
        drop(far);
        match rx.recv().await.unwrap() {
            ChannelEvent::Closed { conn: c, peer_id, error } => {
                assert_eq!(c, conn);
                assert_eq!(peer_id, id("bob"));
                assert!(error.is_none());
            }
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_destroy_closes_everything() {
        let net = MemoryNetwork::new();
        let t = net.transport();
        let mut endpoint = t.open(Some(id("me"))).await.unwrap();
        let mut a = net.probe(id("a"), &id("me")).await.unwrap();
        let mut b = net.probe(id("b"), &id("me")).await.unwrap();

        let (mut reg, _rx) = registry("me");
        reg.attach(endpoint.incoming.recv().await.unwrap(), Attach::Accepted).unwrap();
        reg.attach(endpoint.incoming.recv().await.unwrap(), Attach::Accepted).unwrap();
        assert_eq!(reg.open_peers(), vec![id("a"), id("b")]);

        reg.destroy();
        assert!(reg.is_empty());
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
    }
}
