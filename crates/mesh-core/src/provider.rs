//! Mesh provider: keeps one document and one awareness table in sync with
//! every peer of a room over direct channels.
//!
//! [`MeshProvider::spawn`] starts a control loop that owns the connection
//! registry. The returned handle talks to it through a bounded command queue.
//! Lifecycle: `Initializing` until the transport endpoint opens, then
//! `Ready`, then `Destroyed`.
//!
//! Data flow once ready:
//! - a channel opens: send the full snapshot, then every known awareness state
//! - a document delta arrives: merge; a merge that changed state republishes
//!   the new operations, which reach everyone else (relay through partial
//!   connectivity)
//! - a local edit: broadcast the delta to every open channel
//! - awareness changes: coalesced, at most one broadcast per flush covering
//!   every participant touched since the previous one

use crate::awareness::{Awareness, AwarenessUpdate, Origin};
use crate::backoff::{ReconnectConfig, RetryState};
use crate::document::SharedText;
use crate::events::{EventBus, MeshEvent};
use crate::protocol::{encode_awareness, Frame, PeerEntry, ServerMessage};
use crate::registry::{Attach, ChannelEvent, ConnId, Registry};
use crate::transport::{Channel, Endpoint, Payload, Transport};
use crate::{ClientId, PeerId};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider destroyed")]
    Destroyed,
}

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderState {
    /// Waiting for the transport endpoint; dials are queued
    Initializing,
    Ready,
    Destroyed,
}

/// Provider configuration.
#[derive(Debug)]
pub struct ProviderConfig {
    pub room_id: String,
    /// Identifier to request from the transport (None = let it assign one)
    pub peer_id: Option<PeerId>,
    /// Dialed as soon as the endpoint is ready
    pub initial_peers: Vec<PeerId>,
    /// Retry policy for failed dials
    pub reconnect: ReconnectConfig,
    /// How long awareness changes are collected before one broadcast
    pub awareness_flush_delay: Duration,
    /// Remote awareness states not refreshed within this are dropped
    pub awareness_timeout: Duration,
    /// How often awareness states are checked for expiry and renewal
    pub awareness_check_interval: Duration,
    pub event_queue_capacity: usize,
    pub outbound_queue_capacity: usize,
    /// Membership feed from a rendezvous service
    pub discovery: Option<mpsc::Receiver<ServerMessage>>,
}

impl ProviderConfig {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            peer_id: None,
            initial_peers: Vec::new(),
            reconnect: ReconnectConfig::default(),
            awareness_flush_delay: Duration::ZERO,
            awareness_timeout: Duration::from_secs(30),
            awareness_check_interval: Duration::from_secs(3),
            event_queue_capacity: 1024,
            outbound_queue_capacity: 256,
            discovery: None,
        }
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn with_initial_peers(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.initial_peers.extend(peers);
        self
    }

    pub fn with_discovery(mut self, discovery: mpsc::Receiver<ServerMessage>) -> Self {
        self.discovery = Some(discovery);
        self
    }
}

enum Command {
    Dial(PeerId),
    Drop(PeerId),
    ConnectedPeers(oneshot::Sender<Vec<PeerId>>),
    Destroy(oneshot::Sender<()>),
}

/// Handle to a running provider. Dropping it aborts the control loop
/// without the goodbye that [`MeshProvider::destroy`] sends.
pub struct MeshProvider {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ProviderState>,
    local_id: Arc<OnceLock<PeerId>>,
    events: Arc<EventBus>,
    doc: SharedText,
    awareness: Awareness,
    task: JoinHandle<()>,
}

impl MeshProvider {
    /// Start a provider for `doc` and `awareness` over `transport`.
    ///
    /// Must be called within a Tokio runtime.
    pub fn spawn<T: Transport>(
        mut config: ProviderConfig,
        transport: Arc<T>,
        doc: SharedText,
        awareness: Awareness,
    ) -> Self {
        let (commands, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (state_tx, state) = watch::channel(ProviderState::Initializing);
        let local_id = Arc::new(OnceLock::new());
        let events = Arc::new(EventBus::new());

        let inputs = Inputs {
            commands: commands_rx,
            doc_deltas: doc.subscribe(),
            awareness_updates: awareness.subscribe(),
            discovery: config.discovery.take(),
        };
        let control = ControlLoop {
            config,
            transport,
            doc: doc.clone(),
            awareness: awareness.clone(),
            events: Arc::clone(&events),
            state: state_tx,
            local_id: Arc::clone(&local_id),
        };
        let task = tokio::spawn(control.run(inputs));

        Self {
            commands,
            state,
            local_id,
            events,
            doc,
            awareness,
            task,
        }
    }

    /// Connect to `peer`. A no-op for ourselves or a peer already connected
    /// or connecting; queued until the endpoint is ready.
    pub async fn dial(&self, peer: PeerId) -> Result<()> {
        self.command(Command::Dial(peer)).await
    }

    /// Close the connection to `peer` and stop retrying it.
    pub async fn drop_peer(&self, peer: PeerId) -> Result<()> {
        self.command(Command::Drop(peer)).await
    }

    /// Peers with an open channel, sorted.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::ConnectedPeers(tx)).await?;
        rx.await.map_err(|_| ProviderError::Destroyed)
    }

    /// Our identifier, once the endpoint is ready.
    pub fn local_id(&self) -> Option<PeerId> {
        self.local_id.get().cloned()
    }

    pub fn state(&self) -> ProviderState {
        *self.state.borrow()
    }

    /// Wait for the endpoint to open and return our identifier.
    pub async fn wait_ready(&self) -> Result<PeerId> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s != ProviderState::Initializing)
            .await
            .map(|s| *s)
            .unwrap_or(ProviderState::Destroyed);
        match (reached, self.local_id()) {
            (ProviderState::Ready, Some(id)) => Ok(id),
            _ => Err(ProviderError::Destroyed),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn document(&self) -> &SharedText {
        &self.doc
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    /// Announce our departure, close every connection and release the
    /// endpoint. Safe to call in any state and more than once.
    pub async fn destroy(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Destroy(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProviderError::Destroyed)
    }
}

impl Drop for MeshProvider {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Control loop
// ============================================================================

struct Inputs {
    commands: mpsc::Receiver<Command>,
    doc_deltas: mpsc::UnboundedReceiver<Vec<u8>>,
    awareness_updates: mpsc::UnboundedReceiver<AwarenessUpdate>,
    discovery: Option<mpsc::Receiver<ServerMessage>>,
}

enum DialOutcome {
    Connected { conn: ConnId, channel: Channel },
    Failed { conn: ConnId, peer: PeerId, error: String },
    RetryDue(PeerId),
}

async fn next_discovery(discovery: &mut Option<mpsc::Receiver<ServerMessage>>) -> Option<ServerMessage> {
    match discovery {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct ControlLoop<T: Transport> {
    config: ProviderConfig,
    transport: Arc<T>,
    doc: SharedText,
    awareness: Awareness,
    events: Arc<EventBus>,
    state: watch::Sender<ProviderState>,
    local_id: Arc<OnceLock<PeerId>>,
}

impl<T: Transport> ControlLoop<T> {
    async fn run(self, mut inputs: Inputs) {
        let Some((endpoint, pending)) = self.await_endpoint(&mut inputs).await else {
            return;
        };
        self.run_ready(endpoint, pending, inputs).await;
    }

    /// Wait for the endpoint while queueing dial requests.
    async fn await_endpoint(&self, inputs: &mut Inputs) -> Option<(Endpoint, Vec<PeerId>)> {
        let mut pending: Vec<PeerId> = Vec::new();
        for peer in &self.config.initial_peers {
            queue_dial(&mut pending, peer.clone());
        }

        let open = self.transport.open(self.config.peer_id.clone());
        tokio::pin!(open);

        loop {
            tokio::select! {
                biased;

                command = inputs.commands.recv() => match command {
                    Some(Command::Dial(peer)) => queue_dial(&mut pending, peer),
                    Some(Command::Drop(peer)) => pending.retain(|p| *p != peer),
                    Some(Command::ConnectedPeers(reply)) => {
                        let _ = reply.send(Vec::new());
                    }
                    Some(Command::Destroy(ack)) => {
                        info!("Provider for room {} destroyed before ready", self.config.room_id);
                        self.finish().await;
                        let _ = ack.send(());
                        return None;
                    }
                    None => return None,
                },

                result = &mut open => match result {
                    Ok(endpoint) => return Some((endpoint, pending)),
                    Err(e) => {
                        error!("Failed to open transport endpoint: {}", e);
                        self.finish().await;
                        return None;
                    }
                },

                Some(msg) = next_discovery(&mut inputs.discovery) => match msg {
                    ServerMessage::Joined { peers } => {
                        for entry in peers {
                            self.hint(&entry);
                            queue_dial(&mut pending, entry.user_id);
                        }
                    }
                    ServerMessage::PeerJoined { user_id, address } => {
                        self.hint(&PeerEntry::new(user_id.clone(), address));
                        queue_dial(&mut pending, user_id);
                    }
                    ServerMessage::PeerLeft { user_id } => pending.retain(|p| *p != user_id),
                    ServerMessage::Pong => {}
                },

                // Nobody to send to yet; cold-start sync covers this state later.
                Some(_) = inputs.doc_deltas.recv() => {}
                Some(_) = inputs.awareness_updates.recv() => {}
            }
        }
    }

    async fn run_ready(self, endpoint: Endpoint, pending: Vec<PeerId>, mut inputs: Inputs) {
        let Endpoint {
            local_id,
            mut incoming,
        } = endpoint;
        let _ = self.local_id.set(local_id.clone());

        let (events_tx, mut channel_events) = mpsc::channel(self.config.event_queue_capacity.max(1));
        let (dial_tx, mut dial_outcomes) = mpsc::unbounded_channel();
        let mut housekeeping = tokio::time::interval(
            self.config
                .awareness_check_interval
                .max(Duration::from_millis(1)),
        );
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut mesh = Mesh {
            registry: Registry::new(
                local_id.clone(),
                self.config.outbound_queue_capacity,
                events_tx,
            ),
            wanted: HashSet::new(),
            retries: HashMap::new(),
            dirty: BTreeSet::new(),
            flush_at: None,
            dial_tx,
            ctl: self,
        };

        info!("Provider ready as {} in room {}", local_id, mesh.ctl.config.room_id);
        mesh.ctl.state.send_replace(ProviderState::Ready);
        mesh.ctl.events.emit(MeshEvent::Ready {
            peer_id: local_id.clone(),
        });
        for peer in pending {
            mesh.dial(peer);
        }

        let mut accepting = true;
        loop {
            tokio::select! {
                biased;

                command = inputs.commands.recv() => match command {
                    Some(Command::Dial(peer)) => mesh.dial(peer),
                    Some(Command::Drop(peer)) => mesh.forget(&peer),
                    Some(Command::ConnectedPeers(reply)) => {
                        let _ = reply.send(mesh.registry.open_peers());
                    }
                    Some(Command::Destroy(ack)) => {
                        mesh.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        mesh.shutdown().await;
                        return;
                    }
                },

                _ = tokio::time::sleep_until(mesh.flush_at.unwrap_or_else(Instant::now)), if mesh.flush_at.is_some() => {
                    mesh.flush_awareness();
                }

                Some(event) = channel_events.recv() => mesh.on_channel_event(event),

                channel = incoming.recv(), if accepting => match channel {
                    Some(channel) => {
                        debug!("Incoming channel from {}", channel.peer_id);
                        mesh.attach(channel, Attach::Accepted);
                    }
                    None => {
                        warn!("Transport stopped accepting channels");
                        accepting = false;
                    }
                },

                Some(outcome) = dial_outcomes.recv() => mesh.on_dial_outcome(outcome),

                Some(delta) = inputs.doc_deltas.recv() => {
                    let sent = mesh.registry.broadcast(&delta);
                    debug!("Broadcast document delta ({} bytes) to {} peers", delta.len(), sent);
                }

                Some(update) = inputs.awareness_updates.recv() => {
                    mesh.mark_dirty(update);
                    // Everything already queued belongs to the same flush.
                    while let Ok(update) = inputs.awareness_updates.try_recv() {
                        mesh.mark_dirty(update);
                    }
                }

                Some(msg) = next_discovery(&mut inputs.discovery) => mesh.on_discovery(msg),

                _ = housekeeping.tick() => {
                    let expired = mesh.ctl.awareness.check_outdated(mesh.ctl.config.awareness_timeout);
                    if !expired.is_empty() {
                        debug!("Expired awareness states: {:?}", expired);
                    }
                }
            }
        }
    }

    fn hint(&self, entry: &PeerEntry) {
        if let Some(address) = &entry.address {
            self.transport.add_address_hint(&entry.user_id, address);
        }
    }

    /// Release the endpoint and publish the final state.
    async fn finish(&self) {
        self.transport.shutdown().await;
        self.state.send_replace(ProviderState::Destroyed);
        self.events.emit(MeshEvent::Destroyed);
    }
}

fn queue_dial(pending: &mut Vec<PeerId>, peer: PeerId) {
    if !pending.contains(&peer) {
        pending.push(peer);
    }
}

/// Control loop state once the endpoint is ready.
struct Mesh<T: Transport> {
    ctl: ControlLoop<T>,
    registry: Registry,
    /// Peers we still want a connection to; failed dials to these are retried
    wanted: HashSet<PeerId>,
    retries: HashMap<PeerId, RetryState>,
    /// Awareness participants changed since the last flush
    dirty: BTreeSet<ClientId>,
    flush_at: Option<Instant>,
    dial_tx: mpsc::UnboundedSender<DialOutcome>,
}

impl<T: Transport> Mesh<T> {
    fn dial(&mut self, peer: PeerId) {
        if peer == *self.registry.local_id() || self.registry.contains(&peer) {
            return;
        }
        self.wanted.insert(peer.clone());
        self.start_dial(peer);
    }

    fn start_dial(&mut self, peer: PeerId) {
        let Some(conn) = self.registry.reserve(peer.clone()) else {
            return;
        };
        debug!("Dialing {} ({})", peer, conn);
        let transport = Arc::clone(&self.ctl.transport);
        let outcomes = self.dial_tx.clone();
        tokio::spawn(async move {
            let outcome = match transport.connect(&peer).await {
                Ok(channel) => DialOutcome::Connected { conn, channel },
                Err(e) => DialOutcome::Failed {
                    conn,
                    peer,
                    error: e.to_string(),
                },
            };
            let _ = outcomes.send(outcome);
        });
    }

    /// Register an established channel and bring the peer up to date.
    /// The snapshot is queued before anything else can be broadcast to it.
    fn attach(&mut self, channel: Channel, how: Attach) {
        let peer = channel.peer_id.clone();
        if self.registry.attach(channel, how).is_some() {
            self.cold_start(&peer);
        }
    }

    /// Drop `peer` and stop wanting it.
    fn forget(&mut self, peer: &PeerId) {
        self.wanted.remove(peer);
        self.retries.remove(peer);
        if self.registry.drop_peer(peer) {
            info!("Dropped peer {}", peer);
            self.ctl.events.emit(MeshEvent::PeerDisconnected {
                peer_id: peer.clone(),
            });
        }
    }

    fn on_dial_outcome(&mut self, outcome: DialOutcome) {
        match outcome {
            DialOutcome::Connected { conn, channel } => self.attach(channel, Attach::Dialed(conn)),
            DialOutcome::Failed { conn, peer, error } => {
                if !self.registry.drop_if_current(&peer, conn) {
                    return;
                }
                if !self.wanted.contains(&peer) {
                    warn!("Dial to {} failed: {}", peer, error);
                    return;
                }
                let state = self.retries.entry(peer.clone()).or_default();
                let retry = state.record_failure(&self.ctl.config.reconnect);
                let attempt = state.attempts;
                self.ctl.events.emit(MeshEvent::DialFailed {
                    peer_id: peer.clone(),
                    attempt,
                    error: error.clone(),
                    will_retry: retry.is_some(),
                });
                match retry {
                    Some(delay) => {
                        warn!(
                            "Dial to {} failed (attempt {}): {}; retrying in {:?}",
                            peer, attempt, error, delay
                        );
                        let outcomes = self.dial_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = outcomes.send(DialOutcome::RetryDue(peer));
                        });
                    }
                    None => {
                        warn!("Giving up on {} after {} attempts: {}", peer, attempt, error);
                        self.wanted.remove(&peer);
                        self.retries.remove(&peer);
                    }
                }
            }
            DialOutcome::RetryDue(peer) => {
                if self.wanted.contains(&peer) && !self.registry.contains(&peer) {
                    self.start_dial(peer);
                }
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened {
                conn,
                peer_id,
                direction,
            } => {
                if !self.registry.is_current(&peer_id, conn) {
                    return;
                }
                self.retries.remove(&peer_id);
                self.ctl.events.emit(MeshEvent::PeerConnected { peer_id, direction });
            }
            ChannelEvent::Frame {
                conn,
                peer_id,
                payload,
            } => {
                if self.registry.is_current(&peer_id, conn) {
                    self.on_payload(peer_id, payload);
                }
            }
            ChannelEvent::Closed {
                conn,
                peer_id,
                error,
            } => {
                if !self.registry.drop_if_current(&peer_id, conn) {
                    return;
                }
                match error {
                    Some(e) => warn!("Connection to {} failed: {}", peer_id, e),
                    None => info!("Connection to {} closed", peer_id),
                }
                self.wanted.remove(&peer_id);
                self.retries.remove(&peer_id);
                self.ctl.events.emit(MeshEvent::PeerDisconnected { peer_id });
            }
        }
    }

    /// Bring a freshly opened peer up to date.
    fn cold_start(&self, peer: &PeerId) {
        match self.ctl.doc.snapshot() {
            Ok(snapshot) => {
                self.registry.send(peer, snapshot);
            }
            Err(e) => error!("Failed to snapshot document for {}: {}", peer, e),
        }
        let ids = self.ctl.awareness.client_ids();
        if !ids.is_empty() {
            let delta = self.ctl.awareness.encode(&ids);
            self.registry.send(peer, encode_awareness(&delta));
        }
        debug!("Sent cold-start state to {}", peer);
    }

    fn on_payload(&mut self, peer: PeerId, payload: Payload) {
        let data = match payload {
            Payload::Binary(data) => data,
            Payload::Text(text) => {
                self.discard(peer, format!("non-binary frame ({} bytes)", text.len()));
                return;
            }
        };

        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                self.discard(peer, e.to_string());
                return;
            }
        };
        debug!("Received {} frame ({} bytes) from {}", frame.kind(), data.len(), peer);

        match frame {
            Frame::Awareness(delta) => {
                if let Err(e) = self.ctl.awareness.apply(&delta, Origin::Remote(peer.clone())) {
                    self.discard(peer, e.to_string());
                }
            }
            Frame::Document(delta) => match self.ctl.doc.apply(&delta) {
                Ok(true) => {
                    debug!("Merged {} bytes from {}", delta.len(), peer);
                    self.ctl.events.emit(MeshEvent::DocumentMerged {
                        peer_id: peer,
                        size: delta.len(),
                    });
                }
                Ok(false) => debug!("Delta from {} was already known", peer),
                Err(e) => self.discard(peer, e.to_string()),
            },
        }
    }

    fn discard(&self, peer: PeerId, reason: String) {
        warn!("Discarding frame from {}: {}", peer, reason);
        self.ctl
            .events
            .emit(MeshEvent::FrameDiscarded { peer_id: peer, reason });
    }

    fn mark_dirty(&mut self, update: AwarenessUpdate) {
        self.dirty.extend(update.change.ids());
        if self.flush_at.is_none() && !self.dirty.is_empty() {
            self.flush_at = Some(Instant::now() + self.ctl.config.awareness_flush_delay);
        }
    }

    fn flush_awareness(&mut self) {
        self.flush_at = None;
        let ids: Vec<ClientId> = std::mem::take(&mut self.dirty).into_iter().collect();
        if ids.is_empty() {
            return;
        }
        let frame = encode_awareness(&self.ctl.awareness.encode(&ids));
        let sent = self.registry.broadcast(&frame);
        debug!("Broadcast awareness for {} clients to {} peers", ids.len(), sent);
    }

    fn on_discovery(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Joined { peers } => {
                debug!("Room has {} other members", peers.len());
                for entry in peers {
                    self.ctl.hint(&entry);
                    self.dial(entry.user_id);
                }
            }
            ServerMessage::PeerJoined { user_id, address } => {
                self.ctl.hint(&PeerEntry::new(user_id.clone(), address));
                self.dial(user_id);
            }
            ServerMessage::PeerLeft { user_id } => self.forget(&user_id),
            ServerMessage::Pong => debug!("Rendezvous pong"),
        }
    }

    /// Say goodbye, close everything and release the endpoint.
    async fn shutdown(&mut self) {
        let own = self.ctl.awareness.client_id();
        let change = self.ctl.awareness.remove_states(&[own], Origin::Local);
        if !change.is_empty() {
            let frame = encode_awareness(&self.ctl.awareness.encode(&[own]));
            self.registry.broadcast(&frame);
        }
        self.registry.destroy();
        self.wanted.clear();
        self.retries.clear();
        info!("Provider for room {} destroyed", self.ctl.config.room_id);
        self.ctl.finish().await;
    }
}
