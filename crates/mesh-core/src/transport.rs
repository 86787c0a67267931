//! Transport trait for peer-to-peer channels.
//!
//! The provider only needs "open a reliable, ordered, binary channel to peer
//! X" and "hand me channels other peers opened to me". Implementations:
//! - WebSocket (`mesh-peer` crate)
//! - [`MemoryNetwork`]: in-process switchboard for tests and demos

use crate::PeerId;
use async_trait::async_trait;
use futures::channel::mpsc as pipe;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Peer ID already taken: {0}")]
    IdTaken(PeerId),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A frame as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Binary(Vec<u8>),
    /// Non-binary frame; the provider logs and discards these
    Text(String),
}

pub type BoxSink = Pin<Box<dyn Sink<Vec<u8>, Error = TransportError> + Send>>;
pub type BoxStream = Pin<Box<dyn Stream<Item = Result<Payload>> + Send>>;

/// An established channel to one peer.
///
/// The stream ending means the channel closed; an `Err` item means it failed.
pub struct Channel {
    pub peer_id: PeerId,
    pub sink: BoxSink,
    pub stream: BoxStream,
}

impl Channel {
    pub fn new(
        peer_id: PeerId,
        sink: impl Sink<Vec<u8>, Error = TransportError> + Send + 'static,
        stream: impl Stream<Item = Result<Payload>> + Send + 'static,
    ) -> Self {
        Self {
            peer_id,
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// A listening endpoint: our identity plus channels opened to us.
pub struct Endpoint {
    pub local_id: PeerId,
    pub incoming: mpsc::Receiver<Channel>,
}

/// Transport layer for the mesh.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bring the local endpoint up. Resolves once, when it is reachable,
    /// with the identifier peers can dial us by. `requested` asks for a
    /// specific identifier; `None` lets the transport assign one.
    async fn open(&self, requested: Option<PeerId>) -> Result<Endpoint>;

    /// Open a channel to `peer`.
    async fn connect(&self, peer: &PeerId) -> Result<Channel>;

    /// Learn where `peer` can be reached. Transports that resolve IDs on
    /// their own ignore this.
    fn add_address_hint(&self, _peer: &PeerId, _address: &str) {}

    /// Release the local endpoint. Further dials fail.
    async fn shutdown(&self);
}

// ============================================================================
// In-memory implementation
// ============================================================================

const INCOMING_CAPACITY: usize = 64;

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerId, mpsc::Sender<Channel>>,
    /// Unordered pairs that cannot reach each other
    blocked: HashSet<(PeerId, PeerId)>,
}

fn link(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// In-process switchboard connecting [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose endpoint opens immediately.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: Mutex::new(None),
            gate: None,
        }
    }

    /// A transport whose endpoint stays unopened until the gate is released.
    pub fn gated_transport(&self) -> (MemoryTransport, ReadyGate) {
        let gate = Arc::new(Notify::new());
        let transport = MemoryTransport {
            network: self.clone(),
            local: Mutex::new(None),
            gate: Some(Arc::clone(&gate)),
        };
        (transport, ReadyGate(gate))
    }

    /// Make `a` and `b` unreachable from each other.
    pub fn block(&self, a: &PeerId, b: &PeerId) {
        self.lock().blocked.insert(link(a, b));
    }

    pub fn unblock(&self, a: &PeerId, b: &PeerId) {
        self.lock().blocked.remove(&link(a, b));
    }

    /// Open a raw channel from an unregistered identity `from` to `to`,
    /// returning the pipe ends directly so tests can inject arbitrary
    /// payloads and observe exactly what the peer sends.
    pub async fn probe(&self, from: PeerId, to: &PeerId) -> Result<Probe> {
        let (ours, theirs) = self.pair(&from, to)?;
        self.deliver(to, theirs).await?;
        Ok(ours)
    }

    fn pair(&self, from: &PeerId, to: &PeerId) -> Result<(Probe, Channel)> {
        let state = self.lock();
        if !state.endpoints.contains_key(to) {
            return Err(TransportError::PeerNotFound(to.clone()));
        }
        if state.blocked.contains(&link(from, to)) {
            return Err(TransportError::ConnectionFailed(format!(
                "{from} cannot reach {to}"
            )));
        }
        drop(state);

        let (to_them, from_us) = pipe::unbounded::<Payload>();
        let (to_us, from_them) = pipe::unbounded::<Payload>();
        let theirs = pipe_channel(from.clone(), to_us, from_us);
        Ok((
            Probe {
                tx: to_them,
                rx: from_them,
            },
            theirs,
        ))
    }

    async fn deliver(&self, to: &PeerId, channel: Channel) -> Result<()> {
        let incoming = self
            .lock()
            .endpoints
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::PeerNotFound(to.clone()))?;
        incoming
            .send(channel)
            .await
            .map_err(|_| TransportError::PeerNotFound(to.clone()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Releases a gated [`MemoryTransport`] endpoint.
pub struct ReadyGate(Arc<Notify>);

impl ReadyGate {
    pub fn open(&self) {
        self.0.notify_one();
    }
}

/// Raw end of an in-memory channel.
pub struct Probe {
    pub tx: pipe::UnboundedSender<Payload>,
    pub rx: pipe::UnboundedReceiver<Payload>,
}

impl Probe {
    pub fn send(&self, payload: Payload) -> Result<()> {
        self.tx
            .unbounded_send(payload)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Next payload, or `None` once the other side closed.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.next().await
    }

    /// Convert into a provider-facing channel named `peer_id`.
    pub fn into_channel(self, peer_id: PeerId) -> Channel {
        pipe_channel(peer_id, self.tx, self.rx)
    }
}

fn pipe_channel(
    peer_id: PeerId,
    tx: pipe::UnboundedSender<Payload>,
    rx: pipe::UnboundedReceiver<Payload>,
) -> Channel {
    let sink = tx
        .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
        .with(|data: Vec<u8>| futures::future::ready(Ok::<_, TransportError>(Payload::Binary(data))));
    Channel::new(peer_id, sink, rx.map(Ok))
}

/// Transport endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: Mutex<Option<PeerId>>,
    gate: Option<Arc<Notify>>,
}

impl MemoryTransport {
    fn local_id(&self) -> Option<PeerId> {
        self.local.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, requested: Option<PeerId>) -> Result<Endpoint> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let local_id = requested.unwrap_or_else(PeerId::generate);
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        {
            let mut state = self.network.lock();
            if state.endpoints.contains_key(&local_id) {
                return Err(TransportError::IdTaken(local_id));
            }
            state.endpoints.insert(local_id.clone(), tx);
        }
        *self.local.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_id.clone());
        Ok(Endpoint {
            local_id,
            incoming: rx,
        })
    }

    async fn connect(&self, peer: &PeerId) -> Result<Channel> {
        let local = self.local_id().ok_or(TransportError::Closed)?;
        let (ours, theirs) = self.network.pair(&local, peer)?;
        self.network.deliver(peer, theirs).await?;
        Ok(ours.into_channel(peer.clone()))
    }

    async fn shutdown(&self) {
        if let Some(local) = self.local.lock().unwrap_or_else(|e| e.into_inner()).take() {
            self.network.lock().endpoints.remove(&local);
        }
    }
}
