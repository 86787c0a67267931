//! WebSocket implementation of [`Transport`].
//!
//! Peers reach each other at `ws://` URLs. The address book maps peer IDs to
//! URLs and is filled from configuration, from discovery address hints and
//! from the addresses dialers announce in their handshakes. A transport
//! without a listener is dial-only.

use crate::connection::{exchange_handshake, into_channel, LocalIdentity};
use async_trait::async_trait;
use mesh_core::protocol::HandshakeRole;
use mesh_core::transport::{Result, TransportError};
use mesh_core::{Channel, Endpoint, PeerId, Transport};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, info, warn};

/// Channels waiting to be picked up by the provider.
const INCOMING_CAPACITY: usize = 64;

/// Time allowed for connecting plus the handshake exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type AddressBook = Arc<Mutex<HashMap<PeerId, String>>>;

/// Transport over WebSocket connections.
pub struct WsTransport {
    room: String,
    handshake_timeout: Duration,
    addresses: AddressBook,
    listener: Mutex<Option<TcpListener>>,
    listen_addr: Option<SocketAddr>,
    advertised: Option<String>,
    running: Mutex<Option<Running>>,
}

struct Running {
    identity: LocalIdentity,
    accept_task: Option<JoinHandle<()>>,
    /// Kept so a dial-only endpoint's incoming queue stays open
    _incoming_tx: mpsc::Sender<Channel>,
}

impl WsTransport {
    /// A transport that only dials out.
    pub fn dial_only(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            addresses: AddressBook::default(),
            listener: Mutex::new(None),
            listen_addr: None,
            advertised: None,
            running: Mutex::new(None),
        }
    }

    /// Bind a listener on `listen_addr`. Peers are told to reach us at
    /// `advertise`, or at `ws://{bound address}` if none is given.
    pub async fn bind(
        room: impl Into<String>,
        listen_addr: &str,
        advertise: Option<String>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local = listener.local_addr()?;
        let advertised = advertise.unwrap_or_else(|| format!("ws://{}", local));
        info!("Peer listener bound on {} (advertised as {})", local, advertised);

        let mut transport = Self::dial_only(room);
        transport.listener = Mutex::new(Some(listener));
        transport.listen_addr = Some(local);
        transport.advertised = Some(advertised);
        Ok(transport)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Record where `peer` can be reached.
    pub fn add_peer(&self, peer: PeerId, url: impl Into<String>) {
        self.book().insert(peer, url.into());
    }

    /// The address announced to peers and to discovery, if listening.
    pub fn advertised_address(&self) -> Option<&str> {
        self.advertised.as_deref()
    }

    /// The socket address actually bound, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn address_of(&self, peer: &PeerId) -> Option<String> {
        self.book().get(peer).cloned()
    }

    fn book(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, String>> {
        self.addresses.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn identity(&self) -> Option<LocalIdentity> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| r.identity.clone())
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, requested: Option<PeerId>) -> Result<Endpoint> {
        let local_id = requested.unwrap_or_else(PeerId::generate);
        let identity = LocalIdentity {
            peer_id: local_id.clone(),
            room: self.room.clone(),
            address: self.advertised.clone(),
        };
        let (incoming_tx, incoming) = mpsc::channel(INCOMING_CAPACITY);

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(TransportError::Other("transport already open".into()));
        }
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        let accept_task = listener.map(|listener| {
            tokio::spawn(accept_loop(
                listener,
                identity.clone(),
                self.handshake_timeout,
                Arc::clone(&self.addresses),
                incoming_tx.clone(),
            ))
        });
        *running = Some(Running {
            identity,
            accept_task,
            _incoming_tx: incoming_tx,
        });
        Ok(Endpoint { local_id, incoming })
    }

    async fn connect(&self, peer: &PeerId) -> Result<Channel> {
        let identity = self.identity().ok_or(TransportError::Closed)?;
        let url = self
            .address_of(peer)
            .ok_or_else(|| TransportError::PeerNotFound(peer.clone()))?;

        debug!("Dialing {} at {}", peer, url);
        let dial = async {
            let (mut ws, _) = connect_async(&url)
                .await
                .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", url, e)))?;
            let theirs =
                exchange_handshake(&mut ws, &identity, HandshakeRole::Dialer, self.handshake_timeout)
                    .await?;
            if &theirs.peer_id != peer {
                return Err(TransportError::ConnectionFailed(format!(
                    "{} is {}, not {}",
                    url, theirs.peer_id, peer
                )));
            }
            Ok(into_channel(peer.clone(), ws))
        };

        tokio::time::timeout(self.handshake_timeout, dial)
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("{}: timed out", url)))?
    }

    fn add_address_hint(&self, peer: &PeerId, address: &str) {
        let previous = self.book().insert(peer.clone(), address.to_string());
        if previous.as_deref() != Some(address) {
            debug!("Address for {}: {}", peer, address);
        }
    }

    async fn shutdown(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(running) = running {
            if let Some(task) = running.accept_task {
                task.abort();
            }
            info!("Transport for {} shut down", running.identity.peer_id);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    identity: LocalIdentity,
    handshake_timeout: Duration,
    addresses: AddressBook,
    incoming: mpsc::Sender<Channel>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        tokio::spawn(accept_one(
            stream,
            addr,
            identity.clone(),
            handshake_timeout,
            Arc::clone(&addresses),
            incoming.clone(),
        ));
    }
}

async fn accept_one(
    stream: TcpStream,
    addr: SocketAddr,
    identity: LocalIdentity,
    handshake_timeout: Duration,
    addresses: AddressBook,
    incoming: mpsc::Sender<Channel>,
) {
    let mut ws = match tokio::time::timeout(handshake_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            // Health checks connect and close without upgrading.
            debug!("WebSocket upgrade failed for {}: {}", addr, e);
            return;
        }
        Err(_) => {
            debug!("WebSocket upgrade timed out for {}", addr);
            return;
        }
    };

    let theirs =
        match exchange_handshake(&mut ws, &identity, HandshakeRole::Acceptor, handshake_timeout)
            .await
        {
            Ok(theirs) => theirs,
            Err(e) => {
                warn!("Rejected connection from {}: {}", addr, e);
                let _ = ws.close(None).await;
                return;
            }
        };

    if let Some(address) = &theirs.address {
        addresses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(theirs.peer_id.clone(), address.clone());
    }
    info!("Accepted channel from {} ({})", theirs.peer_id, addr);
    if incoming.send(into_channel(theirs.peer_id, ws)).await.is_err() {
        debug!("Endpoint closed, dropping channel from {}", addr);
    }
}
