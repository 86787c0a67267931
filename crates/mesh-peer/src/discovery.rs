//! Rendezvous client.
//!
//! Joins a room on the rendezvous service and forwards its announcements to
//! the provider (see `ProviderConfig::with_discovery`). The connection is
//! kept alive with pings and re-established with backoff if it drops; each
//! reconnect yields a fresh `joined` listing.

use futures::{SinkExt, StreamExt};
use mesh_core::backoff::{calculate_backoff, RetryState};
use mesh_core::protocol::{ClientMessage, ServerMessage};
use mesh_core::{PeerId, ReconnectConfig};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

/// Announcements buffered for the provider.
const ANNOUNCEMENT_CAPACITY: usize = 64;

/// How long `leave` waits for the close handshake.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid rendezvous URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Rendezvous URL cannot carry a room path: {0}")]
    NotABase(String),

    #[error("Failed to reach rendezvous: {0}")]
    Connect(String),

    #[error("Rendezvous rejected the join: {0}")]
    Rejected(String),

    #[error("Rendezvous closed the connection")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How to join a room on the rendezvous service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Base URL of the service, e.g. `ws://localhost:10000`
    pub server: String,
    pub room: String,
    pub user_id: PeerId,
    pub token: Option<String>,
    /// Advertised peer-channel address shared with the room
    pub address: Option<String>,
    pub ping_interval: Duration,
    /// Reconnect policy after the connection drops
    pub reconnect: ReconnectConfig,
}

impl DiscoveryConfig {
    pub fn new(server: impl Into<String>, room: impl Into<String>, user_id: PeerId) -> Self {
        Self {
            server: server.into(),
            room: room.into(),
            user_id,
            token: None,
            address: None,
            ping_interval: Duration::from_secs(20),
            reconnect: ReconnectConfig {
                max_attempts: None,
                ..Default::default()
            },
        }
    }

    /// `{server}/room/{room}?userId=..&token=..&addr=..`
    pub fn join_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.server)?;
        url.path_segments_mut()
            .map_err(|_| DiscoveryError::NotABase(self.server.clone()))?
            .pop_if_empty()
            .push("room")
            .push(&self.room);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("userId", self.user_id.as_str());
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            if let Some(address) = &self.address {
                query.append_pair("addr", address);
            }
        }
        Ok(url)
    }
}

/// Handle to a running rendezvous session.
///
/// [`leave`](Self::leave) closes the connection cleanly. Dropping the handle
/// also leaves the room, by cutting the connection.
pub struct DiscoveryClient {
    task: JoinHandle<()>,
    leave_tx: Option<oneshot::Sender<()>>,
}

impl DiscoveryClient {
    /// Join the room. Resolves once the service has answered with `joined`,
    /// or fails if it turned us away.
    ///
    /// The returned receiver yields that `joined` first, then every later
    /// announcement.
    pub async fn join(config: DiscoveryConfig) -> Result<(Self, mpsc::Receiver<ServerMessage>)> {
        let url = config.join_url()?;
        let (ws, joined) = connect_session(&url).await?;
        info!("Joined room {} via {}", config.room, config.server);

        let (tx, rx) = mpsc::channel(ANNOUNCEMENT_CAPACITY);
        // Capacity is well above one, so the first send cannot fail.
        let _ = tx.try_send(joined);

        let (leave_tx, leave_rx) = oneshot::channel();
        let task = tokio::spawn(run(config, url, ws, tx, leave_rx));
        Ok((
            Self {
                task,
                leave_tx: Some(leave_tx),
            },
            rx,
        ))
    }

    /// Whether the session task has given up.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Leave the room. The service announces our departure as soon as the
    /// close frame arrives.
    pub async fn leave(mut self) {
        if let Some(leave_tx) = self.leave_tx.take() {
            let _ = leave_tx.send(());
        }
        if tokio::time::timeout(LEAVE_TIMEOUT, &mut self.task).await.is_err() {
            debug!("Rendezvous close did not finish in time");
        }
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Connect and wait for the service's verdict.
async fn connect_session(url: &Url) -> Result<(Ws, ServerMessage)> {
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| DiscoveryError::Connect(e.to_string()))?;

    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                Some(msg @ ServerMessage::Joined { .. }) => return Ok((ws, msg)),
                Some(other) => debug!("Ignoring {:?} before joined", other),
                None => warn!("Ignoring malformed rendezvous message"),
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(if reason.is_empty() {
                    DiscoveryError::Closed
                } else {
                    DiscoveryError::Rejected(reason)
                });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(DiscoveryError::Connect(e.to_string())),
            None => return Err(DiscoveryError::Closed),
        }
    }
}

enum SessionEnd {
    /// The connection dropped; try again
    Dropped,
    /// Leaving, or nobody is listening any more
    Stop,
}

async fn run(
    config: DiscoveryConfig,
    url: Url,
    mut ws: Ws,
    tx: mpsc::Sender<ServerMessage>,
    mut leave: oneshot::Receiver<()>,
) {
    loop {
        if let SessionEnd::Stop = session(&mut ws, &tx, config.ping_interval, &mut leave).await {
            info!("Leaving room {}", config.room);
            let _ = ws.close(None).await;
            return;
        }
        warn!("Lost connection to rendezvous for room {}", config.room);

        let mut retry = RetryState::default();
        ws = loop {
            let delay = calculate_backoff(retry.attempts + 1, &config.reconnect);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tx.closed() => return,
                _ = &mut leave => return,
            }
            match connect_session(&url).await {
                Ok((ws, joined)) => {
                    info!("Rejoined room {}", config.room);
                    if tx.send(joined).await.is_err() {
                        return;
                    }
                    break ws;
                }
                Err(DiscoveryError::Rejected(reason)) => {
                    error!("Rendezvous rejected rejoin: {}", reason);
                    return;
                }
                Err(e) => {
                    debug!("Rejoin failed: {}", e);
                    if retry.record_failure(&config.reconnect).is_none() {
                        error!("Giving up on rendezvous after {} attempts", retry.attempts);
                        return;
                    }
                }
            }
        };
    }
}

async fn session(
    ws: &mut Ws,
    tx: &mpsc::Sender<ServerMessage>,
    ping_interval: Duration,
    leave: &mut oneshot::Receiver<()>,
) -> SessionEnd {
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + ping_interval,
        ping_interval.max(Duration::from_millis(1)),
    );

    loop {
        tokio::select! {
            item = ws.next() => match item {
                Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                    Some(ServerMessage::Pong) => debug!("Rendezvous pong"),
                    Some(msg) => {
                        if tx.send(msg).await.is_err() {
                            return SessionEnd::Stop;
                        }
                    }
                    None => warn!("Ignoring malformed rendezvous message"),
                },
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Rendezvous connection error: {}", e);
                    return SessionEnd::Dropped;
                }
            },
            _ = ping.tick() => {
                let ping = Message::Text(ClientMessage::Ping.to_json().into());
                if let Err(e) = ws.send(ping).await {
                    debug!("Ping failed: {}", e);
                    return SessionEnd::Dropped;
                }
            }
            _ = tx.closed() => return SessionEnd::Stop,
            _ = &mut *leave => return SessionEnd::Stop,
        }
    }
}
