//! WebSocket server for room rendezvous.
//!
//! Each connection upgrades at `/room/{roomId}?userId=..&token=..&addr=..`,
//! is checked, joins the room, and stays a member until it disconnects.
//! Rejected connections are closed with code 1008 and a reason naming the
//! problem.

use crate::auth::TokenVerifier;
use crate::rooms::{Member, RoomTable};
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use mesh_core::protocol::{ClientMessage, ServerMessage};
use mesh_core::PeerId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// How long a rejected client gets to acknowledge the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Why a connection was turned away. The display text is the close reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("Invalid room")]
    InvalidRoom,
    #[error("Missing userId")]
    MissingUserId,
    #[error("Invalid userId")]
    InvalidUserId,
    #[error("Missing token")]
    MissingToken,
    #[error("Invalid token")]
    InvalidToken,
}

/// A parsed join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room: String,
    pub user_id: PeerId,
    pub token: Option<String>,
    /// Advertised peer-channel address
    pub address: Option<String>,
}

impl JoinRequest {
    /// Parse a request target such as `/room/r1?userId=alice&token=t`.
    pub fn parse(target: &str) -> std::result::Result<Self, RejectReason> {
        let url = url::Url::parse("ws://rendezvous.invalid")
            .and_then(|base| base.join(target))
            .map_err(|_| RejectReason::InvalidRoom)?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.collect())
            .unwrap_or_default();
        let room = match segments.as_slice() {
            ["room", room] if !room.is_empty() => (*room).to_string(),
            _ => return Err(RejectReason::InvalidRoom),
        };

        let mut user_id = None;
        let mut token = None;
        let mut address = None;
        for (key, value) in url.query_pairs() {
            let value = value.into_owned();
            match key.as_ref() {
                "userId" => user_id = Some(value),
                "token" => token = Some(value),
                "addr" => address = Some(value),
                _ => {}
            }
        }

        let user_id = match user_id.filter(|u| !u.is_empty()) {
            Some(u) => u.parse().map_err(|_| RejectReason::InvalidUserId)?,
            None => return Err(RejectReason::MissingUserId),
        };

        Ok(Self {
            room,
            user_id,
            token: token.filter(|t| !t.is_empty()),
            address: address.filter(|a| !a.is_empty()),
        })
    }
}

/// Rendezvous server: accepts connections and manages room membership.
pub struct RendezvousServer {
    rooms: RoomTable,
    verifier: Option<Arc<dyn TokenVerifier>>,
}

impl RendezvousServer {
    /// Create a server. Without a verifier, tokens are not required.
    pub fn new(verifier: Option<Arc<dyn TokenVerifier>>) -> Self {
        Self::with_rooms(RoomTable::new(), verifier)
    }

    /// Create a server over an existing room table.
    pub fn with_rooms(rooms: RoomTable, verifier: Option<Arc<dyn TokenVerifier>>) -> Self {
        Self { rooms, verifier }
    }

    pub fn rooms(&self) -> &RoomTable {
        &self.rooms
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Rendezvous server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_connection(stream, addr).await;
            });
        }
    }

    /// Run one client connection to completion.
    pub async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut target = None;
        let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
            target = Some(req.uri().to_string());
            Ok(resp)
        };
        let mut ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("WebSocket handshake failed for {}: {}", addr, e);
                return;
            }
        };
        let target = target.unwrap_or_default();
        debug!("Connection from {} for {}", addr, target);

        let request = match self.admit(&target).await {
            Ok(request) => request,
            Err(reason) => {
                info!("Rejected {} ({}): {}", addr, target_path(&target), reason);
                reject(&mut ws, reason).await;
                return;
            }
        };

        self.run_member(ws, request).await;
    }

    /// Validate a join request, verifying its token if required.
    async fn admit(&self, target: &str) -> std::result::Result<JoinRequest, RejectReason> {
        let request = JoinRequest::parse(target)?;
        if let Some(verifier) = &self.verifier {
            let token = request.token.as_deref().ok_or(RejectReason::MissingToken)?;
            match verifier.verify(token).await {
                Ok(identity) => info!(
                    "User authenticated: {} ({})",
                    identity.display_name(),
                    request.user_id
                ),
                Err(e) => {
                    warn!("Authentication failed for {}: {}", request.user_id, e);
                    return Err(RejectReason::InvalidToken);
                }
            }
        }
        Ok(request)
    }

    async fn run_member(&self, ws: WebSocketStream<TcpStream>, request: JoinRequest) {
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let replies = outbound.clone();

        let conn = self.rooms.join(
            &request.room,
            Member {
                user_id: request.user_id.clone(),
                address: request.address.clone(),
                outbound,
            },
        );

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(msg.to_json().into())).await {
                    debug!("Send failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(result) = stream.next().await {
            match result {
                Ok(Message::Text(text)) => match ClientMessage::from_json(&text) {
                    Some(ClientMessage::Ping) => {
                        let _ = replies.send(ServerMessage::Pong);
                    }
                    None => warn!("Ignoring malformed message from {}", request.user_id),
                },
                Ok(Message::Close(_)) => break,
                Ok(Message::Binary(_)) => {
                    warn!("Ignoring binary frame from {}", request.user_id)
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Connection error for {}: {}", request.user_id, e);
                    break;
                }
            }
        }

        self.rooms.leave(&request.room, conn);
        drop(replies);
        let _ = writer.await;
    }
}

/// Path portion of a request target, so tokens stay out of the logs.
fn target_path(target: &str) -> &str {
    target.split('?').next().unwrap_or(target)
}

async fn reject(ws: &mut WebSocketStream<TcpStream>, reason: RejectReason) {
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: reason.to_string().into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!("Close failed: {}", e);
        return;
    }
    // Wait for the client's close acknowledgement.
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;
}
