//! WebSocket peer connections.
//!
//! A freshly upgraded WebSocket carries no identity, so both sides first
//! exchange one [`Handshake`] frame. Once the remote is known the socket is
//! wrapped as a [`Channel`] for the provider: binary frames become
//! [`Payload::Binary`], text frames [`Payload::Text`], and a close frame ends
//! the stream.

use futures::future::ready;
use futures::{SinkExt, StreamExt};
use mesh_core::protocol::{Handshake, HandshakeRole, MAX_FRAME_SIZE};
use mesh_core::transport::{Result, TransportError};
use mesh_core::{Channel, Payload, PeerId};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

/// Who we are, as told to the other side of a new socket.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub peer_id: PeerId,
    pub room: String,
    /// Address we accept channels on (None = dial-only)
    pub address: Option<String>,
}

/// Exchange handshakes over a new socket.
///
/// Sends ours first, then waits up to `limit` for the remote's. Rejects a
/// remote in another room or claiming our own ID.
pub async fn exchange_handshake<S>(
    ws: &mut WebSocketStream<S>,
    local: &LocalIdentity,
    role: HandshakeRole,
    limit: Duration,
) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::new(
        local.peer_id.clone(),
        &local.room,
        role,
        local.address.clone(),
    );
    ws.send(Message::Binary(ours.to_json().into()))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;

    let theirs = tokio::time::timeout(limit, read_handshake(ws))
        .await
        .map_err(|_| TransportError::ConnectionFailed("handshake timed out".into()))??;

    if theirs.should_warn_version() {
        warn!(
            "Peer {} speaks protocol version {}",
            theirs.peer_id, theirs.version
        );
    }
    if theirs.room != local.room {
        return Err(TransportError::ConnectionFailed(format!(
            "peer {} is in room {:?}, not {:?}",
            theirs.peer_id, theirs.room, local.room
        )));
    }
    if theirs.peer_id == local.peer_id {
        return Err(TransportError::ConnectionFailed(
            "remote claims our own peer ID".into(),
        ));
    }
    debug!(
        "Handshake complete with {} ({:?}, address: {:?})",
        theirs.peer_id, theirs.role, theirs.address
    );
    Ok(theirs)
}

async fn read_handshake<S>(ws: &mut WebSocketStream<S>) -> Result<Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                return Handshake::from_json(&data).ok_or_else(|| {
                    TransportError::ConnectionFailed("first frame was not a handshake".into())
                });
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(other)) => {
                return Err(TransportError::ConnectionFailed(format!(
                    "expected handshake, got {}",
                    kind(&other)
                )));
            }
            Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }
}

/// Wrap a handshaken socket as a provider channel to `peer_id`.
pub fn into_channel<S>(peer_id: PeerId, ws: WebSocketStream<S>) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = ws.split();

    let sink = write
        .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
        .with(|data: Vec<u8>| ready(Ok::<_, TransportError>(Message::Binary(data.into()))));

    let label = peer_id.clone();
    let stream = read
        .take_while(|item| {
            ready(!matches!(
                item,
                Ok(Message::Close(_)) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed)
            ))
        })
        .filter_map(move |item| ready(payload(&label, item)));

    Channel::new(peer_id, sink, stream)
}

/// Map one socket item to what the provider sees. Control frames and
/// oversized frames yield nothing.
fn payload(peer: &PeerId, item: std::result::Result<Message, WsError>) -> Option<Result<Payload>> {
    match item {
        Ok(Message::Binary(data)) => {
            if data.len() > MAX_FRAME_SIZE {
                warn!(
                    "Frame from {} exceeds max size ({} > {}), dropping",
                    peer,
                    data.len(),
                    MAX_FRAME_SIZE
                );
                return None;
            }
            Some(Ok(Payload::Binary(Vec::from(data))))
        }
        Ok(Message::Text(text)) => Some(Ok(Payload::Text(text.to_string()))),
        Ok(_) => None,
        Err(e) => {
            error!("WebSocket error on channel to {}: {}", peer, e);
            Some(Err(TransportError::ReceiveFailed(e.to_string())))
        }
    }
}

fn kind(msg: &Message) -> &'static str {
    match msg {
        Message::Text(_) => "text frame",
        Message::Binary(_) => "binary frame",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw frame",
    }
}
