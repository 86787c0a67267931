//! End-to-end tests for the rendezvous server.
//!
//! Real WebSocket clients against a server bound to a random local port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mesh_core::protocol::{ClientMessage, PeerEntry, ServerMessage};
use mesh_core::PeerId;
use rendezvous::auth::{StaticTokenVerifier, TokenVerifier, UserInfoVerifier};
use rendezvous::{RendezvousServer, RoomTable};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn id(s: &str) -> PeerId {
    s.parse().unwrap()
}

/// Start a server on a random port.
async fn start(verifier: Option<Arc<dyn TokenVerifier>>) -> (SocketAddr, RoomTable) {
    let rooms = RoomTable::new();
    let server = Arc::new(RendezvousServer::with_rooms(rooms.clone(), verifier));
    let listener = RendezvousServer::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    (addr, rooms)
}

fn keys(key: &str) -> Option<Arc<dyn TokenVerifier>> {
    Some(Arc::new(StaticTokenVerifier::new([(
        key.to_string(),
        "test".to_string(),
    )])))
}

async fn connect(addr: SocketAddr, target: &str) -> Ws {
    let url = format!("ws://{}{}", addr, target);
    let (ws, _) = connect_async(&url).await.expect("Failed to connect");
    ws
}

/// Receive the next server message.
async fn recv(ws: &mut Ws) -> ServerMessage {
    let next = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text.to_string(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("Expected text frame, got {:?}", other),
            }
        }
    })
    .await
    .expect("Timeout waiting for message");
    ServerMessage::from_json(&next).expect("Unparseable server message")
}

/// Expect the server to close the connection with 1008 and `reason`.
async fn expect_rejected(ws: &mut Ws, reason: &str) {
    let frame = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("Expected close frame, got {:?}", other),
            }
        }
    })
    .await
    .expect("Timeout waiting for close")
    .expect("Close frame should carry a reason");
    assert_eq!(frame.code, CloseCode::Policy);
    assert_eq!(u16::from(frame.code), 1008);
    assert_eq!(frame.reason, reason);
}

async fn wait_rooms(rooms: &RoomTable, count: usize) {
    timeout(WAIT, async {
        while rooms.room_count() != count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Expected {count} rooms, have {}", rooms.room_count()));
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
async fn test_join_announce_leave() {
    let (addr, rooms) = start(None).await;

    let mut a = connect(addr, "/room/r1?userId=A").await;
    assert_eq!(recv(&mut a).await, ServerMessage::Joined { peers: vec![] });

    let mut b = connect(addr, "/room/r1?userId=B").await;
    assert_eq!(
        recv(&mut b).await,
        ServerMessage::Joined {
            peers: vec![PeerEntry::new(id("A"), None)]
        }
    );
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::PeerJoined {
            user_id: id("B"),
            address: None
        }
    );
    assert_eq!(rooms.members("r1"), vec![id("A"), id("B")]);

    b.close(None).await.unwrap();
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::PeerLeft { user_id: id("B") }
    );

    a.close(None).await.unwrap();
    wait_rooms(&rooms, 0).await;
}

#[tokio::test]
async fn test_abrupt_disconnect_announced() {
    let (addr, _rooms) = start(None).await;
    let mut a = connect(addr, "/room/r1?userId=A").await;
    recv(&mut a).await;
    let mut b = connect(addr, "/room/r1?userId=B").await;
    recv(&mut b).await;
    recv(&mut a).await;

    drop(b);
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::PeerLeft { user_id: id("B") }
    );
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (addr, rooms) = start(None).await;
    let mut a = connect(addr, "/room/r1?userId=A").await;
    recv(&mut a).await;
    let mut b = connect(addr, "/room/r2?userId=B").await;
    assert_eq!(recv(&mut b).await, ServerMessage::Joined { peers: vec![] });
    assert_eq!(rooms.room_count(), 2);

    a.send(Message::Text(ClientMessage::Ping.to_json().into()))
        .await
        .unwrap();
    // The next thing A sees is its own pong, not news about r2.
    assert_eq!(recv(&mut a).await, ServerMessage::Pong);
}

#[tokio::test]
async fn test_address_is_announced() {
    let (addr, _rooms) = start(None).await;
    let mut a = connect(addr, "/room/r1?userId=A&addr=ws%3A%2F%2F127.0.0.1%3A7001").await;
    recv(&mut a).await;
    let mut b = connect(addr, "/room/r1?userId=B&addr=ws%3A%2F%2F127.0.0.1%3A7002").await;
    assert_eq!(
        recv(&mut b).await,
        ServerMessage::Joined {
            peers: vec![PeerEntry::new(id("A"), Some("ws://127.0.0.1:7001".into()))]
        }
    );
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::PeerJoined {
            user_id: id("B"),
            address: Some("ws://127.0.0.1:7002".into())
        }
    );
}

#[tokio::test]
async fn test_malformed_messages_ignored() {
    let (addr, _rooms) = start(None).await;
    let mut a = connect(addr, "/room/r1?userId=A").await;
    recv(&mut a).await;

    a.send(Message::Text("{\"type\":\"dance\"}".into())).await.unwrap();
    a.send(Message::Text("not json".into())).await.unwrap();
    a.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    a.send(Message::Text(ClientMessage::Ping.to_json().into()))
        .await
        .unwrap();
    assert_eq!(recv(&mut a).await, ServerMessage::Pong);
}

// ============================================================================
// Rejections
// ============================================================================

#[tokio::test]
async fn test_invalid_room_rejected() {
    let (addr, rooms) = start(None).await;
    let mut ws = connect(addr, "/lobby?userId=A").await;
    expect_rejected(&mut ws, "Invalid room").await;
    let mut ws = connect(addr, "/room/a/b?userId=A").await;
    expect_rejected(&mut ws, "Invalid room").await;
    assert_eq!(rooms.room_count(), 0);
}

#[tokio::test]
async fn test_missing_and_invalid_user_id_rejected() {
    let (addr, _rooms) = start(None).await;
    let mut ws = connect(addr, "/room/r1").await;
    expect_rejected(&mut ws, "Missing userId").await;
    let mut ws = connect(addr, "/room/r1?userId=a%2Fb").await;
    expect_rejected(&mut ws, "Invalid userId").await;
}

#[tokio::test]
async fn test_token_checks() {
    let (addr, rooms) = start(keys("s3cret")).await;

    let mut ws = connect(addr, "/room/r1?userId=A").await;
    expect_rejected(&mut ws, "Missing token").await;

    let mut ws = connect(addr, "/room/r1?userId=A&token=wrong").await;
    expect_rejected(&mut ws, "Invalid token").await;
    assert_eq!(rooms.room_count(), 0);

    let mut ok = connect(addr, "/room/r1?userId=A&token=s3cret").await;
    assert_eq!(recv(&mut ok).await, ServerMessage::Joined { peers: vec![] });
    assert_eq!(rooms.members("r1"), vec![id("A")]);
}

#[tokio::test]
async fn test_unreachable_identity_provider_means_invalid_token() {
    let verifier: Arc<dyn TokenVerifier> = Arc::new(
        UserInfoVerifier::new("http://127.0.0.1:9/userinfo", Duration::from_secs(2)).unwrap(),
    );
    let (addr, rooms) = start(Some(verifier)).await;
    let mut ws = connect(addr, "/room/r1?userId=A&token=whatever").await;
    expect_rejected(&mut ws, "Invalid token").await;
    assert_eq!(rooms.room_count(), 0);
}

#[tokio::test]
async fn test_rejected_client_does_not_disturb_room() {
    let (addr, _rooms) = start(keys("k")).await;
    let mut a = connect(addr, "/room/r1?userId=A&token=k").await;
    recv(&mut a).await;

    let mut intruder = connect(addr, "/room/r1?userId=B&token=nope").await;
    expect_rejected(&mut intruder, "Invalid token").await;

    a.send(Message::Text(ClientMessage::Ping.to_json().into()))
        .await
        .unwrap();
    assert_eq!(recv(&mut a).await, ServerMessage::Pong);
}
