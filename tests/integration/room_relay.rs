// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for the room relay.
//!
//! Drives an in-process relay over real WebSocket connections and checks
//! room membership, roster broadcasts, fan-out isolation, ordering, and
//! cleanup on disconnect.
//!
//! Verification command: `cargo test --test room_relay`

use std::sync::Arc;
use std::time::Duration;

use drawroom_proto::relay::{self, MessageKind, RelayMessage};
use drawroom_relay::relay::{RelayState, start_server_with_state};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite;

// =============================================================================
// Type aliases and helpers
// =============================================================================

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Starts a relay on a random port and returns its address and shared state.
async fn start_relay() -> (std::net::SocketAddr, Arc<RelayState>) {
    start_relay_with(RelayState::new()).await
}

/// Starts a relay with a caller-built state.
async fn start_relay_with(state: RelayState) -> (std::net::SocketAddr, Arc<RelayState>) {
    let state = Arc::new(state);
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start test relay");
    (addr, state)
}

/// Opens a WebSocket connection to the relay at `path`.
async fn connect_at(addr: std::net::SocketAddr, path: &str) -> WsStream {
    let url = format!("ws://{addr}{path}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn connect(addr: std::net::SocketAddr) -> WsStream {
    connect_at(addr, "/ws").await
}

/// Sends a raw text frame.
async fn send_text(ws: &mut WsStream, text: &str) {
    ws.send(tungstenite::Message::Text(text.to_string().into()))
        .await
        .unwrap();
}

async fn send_msg(ws: &mut WsStream, msg: &RelayMessage) {
    send_text(ws, &relay::encode(msg).unwrap()).await;
}

/// Receives the next text frame, skipping control frames.
async fn recv_text(ws: &mut WsStream) -> String {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("recv timed out")
            .expect("stream ended")
            .unwrap();
        match msg {
            tungstenite::Message::Text(text) => return text.as_str().to_string(),
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => {}
            other => panic!("expected Text, got {other:?}"),
        }
    }
}

async fn recv_msg(ws: &mut WsStream) -> RelayMessage {
    relay::decode(&recv_text(ws).await).unwrap()
}

/// Receives a `user-list` frame and returns its roster sorted.
async fn recv_roster(ws: &mut WsStream) -> Vec<String> {
    let msg = recv_msg(ws).await;
    assert_eq!(msg.kind, MessageKind::UserList, "got {msg:?}");
    let mut roster = msg.roster().expect("user-list payload is not a roster");
    roster.sort();
    roster
}

/// Asserts no text frame arrives within a short window.
async fn assert_silent(ws: &mut WsStream) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(200);
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_)))) => {}
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

/// Connects and joins `room` as `name`, consuming the joiner's own roster.
async fn join(addr: std::net::SocketAddr, room: &str, name: &str) -> WsStream {
    let mut ws = connect(addr).await;
    send_msg(&mut ws, &RelayMessage::join(room, name)).await;
    let roster = recv_roster(&mut ws).await;
    assert!(roster.contains(&name.to_string()), "roster {roster:?}");
    ws
}

/// Polls `check` until it holds or a timeout expires.
async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

// =============================================================================
// Tests
// =============================================================================

/// The walkthrough: two members, a drawing op, and a disconnect.
#[tokio::test]
async fn alice_and_bob_draw_together() {
    let (addr, state) = start_relay().await;

    let mut x = connect(addr).await;
    send_msg(&mut x, &RelayMessage::join("r1", "Alice")).await;
    assert_eq!(recv_roster(&mut x).await, names(&["Alice"]));

    let mut y = connect(addr).await;
    send_msg(&mut y, &RelayMessage::join("r1", "Bob")).await;
    assert_eq!(recv_roster(&mut x).await, names(&["Alice", "Bob"]));
    assert_eq!(recv_roster(&mut y).await, names(&["Alice", "Bob"]));

    let draw = r#"{"type":"draw","roomId":"r1","payload":{"x":1,"y":2}}"#;
    send_text(&mut x, draw).await;
    assert_eq!(recv_text(&mut y).await, draw);
    assert_silent(&mut x).await;

    y.close(None).await.unwrap();
    assert_eq!(recv_roster(&mut x).await, names(&["Alice"]));
    assert_eq!(state.rooms.member_count("r1").await, 1);

    send_text(&mut x, draw).await;
    assert_silent(&mut x).await;
}

#[tokio::test]
async fn upgrade_is_accepted_on_root_path() {
    let (addr, _state) = start_relay().await;
    let mut ws = connect_at(addr, "/").await;
    send_msg(&mut ws, &RelayMessage::join("root", "Ann")).await;
    assert_eq!(recv_roster(&mut ws).await, names(&["Ann"]));
}

#[tokio::test]
async fn every_member_gets_exactly_one_roster_per_join() {
    let (addr, _state) = start_relay().await;

    let mut a = join(addr, "r1", "Alice").await;
    let mut b = join(addr, "r1", "Bob").await;
    assert_eq!(recv_roster(&mut a).await, names(&["Alice", "Bob"]));

    let mut c = connect(addr).await;
    send_msg(&mut c, &RelayMessage::join("r1", "Carol")).await;
    let all = names(&["Alice", "Bob", "Carol"]);
    for ws in [&mut a, &mut b, &mut c] {
        assert_eq!(recv_roster(ws).await, all);
    }
    for ws in [&mut a, &mut b, &mut c] {
        assert_silent(ws).await;
    }
}

#[tokio::test]
async fn broadcast_stays_inside_the_room() {
    let (addr, _state) = start_relay().await;

    let mut a = join(addr, "r1", "Alice").await;
    let mut b = join(addr, "r1", "Bob").await;
    recv_roster(&mut a).await;
    let mut c = join(addr, "r2", "Carol").await;

    let stroke = RelayMessage::custom("stroke", "r1", json!({"points": [[0, 0], [4, 4]]}));
    send_msg(&mut a, &stroke).await;

    assert_eq!(recv_msg(&mut b).await, stroke);
    assert_silent(&mut a).await;
    assert_silent(&mut c).await;
}

#[tokio::test]
async fn frames_before_join_are_dropped() {
    let (addr, _state) = start_relay().await;

    let mut a = join(addr, "r1", "Alice").await;
    let mut lurker = connect(addr).await;

    send_text(&mut lurker, r#"{"type":"draw","roomId":"r1","payload":{}}"#).await;
    assert_silent(&mut a).await;
    assert_silent(&mut lurker).await;
}

#[tokio::test]
async fn malformed_frame_keeps_channel_open() {
    let (addr, _state) = start_relay().await;

    let mut a = connect(addr).await;
    send_text(&mut a, "{this is not json").await;
    send_text(&mut a, r#"{"type":"join-room","name":"NoRoom"}"#).await;
    send_msg(&mut a, &RelayMessage::join("r1", "Alice")).await;
    assert_eq!(recv_roster(&mut a).await, names(&["Alice"]));

    let mut b = join(addr, "r1", "Bob").await;
    recv_roster(&mut a).await;
    send_text(&mut a, "]]]").await;
    send_text(&mut a, r#"{"type":"clear","roomId":"r1"}"#).await;
    assert_eq!(recv_msg(&mut b).await.kind.as_str(), "clear");
}

#[tokio::test]
async fn binary_frames_are_routed_like_text() {
    let (addr, _state) = start_relay().await;

    let mut a = join(addr, "r1", "Alice").await;
    let mut b = join(addr, "r1", "Bob").await;
    recv_roster(&mut a).await;

    let frame = br#"{"type":"undo","roomId":"r1"}"#.to_vec();
    a.send(tungstenite::Message::Binary(frame.into()))
        .await
        .unwrap();
    assert_eq!(recv_msg(&mut b).await.kind.as_str(), "undo");
}

#[tokio::test]
async fn application_fields_are_not_type_checked() {
    let (addr, _state) = start_relay().await;

    let mut a = join(addr, "r1", "Alice").await;
    let mut b = join(addr, "r1", "Bob").await;
    recv_roster(&mut a).await;

    for frame in [
        r#"{"type":"rename-layer","roomId":"r1","name":3,"payload":{}}"#,
        r#"{"type":"draw","roomId":7,"payload":{}}"#,
        r#"{"type":"draw","roomId":"OTHER","payload":{"x":0}}"#,
    ] {
        send_text(&mut a, frame).await;
        assert_eq!(recv_text(&mut b).await, frame);
    }
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn keep_alive_pings_are_sent() {
    let (addr, _state) =
        start_relay_with(RelayState::with_config(64 * 1024, Some(Duration::from_millis(50)))).await;
    let mut ws = connect(addr).await;

    let ping = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Ping(_))) => return true,
                Some(Ok(_)) => {}
                _ => return false,
            }
        }
    })
    .await
    .expect("no ping within timeout");
    assert!(ping, "connection ended before a ping arrived");
}

#[tokio::test]
async fn no_pings_when_keep_alive_is_disabled() {
    let (addr, _state) = start_relay_with(RelayState::with_config(64 * 1024, None)).await;
    let mut ws = connect(addr).await;

    let next = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(next.is_err(), "expected no frames, got {next:?}");
}

#[tokio::test]
async fn client_cannot_forge_user_list() {
    let (addr, _state) = start_relay().await;

    let mut a = join(addr, "r1", "Alice").await;
    let mut b = join(addr, "r1", "Bob").await;
    recv_roster(&mut a).await;

    send_msg(&mut a, &RelayMessage::user_list("r1", &names(&["Mallory"]))).await;
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let (addr, _state) = start_relay().await;

    let mut a = join(addr, "r1", "Alice").await;
    let mut b = join(addr, "r1", "Bob").await;
    recv_roster(&mut a).await;

    for seq in 0..50 {
        send_msg(&mut a, &RelayMessage::custom("draw", "r1", json!({ "seq": seq }))).await;
    }
    for seq in 0..50 {
        let msg = recv_msg(&mut b).await;
        assert_eq!(msg.payload, Some(json!({ "seq": seq })));
    }
}

#[tokio::test]
async fn abrupt_disconnect_cleans_up_room() {
    let (addr, state) = start_relay().await;

    let a = join(addr, "solo", "Alice").await;
    assert!(state.rooms.contains("solo").await);

    drop(a);
    wait_until(|| {
        let state = Arc::clone(&state);
        async move { !state.rooms.contains("solo").await }
    })
    .await;

    let mut b = join(addr, "solo", "Bob").await;
    assert_eq!(state.rooms.members("solo").await, names(&["Bob"]));
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn switching_rooms_updates_both_rosters() {
    let (addr, state) = start_relay().await;

    let mut a = join(addr, "r1", "Alice").await;
    let mut b = join(addr, "r1", "Bob").await;
    recv_roster(&mut a).await;

    send_msg(&mut a, &RelayMessage::join("r2", "Alice")).await;
    assert_eq!(recv_roster(&mut b).await, names(&["Bob"]));
    assert_eq!(recv_roster(&mut a).await, names(&["Alice"]));
    assert_eq!(state.rooms.room_count().await, 2);

    send_msg(&mut b, &RelayMessage::custom("draw", "r1", json!(null))).await;
    assert_silent(&mut a).await;
}
