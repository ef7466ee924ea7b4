//! Relay server core: shared state, WebSocket handler, per-channel routing,
//! and the HTTP listener.
//!
//! Each accepted WebSocket is a channel. A channel starts unassigned, joins a
//! room with a `join-room` frame, and from then on every other frame it sends
//! is forwarded verbatim to the rest of its room. When the connection ends
//! for any reason the channel leaves its room and the remaining members get
//! an updated roster.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use drawroom_proto::relay::{self, MessageKind, ProtoError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::rooms::{ChannelId, OutboundSender, RoomRegistry};

/// Default maximum accepted frame size in bytes (64 KB).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default keep-alive ping period.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Body returned by the health check route.
pub const HEALTH_BODY: &str = "ok";

/// Errors that can occur while starting the relay server.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The TCP listener could not bind to the requested address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was attempted.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The bound listener did not report a local address.
    #[error("failed to read bound address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// Shared relay server state holding the room registry and channel limits.
pub struct RelayState {
    /// Room membership and fan-out.
    pub rooms: RoomRegistry,
    /// Frames larger than this many bytes are dropped.
    max_message_size: usize,
    /// Keep-alive ping period, `None` to disable.
    ping_interval: Option<Duration>,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a new relay state with an empty registry and default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_MESSAGE_SIZE, Some(DEFAULT_PING_INTERVAL))
    }

    /// Creates a new relay state with a custom frame size limit and ping period.
    #[must_use]
    pub fn with_config(max_message_size: usize, ping_interval: Option<Duration>) -> Self {
        Self {
            rooms: RoomRegistry::new(),
            max_message_size,
            ping_interval,
        }
    }
}

/// Relay-visible state of one connection, owned by its handler task.
#[derive(Debug)]
pub struct ChannelState {
    /// Connection identity used for room membership.
    pub id: ChannelId,
    /// Display name from the last `join-room`, empty before any join.
    pub display_name: String,
    /// Room the channel is currently in.
    pub current_room: Option<String>,
    sender: OutboundSender,
}

impl ChannelState {
    /// Creates an unassigned channel that delivers through `sender`.
    #[must_use]
    pub fn new(sender: OutboundSender) -> Self {
        Self {
            id: ChannelId::new(),
            display_name: String::new(),
            current_room: None,
            sender,
        }
    }
}

/// Handles an upgraded WebSocket connection for a single channel.
///
/// The connection lifecycle:
/// 1. Spawn a writer task draining the channel's outbound queue.
/// 2. Read frames one at a time and route each to completion.
/// 3. When the reader or the writer stops, leave the current room.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let mut channel = ChannelState::new(tx);

    tracing::info!(channel = %channel.id, "channel opened");

    let mut write_task = tokio::spawn(write_loop(ws_sender, rx, state.ping_interval, channel.id));

    loop {
        tokio::select! {
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        route_frame(&mut channel, text.as_str(), &state).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match std::str::from_utf8(&data) {
                            Ok(text) => route_frame(&mut channel, text, &state).await,
                            Err(_) => tracing::warn!(
                                channel = %channel.id,
                                error = %ProtoError::InvalidUtf8,
                                "dropping malformed frame"
                            ),
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!(channel = %channel.id, "received close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by the transport.
                    }
                    Some(Err(e)) => {
                        tracing::warn!(channel = %channel.id, error = %e, "read failed");
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut write_task => {
                tracing::debug!(channel = %channel.id, "writer stopped");
                break;
            }
        }
    }

    write_task.abort();
    close_channel(&mut channel, &state).await;
}

/// Runs the leave transition for a finished connection.
async fn close_channel(channel: &mut ChannelState, state: &RelayState) {
    if let Some(room_id) = channel.current_room.take() {
        state.rooms.leave_and_announce(&room_id, channel.id).await;
        tracing::info!(
            channel = %channel.id,
            room_id = %room_id,
            name = %channel.display_name,
            "channel left room"
        );
    }
    tracing::info!(channel = %channel.id, "channel closed");
}

/// Routes one inbound frame. Never fails: bad frames are logged and dropped.
pub async fn route_frame(channel: &mut ChannelState, text: &str, state: &RelayState) {
    if text.len() > state.max_message_size {
        tracing::warn!(
            channel = %channel.id,
            size = text.len(),
            max = state.max_message_size,
            "dropping oversized frame"
        );
        return;
    }

    let kind = match relay::peek_kind(text) {
        Ok(kind) => kind,
        Err(e) => {
            tracing::warn!(channel = %channel.id, error = %e, "dropping malformed frame");
            return;
        }
    };

    match &kind {
        MessageKind::JoinRoom => {
            let joined = relay::decode(text).and_then(|msg| {
                msg.join_target()
                    .map(|(room_id, name)| (room_id.to_string(), name.to_string()))
            });
            match joined {
                Ok((room_id, name)) => join_room(channel, &room_id, &name, state).await,
                Err(e) => {
                    tracing::warn!(channel = %channel.id, error = %e, "dropping malformed frame");
                }
            }
        }
        MessageKind::UserList => {
            tracing::warn!(channel = %channel.id, "ignoring user-list sent by client");
        }
        MessageKind::Other(kind) => {
            let Some(room_id) = channel.current_room.as_deref() else {
                tracing::debug!(
                    channel = %channel.id,
                    kind = %kind,
                    "dropping frame from unassigned channel"
                );
                return;
            };
            let delivered = state.rooms.broadcast(room_id, channel.id, text, false).await;
            tracing::debug!(
                channel = %channel.id,
                room_id = %room_id,
                kind = %kind,
                delivered,
                "forwarded frame"
            );
        }
    }
}

/// Moves `channel` into `room_id`, leaving any previous room first.
async fn join_room(channel: &mut ChannelState, room_id: &str, name: &str, state: &RelayState) {
    if let Some(previous) = channel.current_room.take()
        && previous != room_id
    {
        state.rooms.leave_and_announce(&previous, channel.id).await;
        tracing::info!(channel = %channel.id, room_id = %previous, "channel left room");
    }

    channel.display_name = name.to_string();
    channel.current_room = Some(room_id.to_string());

    let roster = state
        .rooms
        .join_and_announce(room_id, channel.id, name, channel.sender.clone())
        .await;
    tracing::info!(
        channel = %channel.id,
        room_id = %room_id,
        name = %name,
        members = roster.len(),
        "channel joined room"
    );
}

/// Forwards queued messages to the socket and emits keep-alive pings.
///
/// Stops on the first write failure, after sending a Close frame, or when
/// every sender of the queue is gone.
async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    ping_interval: Option<Duration>,
    channel: ChannelId,
) {
    let mut ticker = ping_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let next = match ticker.as_mut() {
            Some(ticker) => tokio::select! {
                msg = rx.recv() => msg,
                _ = ticker.tick() => Some(Message::Ping(Default::default())),
            },
            None => rx.recv().await,
        };
        let Some(msg) = next else {
            break;
        };

        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = ws_sender.send(msg).await {
            tracing::warn!(channel = %channel, error = %e, "WebSocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

/// Builds the axum router serving WebSocket upgrades and the health check.
pub fn router(state: Arc<RelayState>) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::get(root_handler))
        .route("/ws", axum::routing::get(ws_handler))
        .route("/health", axum::routing::get(health_handler))
        .with_state(state)
}

/// Starts the relay server on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by test code.
///
/// # Errors
///
/// Returns [`RelayError`] if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), RelayError> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Use [`RelayState::with_config`] to create a state with limits from the
/// resolved [`crate::config::RelayConfig`].
///
/// # Errors
///
/// Returns [`RelayError`] if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), RelayError> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let bound_addr = listener.local_addr().map_err(RelayError::LocalAddr)?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// Starts the relay server in-process for testing.
///
/// Binds to `127.0.0.1:0` (OS-assigned port) and returns the bound address,
/// the shared state, and a [`tokio::task::JoinHandle`] for cleanup.
#[cfg(test)]
pub async fn start_test_server() -> (
    std::net::SocketAddr,
    Arc<RelayState>,
    tokio::task::JoinHandle<()>,
) {
    let state = Arc::new(RelayState::new());
    let (addr, handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start test server");
    (addr, state, handle)
}

/// `GET /`: WebSocket upgrade when requested, health check otherwise.
async fn root_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(_) => HEALTH_BODY.into_response(),
    }
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// `GET /health`: fixed liveness response.
async fn health_handler() -> &'static str {
    HEALTH_BODY
}
