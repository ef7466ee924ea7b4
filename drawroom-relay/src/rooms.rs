//! Room registry for the relay server.
//!
//! Maps room identifiers to their live member channels. Rooms are created
//! implicitly by the first join and removed the moment their last member
//! leaves, so the registry never holds an empty room.
//!
//! Room entries are ephemeral — lost on relay restart. Delivery to a member
//! means pushing onto that member's outbound queue; a member whose queue is
//! closed is skipped and evicted on the spot.

use std::collections::HashMap;

use axum::extract::ws::{Message, Utf8Bytes};
use drawroom_proto::relay::{self, RelayMessage};
use tokio::sync::{RwLock, mpsc};

/// Sender half of a channel's outbound message queue.
pub type OutboundSender = mpsc::UnboundedSender<Message>;

/// Opaque identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(uuid::Uuid);

impl ChannelId {
    /// Allocates a fresh, time-ordered channel identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// A channel's membership record inside one room.
#[derive(Debug)]
struct Member {
    channel: ChannelId,
    display_name: String,
    sender: OutboundSender,
}

/// Members of a single room in join order.
#[derive(Debug, Default)]
struct Room {
    members: Vec<Member>,
}

impl Room {
    fn roster(&self) -> Vec<String> {
        self.members.iter().map(|m| m.display_name.clone()).collect()
    }

    /// Pushes `text` to every member except `skip`, evicting members whose
    /// queue is closed. Returns `(delivered, evicted)`.
    fn deliver(&mut self, skip: Option<ChannelId>, text: &Utf8Bytes) -> (usize, usize) {
        let mut delivered = 0;
        let before = self.members.len();
        self.members.retain(|member| {
            if Some(member.channel) == skip {
                return true;
            }
            if member.sender.send(Message::Text(text.clone())).is_ok() {
                delivered += 1;
                true
            } else {
                tracing::debug!(channel = %member.channel, "evicting closed channel");
                false
            }
        });
        (delivered, before - self.members.len())
    }
}

/// In-memory mapping from room identifier to member channels.
///
/// Thread-safe via [`RwLock`]. Every operation that touches membership or
/// fans out a message holds the write lock for its whole duration, so a
/// roster broadcast always matches the membership it was computed from.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    /// Creates a new, empty room registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Adds `channel` to `room_id`, creating the room if needed.
    ///
    /// Joining a room the channel is already in only refreshes its display
    /// name and sender. Returns `true` if the room was created by this call.
    pub async fn join(
        &self,
        room_id: &str,
        channel: ChannelId,
        display_name: &str,
        sender: OutboundSender,
    ) -> bool {
        let mut rooms = self.rooms.write().await;
        insert_member(&mut rooms, room_id, channel, display_name, sender)
    }

    /// Joins `channel` to `room_id` and sends the resulting roster to every
    /// member, the joiner included.
    ///
    /// Returns the roster that was broadcast.
    pub async fn join_and_announce(
        &self,
        room_id: &str,
        channel: ChannelId,
        display_name: &str,
        sender: OutboundSender,
    ) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        insert_member(&mut rooms, room_id, channel, display_name, sender);
        announce_roster(&mut rooms, room_id)
    }

    /// Removes `channel` from `room_id`, deleting the room once it is empty.
    ///
    /// Returns `true` if the channel was a member. Unknown rooms and
    /// non-members are a no-op.
    pub async fn leave(&self, room_id: &str, channel: ChannelId) -> bool {
        let mut rooms = self.rooms.write().await;
        remove_member(&mut rooms, room_id, channel)
    }

    /// Removes `channel` from `room_id` and, if the room survives, sends the
    /// updated roster to the remaining members.
    ///
    /// Returns `true` if the channel was a member.
    pub async fn leave_and_announce(&self, room_id: &str, channel: ChannelId) -> bool {
        let mut rooms = self.rooms.write().await;
        let removed = remove_member(&mut rooms, room_id, channel);
        if removed && rooms.contains_key(room_id) {
            announce_roster(&mut rooms, room_id);
        }
        removed
    }

    /// Sends `text` to the members of `room_id`.
    ///
    /// The sender is skipped unless `include_sender` is set. Closed members
    /// are skipped and evicted; if that changes the membership the survivors
    /// receive a fresh roster. Returns the number of members the message was
    /// queued for. Unknown rooms deliver to nobody.
    pub async fn broadcast(
        &self,
        room_id: &str,
        sender: ChannelId,
        text: &str,
        include_sender: bool,
    ) -> usize {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return 0;
        };
        let skip = (!include_sender).then_some(sender);
        let (delivered, evicted) = room.deliver(skip, &Utf8Bytes::from(text));
        if evicted > 0 {
            reap(&mut rooms, room_id);
        }
        delivered
    }

    /// Returns the display names of `room_id`'s members in join order.
    pub async fn members(&self, room_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map(Room::roster).unwrap_or_default()
    }

    /// Returns `true` if `room_id` currently has members.
    pub async fn contains(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Number of members in `room_id` (0 for unknown rooms).
    pub async fn member_count(&self, room_id: &str) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).map_or(0, |room| room.members.len())
    }

    /// Queue a WebSocket Close frame for every member of every room.
    ///
    /// Each member's writer task forwards the frame and then stops, which
    /// ends the connection and runs its normal leave path.
    pub async fn close_all(&self) {
        let rooms = self.rooms.read().await;
        for (room_id, room) in rooms.iter() {
            tracing::info!(room_id = %room_id, members = room.members.len(), "closing room");
            for member in &room.members {
                let _ = member.sender.send(Message::Close(None));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lock-held helpers
// ---------------------------------------------------------------------------

fn insert_member(
    rooms: &mut HashMap<String, Room>,
    room_id: &str,
    channel: ChannelId,
    display_name: &str,
    sender: OutboundSender,
) -> bool {
    let created = !rooms.contains_key(room_id);
    let room = rooms.entry(room_id.to_string()).or_default();
    if created {
        tracing::info!(room_id = %room_id, "room created");
    }

    if let Some(existing) = room.members.iter_mut().find(|m| m.channel == channel) {
        existing.display_name = display_name.to_string();
        existing.sender = sender;
    } else {
        room.members.push(Member {
            channel,
            display_name: display_name.to_string(),
            sender,
        });
    }
    created
}

fn remove_member(rooms: &mut HashMap<String, Room>, room_id: &str, channel: ChannelId) -> bool {
    let Some(room) = rooms.get_mut(room_id) else {
        return false;
    };
    let before = room.members.len();
    room.members.retain(|m| m.channel != channel);
    let removed = room.members.len() != before;

    if room.members.is_empty() {
        rooms.remove(room_id);
        tracing::info!(room_id = %room_id, "room deleted");
    }
    removed
}

/// Sends the current roster of `room_id` to all of its members and returns it.
fn announce_roster(rooms: &mut HashMap<String, Room>, room_id: &str) -> Vec<String> {
    let Some(room) = rooms.get_mut(room_id) else {
        return Vec::new();
    };
    let roster = room.roster();
    match relay::encode(&RelayMessage::user_list(room_id, &roster)) {
        Ok(text) => {
            let (_, evicted) = room.deliver(None, &Utf8Bytes::from(text));
            if evicted > 0 {
                reap(rooms, room_id);
            }
        }
        Err(e) => {
            tracing::error!(room_id = %room_id, error = %e, "failed to encode roster");
        }
    }
    roster
}

/// Settles a room after evictions: deletes it if empty, otherwise re-sends
/// the roster until a delivery pass evicts nobody.
fn reap(rooms: &mut HashMap<String, Room>, room_id: &str) {
    loop {
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        if room.members.is_empty() {
            rooms.remove(room_id);
            tracing::info!(room_id = %room_id, "room deleted");
            return;
        }
        let text = match relay::encode(&RelayMessage::user_list(room_id, &room.roster())) {
            Ok(text) => Utf8Bytes::from(text),
            Err(e) => {
                tracing::error!(room_id = %room_id, error = %e, "failed to encode roster");
                return;
            }
        };
        let (_, evicted) = room.deliver(None, &text);
        if evicted == 0 {
            return;
        }
    }
}
