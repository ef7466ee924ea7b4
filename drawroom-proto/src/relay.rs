//! Relay wire protocol types for the drawroom relay server.
//!
//! Every frame exchanged between a browser client and the relay is a single
//! JSON object tagged by its `type` field. The relay only interprets the
//! `join-room` kind; every other kind is routed by the sender's current room
//! and forwarded without inspecting the payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence;

/// Wire tag of the join message.
pub const JOIN_ROOM: &str = "join-room";

/// Wire tag of the roster broadcast.
pub const USER_LIST: &str = "user-list";

/// Error type for relay protocol encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The frame is not a JSON object matching the relay schema.
    #[error("relay decode error: {0}")]
    Decode(#[source] serde_json::Error),
    /// The message could not be serialized.
    #[error("relay encode error: {0}")]
    Encode(#[source] serde_json::Error),
    /// A binary frame did not contain UTF-8 text.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    /// A `join-room` message arrived without a usable room identifier.
    #[error("join-room requires a non-empty roomId")]
    MissingRoomId,
}

/// The `type` tag of a relay message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Client asks to join a room (`join-room`).
    JoinRoom,
    /// Server announces the room roster (`user-list`).
    UserList,
    /// Any application-defined kind, opaque to the relay.
    Other(String),
}

impl MessageKind {
    /// Returns the wire tag for this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::JoinRoom => JOIN_ROOM,
            Self::UserList => USER_LIST,
            Self::Other(kind) => kind,
        }
    }
}

impl From<String> for MessageKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            JOIN_ROOM => Self::JoinRoom,
            USER_LIST => Self::UserList,
            _ => Self::Other(tag),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single relay frame.
///
/// Fields other than `type` are optional on the wire. Unknown fields are
/// ignored when decoding; the relay forwards the original frame text, so
/// they still reach other room members untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    /// Message kind (`type` on the wire).
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Target room identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Opaque application data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Display name, only meaningful on `join-room`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RelayMessage {
    /// Builds a `join-room` request.
    #[must_use]
    pub fn join(room_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::JoinRoom,
            room_id: Some(room_id.into()),
            payload: None,
            name: Some(name.into()),
        }
    }

    /// Builds a `user-list` roster broadcast for `room_id`.
    #[must_use]
    pub fn user_list(room_id: impl Into<String>, names: &[String]) -> Self {
        Self {
            kind: MessageKind::UserList,
            room_id: Some(room_id.into()),
            payload: Some(presence::roster_payload(names)),
            name: None,
        }
    }

    /// Builds an application message of an arbitrary kind.
    #[must_use]
    pub fn custom(kind: impl Into<String>, room_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MessageKind::from(kind.into()),
            room_id: Some(room_id.into()),
            payload: Some(payload),
            name: None,
        }
    }

    /// Returns the room and display name a `join-room` message asks for.
    ///
    /// A missing `name` is treated as an empty display name.
    ///
    /// # Errors
    ///
    /// Returns [`ProtoError::MissingRoomId`] if `roomId` is absent or empty.
    pub fn join_target(&self) -> Result<(&str, &str), ProtoError> {
        match self.room_id.as_deref() {
            Some(room_id) if !room_id.is_empty() => {
                Ok((room_id, self.name.as_deref().unwrap_or_default()))
            }
            _ => Err(ProtoError::MissingRoomId),
        }
    }

    /// Returns the display names carried by a `user-list` message.
    ///
    /// Returns `None` for any other kind or a payload that is not an array
    /// of strings.
    #[must_use]
    pub fn roster(&self) -> Option<Vec<String>> {
        if self.kind != MessageKind::UserList {
            return None;
        }
        self.payload.as_ref().and_then(presence::parse_roster)
    }
}

/// Encodes a [`RelayMessage`] as a JSON text frame.
///
/// # Errors
///
/// Returns [`ProtoError::Encode`] if serialization fails.
pub fn encode(msg: &RelayMessage) -> Result<String, ProtoError> {
    serde_json::to_string(msg).map_err(ProtoError::Encode)
}

/// Decodes a [`RelayMessage`] from a JSON text frame.
///
/// # Errors
///
/// Returns [`ProtoError::Decode`] if the text is not a JSON object with a
/// string `type` field and well-typed optional fields.
pub fn decode(text: &str) -> Result<RelayMessage, ProtoError> {
    serde_json::from_str(text).map_err(ProtoError::Decode)
}

/// Only the `type` tag of a frame; every other field is left unparsed.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: MessageKind,
}

/// Reads the `type` tag of a JSON text frame without checking any other
/// field, so application frames of any shape can be routed.
///
/// # Errors
///
/// Returns [`ProtoError::Decode`] if the text is not a JSON object with a
/// string `type` field.
pub fn peek_kind(text: &str) -> Result<MessageKind, ProtoError> {
    serde_json::from_str::<Envelope>(text)
        .map(|envelope| envelope.kind)
        .map_err(ProtoError::Decode)
}

/// Decodes a [`RelayMessage`] from a binary frame holding UTF-8 JSON.
///
/// # Errors
///
/// Returns [`ProtoError::InvalidUtf8`] for non-UTF-8 input, otherwise the
/// same errors as [`decode`].
pub fn decode_bytes(bytes: &[u8]) -> Result<RelayMessage, ProtoError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtoError::InvalidUtf8)?;
    decode(text)
}
