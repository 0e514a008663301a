//! Wire-compatible types for the chat service.
//!
//! HTTP bodies and channel frames are JSON with camelCase field names.
//! Timestamps are ISO 8601 strings on the wire and [`DateTime<Utc>`] here.
//!
//! Inbound channel frames share one envelope shape,
//! `{ "type": ..., "data": ..., "message"?: ... }`, which is decoded into the
//! tagged [`ServerEvent`] enum. Unknown `type` values decode to
//! [`ServerEvent::Unknown`] instead of failing.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

// ── Type aliases ────────────────────────────────────────────────────

/// Unique identifier for rooms.
pub type RoomId = String;

/// Numeric identifier for users.
pub type UserId = i64;

/// Prefix of the placeholder id given to locally-authored, unconfirmed messages.
pub const LOCAL_ID_PREFIX: &str = "temp-";

/// Wire value of [`SenderId::Local`].
const LOCAL_SENDER_TAG: &str = "me";

/// Everything except RFC 3986 unreserved characters.
const COMPONENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode a room id or token for use as a URL path segment or query value.
pub(crate) fn encode_component(value: &str) -> Cow<'_, str> {
    utf8_percent_encode(value, COMPONENT_ENCODE_SET).into()
}

// ── Identity ────────────────────────────────────────────────────────

/// The authenticated user. Owned by the auth flow; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub email: String,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

/// Body of `GET /auth/profile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub user: Identity,
}

// ── Messages ────────────────────────────────────────────────────────

/// Who authored a message.
///
/// On the wire a confirmed sender is a number and a local, unresolved sender
/// is the string `"me"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSenderId", into = "RawSenderId")]
pub enum SenderId {
    /// A confirmed user id.
    User(UserId),
    /// Authored on this client and not yet matched to a real id.
    Local,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSenderId {
    Id(UserId),
    Tag(String),
}

impl TryFrom<RawSenderId> for SenderId {
    type Error = String;

    fn try_from(raw: RawSenderId) -> Result<Self, Self::Error> {
        match raw {
            RawSenderId::Id(id) => Ok(Self::User(id)),
            RawSenderId::Tag(tag) if tag == LOCAL_SENDER_TAG => Ok(Self::Local),
            RawSenderId::Tag(tag) => Err(format!("unknown sender tag {tag:?}")),
        }
    }
}

impl From<SenderId> for RawSenderId {
    fn from(sender: SenderId) -> Self {
        match sender {
            SenderId::User(id) => Self::Id(id),
            SenderId::Local => Self::Tag(LOCAL_SENDER_TAG.to_string()),
        }
    }
}

/// A chat message, confirmed by the server or optimistic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: RoomId,
    pub sender_id: SenderId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build an optimistic message authored on this client, stamped now.
    pub fn optimistic(room_id: impl Into<RoomId>, content: impl Into<String>) -> Self {
        Self {
            id: format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4()),
            room_id: room_id.into(),
            sender_id: SenderId::Local,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Returns `true` if this entry has not been confirmed by the server.
    pub fn is_optimistic(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX) || self.sender_id == SenderId::Local
    }
}

// ── Rooms ───────────────────────────────────────────────────────────

/// A two-party room with its recently known messages (not the full history).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Room {
    /// Timestamp (ms since epoch) of the tail message, or 0 for an empty room.
    pub fn latest_activity(&self) -> i64 {
        self.messages
            .last()
            .map_or(0, |message| message.created_at.timestamp_millis())
    }
}

/// Body of `GET /msg/room`: the visible rooms plus a fresh realtime token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomList {
    pub rooms: Vec<Room>,
    pub token: String,
}

/// Body of `POST /msg/room`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub other_user_id: UserId,
}

// ── Channel frames ──────────────────────────────────────────────────

/// Payload of a `ROOM_UPDATE` lobby event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdate {
    pub room_id: RoomId,
    pub last_message: Message,
}

/// Frame sent on the room channel to post a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
}

const NEW_MESSAGE: &str = "NEW_MESSAGE";
const ERROR: &str = "ERROR";
const MESSAGE_SENT: &str = "MESSAGE_SENT";
const ROOM_UPDATE: &str = "ROOM_UPDATE";

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    message: Option<String>,
}

/// Event received on either realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A message was posted in the room this channel is scoped to.
    NewMessage(Message),
    /// The server reported a problem; the channel stays open.
    Error { message: String },
    /// The server acknowledged a send. Carries no correlation id.
    MessageSent(serde_json::Value),
    /// A message arrived in some room (lobby channel).
    RoomUpdate(RoomUpdate),
    /// An event type this client does not know about.
    Unknown { kind: String },
}

impl ServerEvent {
    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the frame is not an envelope or a
    /// known event's payload has the wrong shape.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let event = match envelope.kind.as_str() {
            NEW_MESSAGE => Self::NewMessage(serde_json::from_value(envelope.data)?),
            ROOM_UPDATE => Self::RoomUpdate(serde_json::from_value(envelope.data)?),
            MESSAGE_SENT => Self::MessageSent(envelope.data),
            ERROR => {
                let message = envelope
                    .message
                    .or_else(|| {
                        envelope
                            .data
                            .get("message")
                            .and_then(serde_json::Value::as_str)
                            .map(str::to_owned)
                    })
                    .unwrap_or_default();
                Self::Error { message }
            }
            _ => Self::Unknown {
                kind: envelope.kind,
            },
        };
        Ok(event)
    }

    /// Wire name of this event's `type` field.
    pub fn kind(&self) -> &str {
        match self {
            Self::NewMessage(_) => NEW_MESSAGE,
            Self::Error { .. } => ERROR,
            Self::MessageSent(_) => MESSAGE_SENT,
            Self::RoomUpdate(_) => ROOM_UPDATE,
            Self::Unknown { kind } => kind,
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sender_id_accepts_number_and_local_tag() {
        let user: SenderId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(user, SenderId::User(7));
        let local: SenderId = serde_json::from_value(json!("me")).unwrap();
        assert_eq!(local, SenderId::Local);
        assert!(serde_json::from_value::<SenderId>(json!("someone")).is_err());
        assert_eq!(serde_json::to_value(SenderId::Local).unwrap(), json!("me"));
    }

    #[test]
    fn room_without_messages_field_is_empty() {
        let room: Room = serde_json::from_value(json!({
            "id": "r1", "user1Id": 1, "user2Id": 2
        }))
        .unwrap();
        assert!(room.messages.is_empty());
        assert_eq!(room.latest_activity(), 0);
    }

    #[test]
    fn optimistic_message_is_tagged() {
        let msg = Message::optimistic("r1", "hello");
        assert!(msg.id.starts_with(LOCAL_ID_PREFIX));
        assert_eq!(msg.sender_id, SenderId::Local);
        assert!(msg.is_optimistic());
        assert_ne!(msg.id, Message::optimistic("r1", "hello").id);
    }

    #[test]
    fn parse_room_update() {
        let text = json!({
            "type": "ROOM_UPDATE",
            "data": {
                "roomId": "r1",
                "lastMessage": {
                    "id": "m2", "roomId": "r1", "senderId": 2,
                    "content": "yo", "createdAt": "2026-01-01T00:00:01Z"
                }
            }
        })
        .to_string();
        let ServerEvent::RoomUpdate(update) = ServerEvent::parse(&text).unwrap() else {
            panic!("expected RoomUpdate");
        };
        assert_eq!(update.room_id, "r1");
        assert_eq!(update.last_message.content, "yo");
    }

    #[test]
    fn parse_error_reads_top_level_message() {
        let text = r#"{"type":"ERROR","data":null,"message":"rate limited"}"#;
        assert_eq!(
            ServerEvent::parse(text).unwrap(),
            ServerEvent::Error {
                message: "rate limited".into()
            }
        );
    }

    #[test]
    fn parse_unknown_type_is_not_an_error() {
        let event = ServerEvent::parse(r#"{"type":"TYPING","data":{"who":1}}"#).unwrap();
        assert_eq!(event.kind(), "TYPING");
        assert!(matches!(event, ServerEvent::Unknown { .. }));
    }

    #[test]
    fn parse_rejects_malformed_payloads() {
        assert!(ServerEvent::parse("not json").is_err());
        assert!(ServerEvent::parse(r#"{"data":{}}"#).is_err());
        assert!(ServerEvent::parse(r#"{"type":"NEW_MESSAGE","data":{"id":1}}"#).is_err());
    }

    #[test]
    fn outbound_message_has_only_content() {
        let frame = serde_json::to_value(OutboundMessage {
            content: "hi".into(),
        })
        .unwrap();
        assert_eq!(frame, json!({ "content": "hi" }));
    }
}
