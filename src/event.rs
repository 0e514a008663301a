//! Events and state published by the synchronization core.
//!
//! Store contents are published as a [`SyncSnapshot`] on a watch channel, so a
//! UI can re-render from the latest state at its own pace. Things that happen
//! once and carry no lasting state (a server error frame, a failed request,
//! the end of the session) arrive as [`ChatEvent`]s on a bounded channel.

use std::sync::Arc;

use crate::channel::{ChannelKind, ChannelState};
use crate::protocol::{Identity, Message, Room, RoomId};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEndReason {
    /// [`ChatClient::logout`](crate::ChatClient::logout) was called.
    LoggedOut,
    /// The session credential was rejected even after a silent refresh.
    CredentialsRejected,
    /// The client was shut down.
    Shutdown,
}

/// Callback told when the session ends, supplied through
/// [`ChatConfig::with_session_observer`](crate::ChatConfig::with_session_observer).
pub type SessionObserver = Arc<dyn Fn(SessionEndReason) + Send + Sync>;

/// HTTP operation that failed without ending the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Profile,
    RoomList,
    History { room_id: RoomId },
}

/// Discrete events emitted by the synchronization core.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A session started and the first room-list fetch was issued.
    SessionStarted,
    /// A room-list fetch completed and replaced the room store.
    RoomsLoaded { count: usize },
    /// A channel changed state.
    ChannelStateChanged {
        kind: ChannelKind,
        state: ChannelState,
    },
    /// The room channel delivered an `ERROR` frame. The channel stays open.
    ServerError { message: String },
    /// An HTTP request failed. Nothing is retried automatically.
    RequestFailed { operation: Operation, error: String },
    /// The session ended; stores are cleared and both channels closed.
    SessionEnded { reason: SessionEndReason },
}

/// Point-in-time copy of everything the core holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSnapshot {
    pub signed_in: bool,
    pub identity: Option<Identity>,
    /// Rooms, most recently active first.
    pub rooms: Vec<Room>,
    pub active_room: Option<RoomId>,
    /// Messages of the active room.
    pub messages: Vec<Message>,
    pub lobby: ChannelState,
    pub room_channel: ChannelState,
}
