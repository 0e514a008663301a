//! HTTP collaborator boundary.
//!
//! The synchronization core needs four operations from the chat service's
//! HTTP side. They are expressed as the [`ChatApi`] trait so the core can be
//! driven by the bundled reqwest client ([`HttpApi`](crate::http::HttpApi),
//! feature `http-api`) or by any other implementation, such as a scripted one
//! in tests.
//!
//! Implementations own the session credential. A rejected credential must be
//! retried once after a silent refresh; if it is rejected again the call
//! returns [`ChatSyncError::SessionExpired`](crate::ChatSyncError::SessionExpired),
//! which ends the session.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{Identity, Message, Room, RoomList, UserId};

/// Authenticated HTTP operations used by the synchronization core.
#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    /// Fetch the identity behind the current session.
    async fn fetch_profile(&self) -> Result<Identity>;

    /// Fetch the visible rooms together with a fresh realtime token.
    async fn fetch_rooms(&self) -> Result<RoomList>;

    /// Fetch the message history of one room.
    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<Message>>;

    /// Create a room with another user.
    async fn create_room(&self, other_user_id: UserId) -> Result<Room>;
}
