//! Error types for the chat synchronization client.

use thiserror::Error;

/// Errors that can occur when using the chat synchronization client.
#[derive(Debug, Error)]
pub enum ChatSyncError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a wire payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The synchronization task is gone (client shut down or dropped).
    #[error("synchronization task is not running")]
    NotConnected,

    /// The operation needs an active session, but none is established.
    #[error("no active session")]
    NotSignedIn,

    /// Attempted a room operation while no room is open.
    #[error("no room is open")]
    NoActiveRoom,

    /// Message content was empty after trimming whitespace.
    #[error("message content is empty")]
    EmptyMessage,

    /// The room channel is not open, so nothing can be sent over it.
    #[error("room channel is not open")]
    ChannelNotOpen,

    /// The HTTP service answered with a non-success status.
    #[error("http error {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The HTTP request could not be completed (DNS, connect, decode...).
    #[error("request error: {0}")]
    Request(String),

    /// Credentials were rejected again after a silent refresh; the session is over.
    #[error("session expired")]
    SessionExpired,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChatSyncError {
    /// Returns `true` if this error ends the session rather than a single request.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}

/// A specialized [`Result`] type for chat synchronization operations.
pub type Result<T> = std::result::Result<T, ChatSyncError>;
