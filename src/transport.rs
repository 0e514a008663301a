//! Transport abstraction for the realtime channels.
//!
//! The [`Transport`] trait is a bidirectional text message stream. The chat
//! service frames every event as one JSON text message, so implementations
//! must handle message framing internally (e.g. WebSocket frames).
//!
//! Unlike a single long-lived connection, the synchronization core opens and
//! closes channels on its own as rooms change and tokens rotate. It therefore
//! takes a [`Connector`], a factory that turns a channel URL into a connected
//! transport.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use chat_sync_client::error::ChatSyncError;
//! use chat_sync_client::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), ChatSyncError> {
//!         Err(ChatSyncError::TransportClosed)
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, ChatSyncError>> {
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), ChatSyncError> {
//!         Ok(())
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ChatSyncError> {
//!         Ok(Box::new(MyTransport {}))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::ChatSyncError;

/// A bidirectional text message transport for one realtime channel.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON message.
/// Each call to [`recv`](Transport::recv) returns one complete JSON message.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data. Channel-based implementations (e.g., wrapping
/// `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text message to the server.
    ///
    /// # Errors
    ///
    /// Returns [`ChatSyncError::TransportSend`] if the message could not be sent.
    async fn send(&mut self, message: String) -> Result<(), ChatSyncError>;

    /// Receive the next JSON text message from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the server closed the connection; see [`close_code`](Transport::close_code)
    async fn recv(&mut self) -> Option<Result<String, ChatSyncError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), ChatSyncError>;

    /// Close code from the server's close frame, once [`recv`](Transport::recv)
    /// has returned `None`. `None` if the connection ended without one.
    fn close_code(&self) -> Option<u16> {
        None
    }
}

/// Opens a connected [`Transport`] for a channel URL.
///
/// Channel URLs carry the realtime token as a query parameter, so
/// implementations should avoid logging the full URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `url` and return the ready transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ChatSyncError>;
}
