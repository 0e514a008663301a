//! # Chat Sync Client
//!
//! Client-side synchronization core for a realtime chat service.
//!
//! The crate keeps a local room list and the message history of one open room
//! consistent with the server, using two realtime channels (a lobby channel
//! carrying cross-room updates and a room channel carrying message traffic)
//! plus a handful of authenticated HTTP calls.
//!
//! ## Features
//!
//! - **Single-owner core**: one task owns both stores, the realtime token and
//!   both channels, so store mutations never interleave
//! - **Ordered room list**: rooms stay sorted by latest activity under any
//!   sequence of lobby updates
//! - **Token recovery**: channels closed with 4001/4002 trigger exactly one
//!   room-list refetch and reopen with the fresh token
//! - **Pluggable I/O**: implement [`ChatApi`] and [`Connector`] for any
//!   backend; the default `http-api` and `transport-websocket` features bundle
//!   reqwest and tokio-tungstenite implementations
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chat_sync_client::{ChatClient, ChatConfig, ChatEvent};
//!
//! let (mut client, mut events) = ChatClient::connect(ChatConfig::from_env())?;
//! while let Some(event) = events.recv().await {
//!     if let ChatEvent::RoomsLoaded { .. } = event {
//!         println!("{} rooms", client.snapshot().rooms.len());
//!     }
//! }
//! client.shutdown().await;
//! ```

pub mod api;
pub mod channel;
pub mod client;
pub mod close_codes;
pub mod error;
pub mod event;
#[cfg(feature = "http-api")]
pub mod http;
pub mod protocol;
pub mod store;
mod synchronizer;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use api::ChatApi;
pub use channel::{ChannelKind, ChannelState};
pub use client::{ChatClient, ChatConfig};
pub use close_codes::CloseCode;
pub use error::ChatSyncError;
pub use event::{ChatEvent, Operation, SessionEndReason, SyncSnapshot};
#[cfg(feature = "http-api")]
pub use http::HttpApi;
pub use protocol::{Identity, Message, Room, RoomId, SenderId, ServerEvent, UserId};
pub use transport::{Connector, Transport};
#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
