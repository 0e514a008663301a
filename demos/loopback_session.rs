//! # Loopback Session Example
//!
//! Drives a full session against an in-process fake chat service, with no
//! network at all. Shows how to plug your own [`ChatApi`] and [`Connector`]
//! into [`ChatClient::start`]:
//!
//! - **Testing**: exercise UI logic against scripted server behavior
//! - **Custom backends**: adapt any I/O layer to the two traits
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_session
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chat_sync_client::protocol::{Identity, Message, Room, RoomList, SenderId, UserId};
use chat_sync_client::{
    ChannelState, ChatApi, ChatClient, ChatConfig, ChatSyncError, Connector, Transport,
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: An in-memory HTTP side
// ─────────────────────────────────────────────────────────────────────

struct InMemoryApi {
    tokens: AtomicUsize,
}

#[async_trait]
impl ChatApi for InMemoryApi {
    async fn fetch_profile(&self) -> Result<Identity, ChatSyncError> {
        Ok(Identity {
            id: 1,
            email: "demo@example.com".into(),
            is_verified: true,
            created_at: Utc::now(),
        })
    }

    async fn fetch_rooms(&self) -> Result<RoomList, ChatSyncError> {
        let n = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RoomList {
            rooms: vec![Room {
                id: "general".into(),
                user1_id: 1,
                user2_id: 2,
                messages: Vec::new(),
            }],
            token: format!("demo-token-{n}"),
        })
    }

    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<Message>, ChatSyncError> {
        Ok(vec![Message {
            id: "welcome".into(),
            room_id: room_id.into(),
            sender_id: SenderId::User(2),
            content: "welcome to the loopback".into(),
            created_at: Utc::now(),
        }])
    }

    async fn create_room(&self, _other_user_id: UserId) -> Result<Room, ChatSyncError> {
        Err(ChatSyncError::Http {
            status: 501,
            message: "not supported by the demo".into(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A loopback transport and the connector that creates it
// ─────────────────────────────────────────────────────────────────────

/// Client half of an in-process connection.
struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), ChatSyncError> {
        self.tx
            .send(message)
            .map_err(|e| ChatSyncError::TransportSend(e.to_string()))
    }

    /// `mpsc::UnboundedReceiver::recv` is cancel-safe.
    async fn recv(&mut self) -> Option<Result<String, ChatSyncError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), ChatSyncError> {
        self.rx.close();
        Ok(())
    }
}

/// Opens loopback connections. Room connections echo every posted message
/// back as a `NEW_MESSAGE`, the way the real service does.
struct LoopbackConnector;

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ChatSyncError> {
        let (client_tx, mut server_rx) = mpsc::unbounded_channel::<String>();
        let (server_tx, client_rx) = mpsc::unbounded_channel::<String>();

        let room_id = url
            .split_once("/room/")
            .map(|(_, rest)| rest.split('?').next().unwrap_or_default().to_string());

        if let Some(room_id) = room_id {
            tokio::spawn(async move {
                let mut next_id = 0;
                while let Some(frame) = server_rx.recv().await {
                    let Ok(posted) = serde_json::from_str::<serde_json::Value>(&frame) else {
                        continue;
                    };
                    next_id += 1;
                    let echo = json!({
                        "type": "NEW_MESSAGE",
                        "data": {
                            "id": format!("srv-{next_id}"),
                            "roomId": room_id,
                            "senderId": 1,
                            "content": posted["content"],
                            "createdAt": Utc::now(),
                        }
                    });
                    if server_tx.send(echo.to_string()).is_err() {
                        break;
                    }
                }
            });
        } else {
            // The lobby stays quiet; keep its sender alive until the client closes.
            tokio::spawn(async move {
                while server_rx.recv().await.is_some() {}
                drop(server_tx);
            });
        }

        Ok(Box::new(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Run a session
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let api = Arc::new(InMemoryApi {
        tokens: AtomicUsize::new(0),
    });
    let (mut client, _events) =
        ChatClient::start(api, Arc::new(LoopbackConnector), ChatConfig::default());
    let mut state = client.subscribe();

    state.wait_for(|s| s.lobby == ChannelState::Open).await?;
    println!("rooms: {:?}", client.snapshot().rooms.iter().map(|r| &r.id).collect::<Vec<_>>());

    client.open_room("general")?;
    state
        .wait_for(|s| s.room_channel == ChannelState::Open)
        .await?;

    let sent = client.send_message("hello, loopback").await?;
    println!("optimistic: {} ({})", sent.content, sent.id);

    // The optimistic entry and the server echo both stay in the store.
    let snapshot = state.wait_for(|s| s.messages.len() == 3).await?.clone();
    for message in &snapshot.messages {
        println!("  {:>12}  {}", message.id, message.content);
    }

    client.shutdown().await;
    Ok(())
}
