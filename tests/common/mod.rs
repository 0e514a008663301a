#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for chat sync client integration tests.
//!
//! Provides a channel-driven [`MockConnector`] whose connections the test
//! drives frame by frame, a scripted [`MockApi`], and helpers for building
//! rooms, messages and server event JSON.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_sync_client::protocol::{Identity, Message, Room, RoomList, SenderId, UserId};
use chat_sync_client::{
    ChatApi, ChatClient, ChatConfig, ChatEvent, ChatSyncError, Connector, SyncSnapshot, Transport,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::{mpsc, watch, Notify};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(2);

pub const WS_BASE: &str = "ws://chat.test";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, panicking after [`WAIT`].
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

pub fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

pub fn message(id: &str, room_id: &str, sender: UserId, content: &str, ms: i64) -> Message {
    Message {
        id: id.into(),
        room_id: room_id.into(),
        sender_id: SenderId::User(sender),
        content: content.into(),
        created_at: at(ms),
    }
}

pub fn room(id: &str, messages: Vec<Message>) -> Room {
    Room {
        id: id.into(),
        user1_id: 1,
        user2_id: 2,
        messages,
    }
}

pub fn identity() -> Identity {
    Identity {
        id: 1,
        email: "ada@example.com".into(),
        is_verified: true,
        created_at: at(0),
    }
}

pub fn room_update_json(room_id: &str, last_message: &Message) -> String {
    json!({
        "type": "ROOM_UPDATE",
        "data": { "roomId": room_id, "lastMessage": last_message },
    })
    .to_string()
}

pub fn new_message_json(message: &Message) -> String {
    json!({ "type": "NEW_MESSAGE", "data": message }).to_string()
}

pub fn error_json(text: &str) -> String {
    json!({ "type": "ERROR", "message": text }).to_string()
}

pub fn message_sent_json() -> String {
    json!({ "type": "MESSAGE_SENT", "data": { "ok": true } }).to_string()
}

// ── MockConnector ───────────────────────────────────────────────────

/// What the test pushes into a mock connection.
#[derive(Debug)]
pub enum ServerFrame {
    Text(String),
    /// Server-initiated close with an optional close code.
    Close(Option<u16>),
}

/// Test-side end of one connection opened by the client.
pub struct MockConnection {
    pub url: String,
    frames: mpsc::UnboundedSender<ServerFrame>,
    pub sent: Arc<StdMutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
}

impl MockConnection {
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.frames.send(ServerFrame::Text(text.into()));
    }

    pub fn close_with(&self, code: u16) {
        let _ = self.frames.send(ServerFrame::Close(Some(code)));
    }

    pub fn is_room(&self) -> bool {
        self.url.contains("/room/")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct Census {
    alive_rooms: AtomicUsize,
    max_alive_rooms: AtomicUsize,
    connects: AtomicUsize,
}

struct MockTransport {
    frames: mpsc::UnboundedReceiver<ServerFrame>,
    sent: Arc<StdMutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    close_code: Option<u16>,
    is_room: bool,
    census: Arc<Census>,
}

impl MockTransport {
    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) && self.is_room {
            self.census.alive_rooms.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), ChatSyncError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChatSyncError::TransportClosed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, ChatSyncError>> {
        match self.frames.recv().await {
            Some(ServerFrame::Text(text)) => Some(Ok(text)),
            Some(ServerFrame::Close(code)) => {
                self.close_code = code;
                self.release();
                None
            }
            // Test dropped its end; stay silent until the client closes.
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> Result<(), ChatSyncError> {
        self.release();
        Ok(())
    }

    fn close_code(&self) -> Option<u16> {
        self.close_code
    }
}

/// Connector that hands every opened connection to the test.
pub struct MockConnector {
    opened: mpsc::UnboundedSender<MockConnection>,
    census: Arc<Census>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockConnection>) {
        let (opened, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            opened,
            census: Arc::new(Census::default()),
        });
        (connector, rx)
    }

    /// Highest number of room connections that were open at the same time.
    pub fn max_concurrent_rooms(&self) -> usize {
        self.census.max_alive_rooms.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.census.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, ChatSyncError> {
        let is_room = url.contains("/room/");
        self.census.connects.fetch_add(1, Ordering::SeqCst);
        if is_room {
            let now = self.census.alive_rooms.fetch_add(1, Ordering::SeqCst) + 1;
            self.census.max_alive_rooms.fetch_max(now, Ordering::SeqCst);
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let _ = self.opened.send(MockConnection {
            url: url.to_string(),
            frames: frames_tx,
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        });

        Ok(Box::new(MockTransport {
            frames: frames_rx,
            sent,
            closed,
            close_code: None,
            is_room,
            census: Arc::clone(&self.census),
        }))
    }
}

// ── MockApi ─────────────────────────────────────────────────────────

/// Scripted [`ChatApi`]. Each room-list fetch issues a new token `tok-N`.
#[derive(Default)]
pub struct MockApi {
    pub rooms: StdMutex<Vec<Room>>,
    pub history: StdMutex<HashMap<String, Vec<Message>>>,
    /// Rooms whose history fetch waits until the gate is notified.
    pub history_gates: StdMutex<HashMap<String, Arc<Notify>>>,
    /// The next room-list fetch captures the list, then waits for this gate.
    pub rooms_gate: StdMutex<Option<Arc<Notify>>>,
    pub room_fetches: AtomicUsize,
    pub history_fetches: AtomicUsize,
    /// Every call fails with `SessionExpired`.
    pub expired: AtomicBool,
    /// History fetches fail with a 500.
    pub history_broken: AtomicBool,
    /// Room creation fails with a 409.
    pub create_conflict: AtomicBool,
}

impl MockApi {
    pub fn with_rooms(rooms: Vec<Room>) -> Arc<Self> {
        let api = Self::default();
        *api.rooms.lock().unwrap() = rooms;
        Arc::new(api)
    }

    pub fn set_history(&self, room_id: &str, messages: Vec<Message>) {
        self.history
            .lock()
            .unwrap()
            .insert(room_id.to_string(), messages);
    }

    /// Hold history responses for `room_id` until the returned gate is notified.
    pub fn gate_history(&self, room_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.history_gates
            .lock()
            .unwrap()
            .insert(room_id.to_string(), Arc::clone(&gate));
        gate
    }

    /// Hold the next room-list response until the returned gate is notified.
    /// The response lists the rooms known when the fetch started.
    pub fn gate_rooms(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.rooms_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn room_fetches(&self) -> usize {
        self.room_fetches.load(Ordering::SeqCst)
    }

    fn check_session(&self) -> Result<(), ChatSyncError> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(ChatSyncError::SessionExpired);
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn fetch_profile(&self) -> Result<Identity, ChatSyncError> {
        self.check_session()?;
        Ok(identity())
    }

    async fn fetch_rooms(&self) -> Result<RoomList, ChatSyncError> {
        self.check_session()?;
        let rooms = self.rooms.lock().unwrap().clone();
        let n = self.room_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = self.rooms_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(RoomList {
            rooms,
            token: format!("tok-{n}"),
        })
    }

    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<Message>, ChatSyncError> {
        self.check_session()?;
        self.history_fetches.fetch_add(1, Ordering::SeqCst);
        let gate = self.history_gates.lock().unwrap().get(room_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.history_broken.load(Ordering::SeqCst) {
            return Err(ChatSyncError::Http {
                status: 500,
                message: "history unavailable".into(),
            });
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_room(&self, other_user_id: UserId) -> Result<Room, ChatSyncError> {
        self.check_session()?;
        if self.create_conflict.load(Ordering::SeqCst) {
            return Err(ChatSyncError::Http {
                status: 409,
                message: "room already exists".into(),
            });
        }
        let created = Room {
            id: format!("room-with-{other_user_id}"),
            user1_id: 1,
            user2_id: other_user_id,
            messages: Vec::new(),
        };
        self.rooms.lock().unwrap().push(created.clone());
        Ok(created)
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// A started client wired to a [`MockApi`] and [`MockConnector`].
pub struct Harness {
    pub client: ChatClient,
    pub events: mpsc::Receiver<ChatEvent>,
    pub state: watch::Receiver<SyncSnapshot>,
    pub api: Arc<MockApi>,
    pub connector: Arc<MockConnector>,
    pub connections: mpsc::UnboundedReceiver<MockConnection>,
}

impl Harness {
    pub fn start(api: Arc<MockApi>) -> Self {
        Self::start_with(api, ChatConfig::new("http://chat.test", WS_BASE))
    }

    pub fn start_with(api: Arc<MockApi>, config: ChatConfig) -> Self {
        init_tracing();
        let (connector, connections) = MockConnector::new();
        let (client, events) = ChatClient::start(
            Arc::clone(&api) as Arc<dyn ChatApi>,
            Arc::clone(&connector) as Arc<dyn Connector>,
            config,
        );
        let state = client.subscribe();
        Self {
            client,
            events,
            state,
            api,
            connector,
            connections,
        }
    }

    /// Next connection the client opened.
    pub async fn next_connection(&mut self) -> MockConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Wait until the published state satisfies `predicate`.
    pub async fn wait_for(&mut self, predicate: impl FnMut(&SyncSnapshot) -> bool) -> SyncSnapshot {
        tokio::time::timeout(WAIT, self.state.wait_for(predicate))
            .await
            .expect("timed out waiting for state")
            .expect("sync loop gone")
            .clone()
    }

    /// Wait for the first event matching `predicate`, skipping others.
    pub async fn wait_event(&mut self, mut predicate: impl FnMut(&ChatEvent) -> bool) -> ChatEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Start, then wait for the lobby connection and its open state.
    pub async fn signed_in(api: Arc<MockApi>) -> (Self, MockConnection) {
        let mut harness = Self::start(api);
        let lobby = harness.next_connection().await;
        harness
            .wait_for(|s| s.lobby == chat_sync_client::ChannelState::Open)
            .await;
        (harness, lobby)
    }

    /// Open `room_id` and wait until its room channel is open.
    pub async fn enter_room(&mut self, room_id: &str) -> MockConnection {
        self.client.open_room(room_id).unwrap();
        let connection = self.next_connection().await;
        assert!(connection.is_room(), "expected a room connection, got {}", connection.url);
        let room_id = room_id.to_string();
        self.wait_for(move |s| {
            s.active_room.as_deref() == Some(room_id.as_str())
                && s.room_channel == chat_sync_client::ChannelState::Open
        })
        .await;
        connection
    }
}
