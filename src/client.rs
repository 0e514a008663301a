//! Async client handle for the chat synchronization core.
//!
//! [`ChatClient`] is a thin handle that talks to a background sync loop over an
//! unbounded MPSC channel. The loop owns the room and message stores and both
//! realtime channels. Discrete events arrive on the bounded channel returned
//! from [`ChatClient::start`]; the full store state is published as a
//! [`SyncSnapshot`] through [`ChatClient::subscribe`].
//!
//! # Example
//!
//! ```rust,ignore
//! let config = ChatConfig::from_env();
//! let (mut client, mut events) = ChatClient::connect(config)?;
//!
//! let mut state = client.subscribe();
//! state.wait_for(|s| !s.rooms.is_empty()).await?;
//! client.open_room(state.borrow().rooms[0].id.clone())?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ChatEvent::SessionEnded { .. } = event {
//!         break;
//!     }
//! }
//! client.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::api::ChatApi;
use crate::error::{ChatSyncError, Result};
use crate::event::{ChatEvent, SessionEndReason, SessionObserver, SyncSnapshot};
use crate::protocol::{Message, Room, RoomId, UserId};
use crate::synchronizer::{Command, Internal, SyncChannels, Synchronizer};
use crate::transport::Connector;

/// Default base URL of the HTTP API.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:4000";

/// Default base URL of the realtime endpoints.
pub const DEFAULT_WS_BASE_URL: &str = "ws://localhost:4000";

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default timeout for HTTP and websocket connection establishment.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`ChatClient`].
///
/// # Example
///
/// ```
/// use chat_sync_client::client::ChatConfig;
/// use std::time::Duration;
///
/// let config = ChatConfig::new("https://chat.example.com/", "wss://chat.example.com")
///     .with_event_channel_capacity(512)
///     .with_shutdown_timeout(Duration::from_secs(5));
/// assert_eq!(config.api_base_url, "https://chat.example.com");
/// assert_eq!(config.event_channel_capacity, 512);
/// ```
#[derive(Clone)]
pub struct ChatConfig {
    /// Base URL of the HTTP API, without trailing slash.
    pub api_base_url: String,
    /// Base URL of the realtime endpoints, without trailing slash.
    pub ws_base_url: String,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) so the sync loop never blocks. `SessionEnded` is always
    /// delivered regardless of capacity.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Timeout for the graceful shutdown, and for each retiring channel
    /// connection to finish its close handshake.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Timeout for establishing HTTP and websocket connections.
    ///
    /// Defaults to **10 seconds**.
    pub connect_timeout: Duration,
    /// Called once each time a session ends.
    pub session_observer: Option<SessionObserver>,
}

impl ChatConfig {
    /// Create a configuration for the given base URLs. Trailing slashes are trimmed.
    pub fn new(api_base_url: impl Into<String>, ws_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: trim_base(api_base_url.into()),
            ws_base_url: trim_base(ws_base_url.into()),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session_observer: None,
        }
    }

    /// Read base URLs from `CHAT_API_URL` and `CHAT_WS_URL`, falling back to
    /// the localhost defaults.
    pub fn from_env() -> Self {
        let api = std::env::var("CHAT_API_URL").unwrap_or_else(|_| DEFAULT_API_BASE_URL.into());
        let ws = std::env::var("CHAT_WS_URL").unwrap_or_else(|_| DEFAULT_WS_BASE_URL.into());
        Self::new(api, ws)
    }

    /// Set the capacity of the bounded event channel. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the connection timeout used by [`ChatClient::connect`].
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Register a callback told whenever a session ends, for example to send
    /// the user back to a sign-in screen.
    #[must_use]
    pub fn with_session_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(SessionEndReason) + Send + Sync + 'static,
    {
        self.session_observer = Some(Arc::new(observer));
        self
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_BASE_URL, DEFAULT_WS_BASE_URL)
    }
}

impl std::fmt::Debug for ChatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatConfig")
            .field("api_base_url", &self.api_base_url)
            .field("ws_base_url", &self.ws_base_url)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("session_observer", &self.session_observer.is_some())
            .finish()
    }
}

fn trim_base(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to a running synchronization core.
///
/// Created via [`ChatClient::start`] (or [`ChatClient::connect`]), which spawns
/// the sync loop and begins a session. Fire-and-forget methods return once the
/// command is queued; [`send_message`](Self::send_message) and
/// [`create_room`](Self::create_room) wait for the core's answer.
pub struct ChatClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SyncSnapshot>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl ChatClient {
    /// Spawn the sync loop and start a session.
    ///
    /// The session fetches the profile and room list through `api`; realtime
    /// channels are opened through `connector` once a token arrives.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start(
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn Connector>,
        config: ChatConfig,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel::<Internal>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<ChatEvent>(capacity);
        let (state_tx, state_rx) = watch::channel(SyncSnapshot::default());

        let synchronizer = Synchronizer::new(
            api,
            connector,
            config.ws_base_url,
            config.shutdown_timeout,
            config.session_observer,
            SyncChannels {
                internal_tx,
                event_tx,
                state_tx,
            },
        );

        // The loop picks this up as its first command.
        let _ = cmd_tx.send(Command::StartSession);

        let task = tokio::spawn(sync_loop(synchronizer, cmd_rx, internal_rx));

        let client = Self {
            cmd_tx,
            state_rx,
            task: Some(task),
            shutdown_timeout: config.shutdown_timeout,
        };
        (client, event_rx)
    }

    /// Start with the bundled reqwest API client and websocket connector.
    ///
    /// # Errors
    ///
    /// Returns [`ChatSyncError::Request`] if the HTTP client cannot be built.
    #[cfg(all(feature = "http-api", feature = "transport-websocket"))]
    pub fn connect(config: ChatConfig) -> Result<(Self, mpsc::Receiver<ChatEvent>)> {
        let api = crate::http::HttpApi::with_connect_timeout(
            config.api_base_url.clone(),
            config.connect_timeout,
        )?;
        let connector =
            crate::transports::WebSocketConnector::new().with_connect_timeout(config.connect_timeout);
        Ok(Self::start(Arc::new(api), Arc::new(connector), config))
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Start a new session after a logout or a rejected credential.
    ///
    /// # Errors
    ///
    /// Returns [`ChatSyncError::NotConnected`] if the client has shut down.
    pub fn resume_session(&self) -> Result<()> {
        self.send(Command::StartSession)
    }

    /// Refetch the room list (and with it, a fresh realtime token).
    ///
    /// # Errors
    ///
    /// Returns [`ChatSyncError::NotConnected`] if the client has shut down.
    pub fn refresh_rooms(&self) -> Result<()> {
        self.send(Command::RefreshRooms)
    }

    /// Make `room_id` the active room: load its history, then open its channel.
    ///
    /// # Errors
    ///
    /// Returns [`ChatSyncError::NotConnected`] if the client has shut down.
    pub fn open_room(&self, room_id: impl Into<RoomId>) -> Result<()> {
        self.send(Command::OpenRoom(room_id.into()))
    }

    /// Clear the active room. The lobby channel stays open.
    ///
    /// # Errors
    ///
    /// Returns [`ChatSyncError::NotConnected`] if the client has shut down.
    pub fn close_room(&self) -> Result<()> {
        self.send(Command::CloseRoom)
    }

    /// Send a message to the active room.
    ///
    /// On success the returned optimistic message is already in the message
    /// store. The server's echo, if any, arrives later as a separate entry.
    ///
    /// # Errors
    ///
    /// - [`ChatSyncError::EmptyMessage`] if `content` is blank.
    /// - [`ChatSyncError::NoActiveRoom`] if no room is open.
    /// - [`ChatSyncError::ChannelNotOpen`] if the room channel is not open yet.
    /// - [`ChatSyncError::NotSignedIn`] / [`ChatSyncError::NotConnected`].
    pub async fn send_message(&self, content: impl Into<String>) -> Result<Message> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SendMessage {
            content: content.into(),
            reply,
        })?;
        rx.await.map_err(|_| ChatSyncError::NotConnected)?
    }

    /// Create a room with another user. Once the refreshed room list includes
    /// it, the new room becomes the active room.
    ///
    /// # Errors
    ///
    /// Returns the HTTP failure unchanged; no state is mutated in that case.
    pub async fn create_room(&self, other_user_id: UserId) -> Result<Room> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateRoom {
            other_user_id,
            reply,
        })?;
        rx.await.map_err(|_| ChatSyncError::NotConnected)?
    }

    /// End the session: close both channels and clear all state.
    ///
    /// # Errors
    ///
    /// Returns [`ChatSyncError::NotConnected`] if the client has shut down.
    pub fn logout(&self) -> Result<()> {
        self.send(Command::Logout)
    }

    /// End any session, close both channels, and stop the sync loop.
    ///
    /// The loop gets [`ChatConfig::shutdown_timeout`] to finish gracefully
    /// before it is aborted. After this the event receiver yields `None`.
    pub async fn shutdown(&mut self) {
        debug!("ChatClient: shutdown requested");
        let _ = self.cmd_tx.send(Command::Shutdown);

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("sync loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("sync loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("sync loop aborted: {join_err}");
                    }
                }
            }
        }
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Copy of the latest published state.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.state_rx.borrow().clone()
    }

    /// Watch receiver that is notified whenever the state changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.state_rx.clone()
    }

    /// Returns `true` while the sync loop is running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.task.is_none() {
            return Err(ChatSyncError::NotConnected);
        }
        self.cmd_tx
            .send(command)
            .map_err(|_| ChatSyncError::NotConnected)
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state_rx.borrow();
        f.debug_struct("ChatClient")
            .field("running", &self.is_running())
            .field("signed_in", &state.signed_in)
            .field("active_room", &state.active_room)
            .finish()
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        // No executor to drive a graceful close here; aborting drops the
        // synchronizer, which aborts both channel pumps.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Sync loop ───────────────────────────────────────────────────────

/// Background loop that feeds commands and internal inputs to the
/// [`Synchronizer`] one at a time via `tokio::select!`.
///
/// Exits on [`Command::Shutdown`] or when the client handle is dropped.
async fn sync_loop(
    mut synchronizer: Synchronizer,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut internal_rx: mpsc::UnboundedReceiver<Internal>,
) {
    debug!("sync loop started");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Shutdown) | None => {
                        debug!("shutting down sync loop");
                        synchronizer.shutdown().await;
                        break;
                    }
                    Some(command) => synchronizer.handle_command(command).await,
                }
            }

            // The synchronizer holds a sender, so this never yields `None`.
            Some(input) = internal_rx.recv() => {
                synchronizer.handle_internal(input);
            }
        }
    }

    debug!("sync loop exited");
}

// ── Tests ───────────────────────────────────────────────────────────

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
    use crate::protocol::{Identity, RoomList};
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// API whose every call hangs; the tests here never need a response.
    struct SilentApi {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatApi for SilentApi {
        async fn fetch_profile(&self) -> Result<Identity> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn fetch_rooms(&self) -> Result<RoomList> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn fetch_messages(&self, _room_id: &str) -> Result<Vec<Message>> {
            std::future::pending().await
        }

        async fn create_room(&self, _other_user_id: UserId) -> Result<Room> {
            Err(ChatSyncError::Http {
                status: 400,
                message: "cannot create".into(),
            })
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>> {
            Err(ChatSyncError::TransportClosed)
        }
    }

    fn start(config: ChatConfig) -> (ChatClient, mpsc::Receiver<ChatEvent>, Arc<SilentApi>) {
        let api = Arc::new(SilentApi {
            calls: AtomicUsize::new(0),
        });
        let (client, events) = ChatClient::start(
            Arc::clone(&api) as Arc<dyn ChatApi>,
            Arc::new(RefusingConnector),
            config,
        );
        (client, events, api)
    }

    #[test]
    fn config_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.api_base_url, "http://localhost:4000");
        assert_eq!(config.ws_base_url, "ws://localhost:4000");
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.session_observer.is_none());
    }

    #[test]
    fn config_trims_trailing_slashes() {
        let config = ChatConfig::new("http://h:1//", "ws://h:2/");
        assert_eq!(config.api_base_url, "http://h:1");
        assert_eq!(config.ws_base_url, "ws://h:2");
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config = ChatConfig::default().with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn config_debug_hides_observer() {
        let config = ChatConfig::default().with_session_observer(|_| {});
        let debug = format!("{config:?}");
        assert!(debug.contains("session_observer: true"));
    }

    #[tokio::test]
    async fn start_emits_session_started_and_fetches() {
        let (mut client, mut events, api) = start(ChatConfig::default());

        let first = events.recv().await.unwrap();
        assert_eq!(first, ChatEvent::SessionStarted);

        let mut state = client.subscribe();
        state.wait_for(|s| s.signed_in).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn send_without_room_is_rejected() {
        let (mut client, mut events, _api) = start(ChatConfig::default());
        let _ = events.recv().await; // SessionStarted

        let err = client.send_message("hello").await.unwrap_err();
        assert!(matches!(err, ChatSyncError::NoActiveRoom));

        let err = client.send_message("   ").await.unwrap_err();
        assert!(matches!(err, ChatSyncError::EmptyMessage));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn create_room_failure_is_returned() {
        let (mut client, mut events, _api) = start(ChatConfig::default());
        let _ = events.recv().await; // SessionStarted

        let err = client.create_room(7).await.unwrap_err();
        assert!(matches!(err, ChatSyncError::Http { status: 400, .. }));
        assert!(client.snapshot().rooms.is_empty());

        client.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_emits_session_ended_and_closes_events() {
        let (mut client, mut events, _api) = start(ChatConfig::default());
        let _ = events.recv().await; // SessionStarted

        client.shutdown().await;
        assert!(!client.is_running());

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(ChatEvent::SessionEnded {
                reason: SessionEndReason::Shutdown
            })
        );
    }

    #[tokio::test]
    async fn commands_after_shutdown_fail() {
        let (mut client, _events, _api) = start(ChatConfig::default());
        client.shutdown().await;
        client.shutdown().await; // second call is a no-op

        assert!(matches!(client.refresh_rooms(), Err(ChatSyncError::NotConnected)));
        assert!(matches!(
            client.send_message("x").await,
            Err(ChatSyncError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn logout_notifies_observer_once() {
        let ended = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ended);
        let config = ChatConfig::default().with_session_observer(move |reason| {
            assert_eq!(reason, SessionEndReason::LoggedOut);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let (mut client, mut events, _api) = start(config);
        let _ = events.recv().await; // SessionStarted

        client.logout().unwrap();
        client.logout().unwrap();
        loop {
            if let Some(ChatEvent::SessionEnded { reason }) = events.recv().await {
                assert_eq!(reason, SessionEndReason::LoggedOut);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert!(!client.snapshot().signed_in);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn drop_without_explicit_shutdown() {
        let (client, mut events, _api) = start(ChatConfig::default());
        let _ = events.recv().await; // SessionStarted
        drop(client);
        while let Some(_event) = events.recv().await {}
    }

    #[tokio::test]
    async fn debug_impl_for_client() {
        let (mut client, _events, _api) = start(ChatConfig::default());
        let debug = format!("{client:?}");
        assert!(debug.contains("ChatClient"));
        assert!(debug.contains("running"));
        client.shutdown().await;
    }
}
