//! Realtime channel state machine.
//!
//! A [`Channel`] owns at most one live connection at a time. Opening spawns a
//! pump task that connects through the [`Connector`], then forwards inbound
//! frames and the final closure to the synchronization core as
//! [`ChannelInput`]s, while writing queued outbound frames to the transport.
//!
//! Every open bumps the channel's generation. Inputs carry the generation of
//! the pump that produced them, so anything a retired connection reports after
//! the core moved on is recognised and dropped.
//!
//! A new pump first waits for the previous pump of the same channel to finish
//! its close handshake (bounded by the retire timeout, then aborted), so two
//! connections of one channel never overlap.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::close_codes::CloseCode;
use crate::error::{ChatSyncError, Result};
use crate::protocol::{encode_component, RoomId};
use crate::transport::Connector;

/// Which of the two realtime channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Identity-scoped channel carrying cross-room updates.
    Lobby,
    /// Channel scoped to the currently open room.
    Room,
}

/// What a channel connection is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelScope {
    Lobby,
    Room(RoomId),
}

impl ChannelScope {
    /// Channel URL under `ws_base`, with the realtime token as query credential.
    pub fn url(&self, ws_base: &str, token: &str) -> String {
        match self {
            Self::Lobby => format!("{ws_base}/rooms?token={}", encode_component(token)),
            Self::Room(room_id) => format!(
                "{ws_base}/room/{}?token={}",
                encode_component(room_id),
                encode_component(token)
            ),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::Lobby => ChannelKind::Lobby,
            Self::Room(_) => ChannelKind::Room,
        }
    }
}

impl fmt::Display for ChannelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lobby => f.write_str("lobby"),
            Self::Room(room_id) => write!(f, "room {room_id}"),
        }
    }
}

/// Connection state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    Connecting,
    Open,
    #[default]
    Closed,
}

/// What a pump reports about its connection.
#[derive(Debug)]
pub(crate) enum ChannelSignal {
    /// The handshake completed.
    Opened,
    /// One text frame, in receive order.
    Frame(String),
    /// The connection is gone. `error` is set when it failed rather than closed.
    Closed {
        code: CloseCode,
        error: Option<String>,
    },
}

/// A [`ChannelSignal`] tagged with the channel and pump generation it came from.
#[derive(Debug)]
pub(crate) struct ChannelInput {
    pub kind: ChannelKind,
    pub generation: u64,
    pub signal: ChannelSignal,
}

/// One realtime channel: state, scope, and the handle to its pump task.
#[derive(Debug)]
pub(crate) struct Channel {
    kind: ChannelKind,
    state: ChannelState,
    scope: Option<ChannelScope>,
    token: Option<String>,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    /// Pump that was told to close and may still be finishing its handshake.
    retiring: Option<JoinHandle<()>>,
    retire_timeout: Duration,
}

impl Channel {
    pub fn new(kind: ChannelKind, retire_timeout: Duration) -> Self {
        Self {
            kind,
            state: ChannelState::Closed,
            scope: None,
            token: None,
            generation: 0,
            outbound: None,
            shutdown: None,
            task: None,
            retiring: None,
            retire_timeout,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Returns `true` if a connection for exactly this scope and token is open
    /// or being established.
    pub fn is_live_for(&self, scope: &ChannelScope, token: &str) -> bool {
        self.state != ChannelState::Closed
            && self.scope.as_ref() == Some(scope)
            && self.token.as_deref() == Some(token)
    }

    /// Returns `true` if `generation` belongs to the current connection.
    pub fn accepts(&self, generation: u64) -> bool {
        self.state != ChannelState::Closed && generation == self.generation
    }

    /// Close any current connection and start a new one for `scope`.
    pub fn open<T>(
        &mut self,
        scope: ChannelScope,
        ws_base: &str,
        token: &str,
        connector: Arc<dyn Connector>,
        sink: mpsc::UnboundedSender<T>,
    ) where
        T: From<ChannelInput> + Send + 'static,
    {
        self.close();
        self.generation += 1;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pump = Pump {
            connector,
            url: scope.url(ws_base, token),
            scope: scope.clone(),
            generation: self.generation,
            sink,
            previous: self.retiring.take(),
            retire_timeout: self.retire_timeout,
        };

        debug!(%scope, generation = self.generation, "opening channel");
        self.task = Some(tokio::spawn(pump.run(outbound_rx, shutdown_rx)));
        self.outbound = Some(outbound_tx);
        self.shutdown = Some(shutdown_tx);
        self.scope = Some(scope);
        self.token = Some(token.to_string());
        self.state = ChannelState::Connecting;
    }

    /// Tell the current connection to close. Returns `true` if one was live.
    ///
    /// The close handshake finishes in the background; the next
    /// [`open`](Self::open) waits for it.
    pub fn close(&mut self) -> bool {
        let was_live = self.state != ChannelState::Closed;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.outbound = None;
        if let Some(task) = self.task.take() {
            self.retiring = Some(task);
        }
        if was_live {
            debug!(kind = ?self.kind, generation = self.generation, "closing channel");
            self.generation += 1;
        }
        self.state = ChannelState::Closed;
        self.scope = None;
        self.token = None;
        was_live
    }

    pub fn mark_open(&mut self) {
        self.state = ChannelState::Open;
    }

    /// Record that the pump ended on its own (server close or failure).
    pub fn mark_closed(&mut self) {
        self.state = ChannelState::Closed;
        self.outbound = None;
        self.shutdown = None;
        if let Some(task) = self.task.take() {
            self.retiring = Some(task);
        }
    }

    /// Queue one text frame for the open connection.
    pub fn send(&self, frame: String) -> Result<()> {
        if self.state != ChannelState::Open {
            return Err(ChatSyncError::ChannelNotOpen);
        }
        self.outbound
            .as_ref()
            .ok_or(ChatSyncError::ChannelNotOpen)?
            .send(frame)
            .map_err(|_| ChatSyncError::TransportClosed)
    }

    /// Close and wait for the pump to finish, aborting it after the retire timeout.
    pub async fn shutdown(&mut self) {
        self.close();
        if let Some(task) = self.retiring.take() {
            retire(task, self.retire_timeout).await;
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // No executor to finish a close handshake here.
        for task in [self.task.take(), self.retiring.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Wait for a pump to exit; abort it if it takes longer than `timeout`.
async fn retire(mut task: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(join_err)) => {
            debug!("channel pump terminated with join error: {join_err}");
        }
        Err(_) => {
            warn!("channel pump did not exit within timeout; aborting task");
            task.abort();
            if let Err(join_err) = task.await {
                debug!("channel pump aborted: {join_err}");
            }
        }
    }
}

/// Everything a pump task needs besides its control channels.
struct Pump<T> {
    connector: Arc<dyn Connector>,
    url: String,
    scope: ChannelScope,
    generation: u64,
    sink: mpsc::UnboundedSender<T>,
    previous: Option<JoinHandle<()>>,
    retire_timeout: Duration,
}

impl<T> Pump<T>
where
    T: From<ChannelInput> + Send + 'static,
{
    fn emit(&self, signal: ChannelSignal) {
        let input = ChannelInput {
            kind: self.scope.kind(),
            generation: self.generation,
            signal,
        };
        if self.sink.send(T::from(input)).is_err() {
            debug!(scope = %self.scope, "synchronizer gone, dropping channel signal");
        }
    }

    /// Connect, then multiplex outbound frames, inbound frames and shutdown
    /// via `tokio::select!` until the connection ends.
    async fn run(
        mut self,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        if let Some(previous) = self.previous.take() {
            retire(previous, self.retire_timeout).await;
        }

        let connector = Arc::clone(&self.connector);
        let mut transport = tokio::select! {
            result = connector.connect(&self.url) => match result {
                Ok(transport) => transport,
                Err(e) => {
                    warn!(scope = %self.scope, "channel connect failed: {e}");
                    self.emit(ChannelSignal::Closed {
                        code: CloseCode::Abnormal,
                        error: Some(e.to_string()),
                    });
                    return;
                }
            },
            _ = &mut shutdown_rx => {
                debug!(scope = %self.scope, "channel closed before connect finished");
                return;
            }
        };

        info!(scope = %self.scope, "channel open");
        self.emit(ChannelSignal::Opened);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(scope = %self.scope, "channel shutdown requested");
                    if let Err(e) = transport.close().await {
                        debug!(scope = %self.scope, "close handshake failed: {e}");
                    }
                    break;
                }

                outgoing = outbound_rx.recv() => {
                    let Some(frame) = outgoing else {
                        // Channel handle dropped its sender.
                        let _ = transport.close().await;
                        break;
                    };
                    if let Err(e) = transport.send(frame).await {
                        error!(scope = %self.scope, "transport send error: {e}");
                        let _ = transport.close().await;
                        self.emit(ChannelSignal::Closed {
                            code: CloseCode::Abnormal,
                            error: Some(e.to_string()),
                        });
                        break;
                    }
                }

                incoming = transport.recv() => {
                    match incoming {
                        Some(Ok(text)) => self.emit(ChannelSignal::Frame(text)),
                        Some(Err(e)) => {
                            error!(scope = %self.scope, "transport receive error: {e}");
                            self.emit(ChannelSignal::Closed {
                                code: CloseCode::Abnormal,
                                error: Some(e.to_string()),
                            });
                            break;
                        }
                        None => {
                            let code = CloseCode::from_raw(transport.close_code());
                            info!(scope = %self.scope, %code, "channel closed by server");
                            self.emit(ChannelSignal::Closed { code, error: None });
                            break;
                        }
                    }
                }
            }
        }

        debug!(scope = %self.scope, "channel pump exited");
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
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport fed by the test through an mpsc; counts how many are alive.
    struct ScriptedTransport {
        incoming: mpsc::UnboundedReceiver<Option<String>>,
        sent: mpsc::UnboundedSender<String>,
        alive: Arc<AtomicUsize>,
        closed: bool,
    }

    impl Drop for ScriptedTransport {
        fn drop(&mut self) {
            if !self.closed {
                self.alive.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, message: String) -> Result<()> {
            self.sent.send(message).map_err(|_| ChatSyncError::TransportClosed)
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            match self.incoming.recv().await {
                Some(Some(text)) => Some(Ok(text)),
                Some(None) => None,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<()> {
            if !self.closed {
                self.closed = true;
                self.alive.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn close_code(&self) -> Option<u16> {
            Some(4001)
        }
    }

    struct ScriptedConnector {
        alive: Arc<AtomicUsize>,
        max_alive: Arc<AtomicUsize>,
        feeds: mpsc::UnboundedSender<(String, mpsc::UnboundedSender<Option<String>>)>,
        sent: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
            let now = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_alive.fetch_max(now, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = self.feeds.send((url.to_string(), tx));
            Ok(Box::new(ScriptedTransport {
                incoming: rx,
                sent: self.sent.clone(),
                alive: Arc::clone(&self.alive),
                closed: false,
            }))
        }
    }

    #[allow(clippy::type_complexity)]
    fn connector() -> (
        Arc<ScriptedConnector>,
        Arc<AtomicUsize>,
        mpsc::UnboundedReceiver<(String, mpsc::UnboundedSender<Option<String>>)>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (feeds, feeds_rx) = mpsc::unbounded_channel();
        let (sent, sent_rx) = mpsc::unbounded_channel();
        let max_alive = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(ScriptedConnector {
            alive: Arc::new(AtomicUsize::new(0)),
            max_alive: Arc::clone(&max_alive),
            feeds,
            sent,
        });
        (connector, max_alive, feeds_rx, sent_rx)
    }

    #[test]
    fn scope_urls_carry_token_as_query() {
        assert_eq!(
            ChannelScope::Lobby.url("ws://h:4000", "abc"),
            "ws://h:4000/rooms?token=abc"
        );
        assert_eq!(
            ChannelScope::Room("r1".into()).url("ws://h:4000", "abc"),
            "ws://h:4000/room/r1?token=abc"
        );
    }

    #[test]
    fn scope_urls_escape_room_id_and_token() {
        assert_eq!(
            ChannelScope::Lobby.url("ws://h", "a+b/c=="),
            "ws://h/rooms?token=a%2Bb%2Fc%3D%3D"
        );
        assert_eq!(
            ChannelScope::Room("r 1/x?y".into()).url("ws://h", "t&u"),
            "ws://h/room/r%201%2Fx%3Fy?token=t%26u"
        );
    }

    #[tokio::test]
    async fn open_reports_opened_then_frames_in_order() {
        let (connector, _max, mut feeds, _sent) = connector();
        let (sink, mut inputs) = mpsc::unbounded_channel::<ChannelInput>();
        let mut channel = Channel::new(ChannelKind::Lobby, Duration::from_secs(1));

        channel.open(ChannelScope::Lobby, "ws://h", "tok", connector, sink);
        assert_eq!(channel.state(), ChannelState::Connecting);

        let (url, feed) = feeds.recv().await.unwrap();
        assert_eq!(url, "ws://h/rooms?token=tok");
        feed.send(Some("one".into())).unwrap();
        feed.send(Some("two".into())).unwrap();

        let first = inputs.recv().await.unwrap();
        assert!(matches!(first.signal, ChannelSignal::Opened));
        assert!(channel.accepts(first.generation));
        channel.mark_open();

        for expected in ["one", "two"] {
            match inputs.recv().await.unwrap().signal {
                ChannelSignal::Frame(text) => assert_eq!(text, expected),
                other => panic!("unexpected signal {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn server_close_reports_code() {
        let (connector, _max, mut feeds, _sent) = connector();
        let (sink, mut inputs) = mpsc::unbounded_channel::<ChannelInput>();
        let mut channel = Channel::new(ChannelKind::Room, Duration::from_secs(1));
        channel.open(ChannelScope::Room("r1".into()), "ws://h", "tok", connector, sink);

        let (_, feed) = feeds.recv().await.unwrap();
        let _ = inputs.recv().await.unwrap(); // Opened
        feed.send(None).unwrap();

        let closed = inputs.recv().await.unwrap();
        match closed.signal {
            ChannelSignal::Closed { code, error } => {
                assert_eq!(code, CloseCode::TokenInvalid);
                assert!(error.is_none());
            }
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_requires_open_state() {
        let (connector, _max, mut feeds, mut sent) = connector();
        let (sink, mut inputs) = mpsc::unbounded_channel::<ChannelInput>();
        let mut channel = Channel::new(ChannelKind::Room, Duration::from_secs(1));
        assert!(matches!(
            channel.send("x".into()),
            Err(ChatSyncError::ChannelNotOpen)
        ));

        channel.open(ChannelScope::Room("r1".into()), "ws://h", "tok", connector, sink);
        assert!(matches!(
            channel.send("x".into()),
            Err(ChatSyncError::ChannelNotOpen)
        ));

        let _feed = feeds.recv().await.unwrap();
        let _ = inputs.recv().await.unwrap(); // Opened
        channel.mark_open();
        channel.send(r#"{"content":"hi"}"#.into()).unwrap();
        assert_eq!(sent.recv().await.unwrap(), r#"{"content":"hi"}"#);
    }

    #[tokio::test]
    async fn reopen_never_overlaps_connections() {
        let (connector, max_alive, mut feeds, _sent) = connector();
        let (sink, mut inputs) = mpsc::unbounded_channel::<ChannelInput>();
        let mut channel = Channel::new(ChannelKind::Room, Duration::from_secs(1));

        for room in ["a", "b", "c"] {
            channel.open(
                ChannelScope::Room(room.into()),
                "ws://h",
                "tok",
                Arc::clone(&connector) as Arc<dyn Connector>,
                sink.clone(),
            );
            let (url, _feed) = feeds.recv().await.unwrap();
            assert!(url.contains(&format!("/room/{room}?")));
            let opened = inputs.recv().await.unwrap();
            assert!(channel.accepts(opened.generation));
            channel.mark_open();
        }

        channel.shutdown().await;
        assert_eq!(max_alive.load(Ordering::SeqCst), 1);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn signals_from_closed_generation_are_rejected() {
        let (connector, _max, mut feeds, _sent) = connector();
        let (sink, mut inputs) = mpsc::unbounded_channel::<ChannelInput>();
        let mut channel = Channel::new(ChannelKind::Lobby, Duration::from_secs(1));

        channel.open(ChannelScope::Lobby, "ws://h", "t1", connector, sink);
        let _feed = feeds.recv().await.unwrap();
        let opened = inputs.recv().await.unwrap();
        channel.mark_open();

        assert!(channel.close());
        assert!(!channel.accepts(opened.generation));
        assert!(!channel.close());
    }

    #[tokio::test]
    async fn is_live_for_checks_scope_and_token() {
        let (connector, _max, _feeds, _sent) = connector();
        let (sink, _inputs) = mpsc::unbounded_channel::<ChannelInput>();
        let mut channel = Channel::new(ChannelKind::Lobby, Duration::from_secs(1));
        assert!(!channel.is_live_for(&ChannelScope::Lobby, "t1"));

        channel.open(ChannelScope::Lobby, "ws://h", "t1", connector, sink);
        assert!(channel.is_live_for(&ChannelScope::Lobby, "t1"));
        assert!(!channel.is_live_for(&ChannelScope::Lobby, "t2"));

        channel.mark_closed();
        assert!(!channel.is_live_for(&ChannelScope::Lobby, "t1"));
    }
}
