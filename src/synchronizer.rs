//! The synchronization core.
//!
//! [`Synchronizer`] owns the room and message stores, the realtime token and
//! both channels. It runs inside a single task and processes one input at a
//! time: either a [`Command`] from the client handle or an [`Internal`] input
//! posted by a helper task (HTTP completion or channel signal). Network work is
//! always spawned, never awaited inline, so the task stays responsive and
//! store mutations never interleave.
//!
//! Responses that may arrive late carry enough context to be recognised as
//! stale: room-list and profile results carry the session epoch, history
//! results carry the room id and request sequence, channel signals carry the
//! channel generation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::channel::{Channel, ChannelInput, ChannelKind, ChannelScope, ChannelSignal, ChannelState};
use crate::error::{ChatSyncError, Result};
use crate::event::{ChatEvent, Operation, SessionEndReason, SessionObserver, SyncSnapshot};
use crate::protocol::{
    Identity, Message, OutboundMessage, Room, RoomId, RoomList, ServerEvent, UserId,
};
use crate::store::{MessageStore, RoomStore, RoomUpdateOutcome};
use crate::transport::Connector;

/// Request from the client handle.
#[derive(Debug)]
pub(crate) enum Command {
    StartSession,
    RefreshRooms,
    OpenRoom(RoomId),
    CloseRoom,
    SendMessage {
        content: String,
        reply: oneshot::Sender<Result<Message>>,
    },
    CreateRoom {
        other_user_id: UserId,
        reply: oneshot::Sender<Result<Room>>,
    },
    Logout,
    Shutdown,
}

/// Completion posted back to the core by a helper task.
#[derive(Debug)]
pub(crate) enum Internal {
    Channel(ChannelInput),
    ProfileLoaded {
        epoch: u64,
        result: Result<Identity>,
    },
    RoomsLoaded {
        epoch: u64,
        /// Room awaiting selection when the fetch was issued.
        select: Option<RoomId>,
        result: Result<RoomList>,
    },
    HistoryLoaded {
        epoch: u64,
        room_id: RoomId,
        request: u64,
        result: Result<Vec<Message>>,
    },
    RoomCreated {
        epoch: u64,
        result: Result<Room>,
        reply: oneshot::Sender<Result<Room>>,
    },
}

impl From<ChannelInput> for Internal {
    fn from(input: ChannelInput) -> Self {
        Self::Channel(input)
    }
}

/// Why a room-list fetch was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refetch {
    SessionStart,
    Manual,
    /// A channel closed with a reserved close code.
    TokenRejected,
    /// A lobby update named a room the store does not know.
    UnknownRoom,
    /// A room was just created and must be selected once listed.
    RoomCreated,
}

impl Refetch {
    /// Whether a fetch already in flight is enough. A fetch issued before a
    /// room appeared may not list it, but any fetch yields a fresh token.
    fn satisfied_by_in_flight(self) -> bool {
        matches!(self, Self::TokenRejected | Self::SessionStart)
    }
}

/// Wiring the core needs besides its collaborators.
pub(crate) struct SyncChannels {
    pub internal_tx: mpsc::UnboundedSender<Internal>,
    pub event_tx: mpsc::Sender<ChatEvent>,
    pub state_tx: watch::Sender<SyncSnapshot>,
}

pub(crate) struct Synchronizer {
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn Connector>,
    ws_base: String,
    internal_tx: mpsc::UnboundedSender<Internal>,
    event_tx: mpsc::Sender<ChatEvent>,
    state_tx: watch::Sender<SyncSnapshot>,
    observer: Option<SessionObserver>,

    rooms: RoomStore,
    messages: MessageStore,
    identity: Option<Identity>,
    token: Option<String>,
    active_room: Option<RoomId>,
    signed_in: bool,
    /// Bumped whenever a session starts or ends.
    epoch: u64,
    /// Sequence of the newest history request.
    history_request: u64,
    history_pending: bool,
    rooms_in_flight: bool,
    rooms_refetch_queued: bool,
    /// Room to open once a room list fetched after its creation arrives.
    pending_select: Option<RoomId>,

    lobby: Channel,
    room: Channel,
}

impl Synchronizer {
    pub fn new(
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn Connector>,
        ws_base: String,
        retire_timeout: Duration,
        observer: Option<SessionObserver>,
        channels: SyncChannels,
    ) -> Self {
        Self {
            api,
            connector,
            ws_base,
            internal_tx: channels.internal_tx,
            event_tx: channels.event_tx,
            state_tx: channels.state_tx,
            observer,
            rooms: RoomStore::new(),
            messages: MessageStore::new(),
            identity: None,
            token: None,
            active_room: None,
            signed_in: false,
            epoch: 0,
            history_request: 0,
            history_pending: false,
            rooms_in_flight: false,
            rooms_refetch_queued: false,
            pending_select: None,
            lobby: Channel::new(ChannelKind::Lobby, retire_timeout),
            room: Channel::new(ChannelKind::Room, retire_timeout),
        }
    }

    // ── Inputs ──────────────────────────────────────────────────────

    pub async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartSession => self.start_session(),
            Command::RefreshRooms => {
                if self.signed_in {
                    self.request_rooms(Refetch::Manual);
                } else {
                    debug!("refresh ignored, no active session");
                }
            }
            Command::OpenRoom(room_id) => self.open_room(room_id),
            Command::CloseRoom => self.close_room(),
            Command::SendMessage { content, reply } => {
                let result = self.send_message(content);
                // The optimistic entry is visible before the caller resumes.
                self.publish();
                let _ = reply.send(result);
            }
            Command::CreateRoom {
                other_user_id,
                reply,
            } => self.create_room(other_user_id, reply),
            Command::Logout => self.end_session(SessionEndReason::LoggedOut),
            Command::Shutdown => self.shutdown().await,
        }
        self.publish();
    }

    pub fn handle_internal(&mut self, input: Internal) {
        match input {
            Internal::Channel(input) => self.on_channel_input(input),
            Internal::ProfileLoaded { epoch, result } => self.on_profile(epoch, result),
            Internal::RoomsLoaded {
                epoch,
                select,
                result,
            } => self.on_rooms(epoch, select, result),
            Internal::HistoryLoaded {
                epoch,
                room_id,
                request,
                result,
            } => self.on_history(epoch, room_id, request, result),
            Internal::RoomCreated {
                epoch,
                result,
                reply,
            } => self.on_room_created(epoch, result, reply),
        }
        self.publish();
    }

    /// End the session if one is active and wait for both channels to finish closing.
    pub async fn shutdown(&mut self) {
        self.end_session(SessionEndReason::Shutdown);
        self.lobby.shutdown().await;
        self.room.shutdown().await;
        self.publish();
    }

    // ── Session ─────────────────────────────────────────────────────

    fn start_session(&mut self) {
        if self.signed_in {
            debug!("session already active, refreshing rooms");
            self.request_rooms(Refetch::Manual);
            return;
        }
        self.signed_in = true;
        self.epoch += 1;
        info!(epoch = self.epoch, "session started");
        self.emit(ChatEvent::SessionStarted);

        let api = Arc::clone(&self.api);
        let epoch = self.epoch;
        self.spawn_request(async move {
            Internal::ProfileLoaded {
                epoch,
                result: api.fetch_profile().await,
            }
        });
        self.request_rooms(Refetch::SessionStart);
    }

    /// Close both channels, clear both stores and forget the token.
    fn end_session(&mut self, reason: SessionEndReason) {
        self.close_channel(ChannelKind::Lobby);
        self.close_channel(ChannelKind::Room);
        self.rooms.clear();
        self.messages.clear();
        self.identity = None;
        self.token = None;
        self.active_room = None;
        self.pending_select = None;
        self.history_request += 1;
        self.history_pending = false;
        self.rooms_in_flight = false;
        self.rooms_refetch_queued = false;

        if !self.signed_in {
            return;
        }
        self.signed_in = false;
        self.epoch += 1;
        info!(?reason, "session ended");

        self.publish();
        if let Some(observer) = &self.observer {
            observer(reason);
        }
        emit_session_ended(&self.event_tx, reason);
    }

    /// Route a request error: `SessionExpired` ends the session and returns
    /// `true`; anything else is reported as a failed operation.
    fn absorb_failure(&mut self, operation: Operation, error: &ChatSyncError) -> bool {
        if error.is_session_fatal() {
            warn!(?operation, "credentials rejected after refresh");
            self.end_session(SessionEndReason::CredentialsRejected);
            return true;
        }
        warn!(?operation, "request failed: {error}");
        self.emit(ChatEvent::RequestFailed {
            operation,
            error: error.to_string(),
        });
        false
    }

    fn on_profile(&mut self, epoch: u64, result: Result<Identity>) {
        if epoch != self.epoch {
            debug!("discarding profile from an earlier session");
            return;
        }
        match result {
            Ok(identity) => {
                debug!(user_id = identity.id, "profile loaded");
                self.identity = Some(identity);
            }
            Err(e) => {
                self.absorb_failure(Operation::Profile, &e);
            }
        }
    }

    // ── Room list and token ─────────────────────────────────────────

    fn request_rooms(&mut self, reason: Refetch) {
        if self.rooms_in_flight {
            if reason.satisfied_by_in_flight() {
                debug!(?reason, "room list already in flight");
            } else {
                debug!(?reason, "room list in flight, queueing another fetch");
                self.rooms_refetch_queued = true;
            }
            return;
        }
        debug!(?reason, "fetching room list");
        self.rooms_in_flight = true;

        let api = Arc::clone(&self.api);
        let epoch = self.epoch;
        let select = self.pending_select.clone();
        self.spawn_request(async move {
            Internal::RoomsLoaded {
                epoch,
                select,
                result: api.fetch_rooms().await,
            }
        });
    }

    fn on_rooms(&mut self, epoch: u64, select: Option<RoomId>, result: Result<RoomList>) {
        if epoch != self.epoch {
            debug!("discarding room list from an earlier session");
            return;
        }
        self.rooms_in_flight = false;

        match result {
            Ok(list) => {
                self.rooms.replace(list.rooms);
                let count = self.rooms.rooms().len();
                debug!(count, "room list loaded");
                self.emit(ChatEvent::RoomsLoaded { count });
                self.apply_token(list.token);
                // Only a fetch issued after the room was created is sure to list it.
                if select.is_some() && select == self.pending_select {
                    if let Some(room_id) = self.pending_select.take() {
                        self.open_room(room_id);
                    }
                }
            }
            Err(e) => {
                if self.absorb_failure(Operation::RoomList, &e) {
                    return;
                }
            }
        }

        if std::mem::take(&mut self.rooms_refetch_queued) {
            self.request_rooms(Refetch::Manual);
        }
    }

    /// Make both channels live for `token`, replacing connections bound to a
    /// stale one.
    fn apply_token(&mut self, token: String) {
        if self.token.as_deref() != Some(token.as_str()) {
            debug!("realtime token rotated");
        }
        self.token = Some(token);

        if self.ensure_channel(ChannelScope::Lobby) {
            debug!("lobby channel opening");
        }
        if !self.history_pending {
            if let Some(room_id) = self.active_room.clone() {
                self.ensure_channel(ChannelScope::Room(room_id));
            }
        }
    }

    /// Open a channel for `scope` unless one is already live for the current
    /// token. Returns `true` if a connection was started.
    fn ensure_channel(&mut self, scope: ChannelScope) -> bool {
        let Some(token) = self.token.clone() else {
            debug!(%scope, "no realtime token yet");
            return false;
        };
        let kind = scope.kind();
        let channel = match kind {
            ChannelKind::Lobby => &mut self.lobby,
            ChannelKind::Room => &mut self.room,
        };
        if channel.is_live_for(&scope, &token) {
            return false;
        }
        channel.open(
            scope,
            &self.ws_base,
            &token,
            Arc::clone(&self.connector),
            self.internal_tx.clone(),
        );
        self.emit(ChatEvent::ChannelStateChanged {
            kind,
            state: ChannelState::Connecting,
        });
        true
    }

    fn close_channel(&mut self, kind: ChannelKind) {
        let closed = match kind {
            ChannelKind::Lobby => self.lobby.close(),
            ChannelKind::Room => self.room.close(),
        };
        if closed {
            self.emit(ChatEvent::ChannelStateChanged {
                kind,
                state: ChannelState::Closed,
            });
        }
    }

    // ── Active room ─────────────────────────────────────────────────

    fn open_room(&mut self, room_id: RoomId) {
        if !self.signed_in {
            warn!(%room_id, "cannot open room without a session");
            return;
        }
        self.close_channel(ChannelKind::Room);
        self.active_room = Some(room_id.clone());
        self.messages.reset(room_id.clone());
        self.history_request += 1;
        self.history_pending = true;
        debug!(%room_id, request = self.history_request, "loading room history");

        let api = Arc::clone(&self.api);
        let epoch = self.epoch;
        let request = self.history_request;
        self.spawn_request(async move {
            let result = api.fetch_messages(&room_id).await;
            Internal::HistoryLoaded {
                epoch,
                room_id,
                request,
                result,
            }
        });
    }

    fn close_room(&mut self) {
        self.close_channel(ChannelKind::Room);
        if let Some(room_id) = self.active_room.take() {
            debug!(%room_id, "room closed");
        }
        self.messages.clear();
        self.history_request += 1;
        self.history_pending = false;
    }

    fn on_history(
        &mut self,
        epoch: u64,
        room_id: RoomId,
        request: u64,
        result: Result<Vec<Message>>,
    ) {
        if epoch != self.epoch
            || request != self.history_request
            || self.messages.room_id() != Some(room_id.as_str())
        {
            debug!(%room_id, request, "discarding stale history response");
            return;
        }
        self.history_pending = false;

        match result {
            Ok(history) => {
                debug!(%room_id, count = history.len(), "history loaded");
                self.messages.replace(history);
            }
            Err(e) => {
                let operation = Operation::History {
                    room_id: room_id.clone(),
                };
                if self.absorb_failure(operation, &e) {
                    return;
                }
            }
        }
        self.ensure_channel(ChannelScope::Room(room_id));
    }

    fn send_message(&mut self, content: String) -> Result<Message> {
        if !self.signed_in {
            return Err(ChatSyncError::NotSignedIn);
        }
        if content.trim().is_empty() {
            return Err(ChatSyncError::EmptyMessage);
        }
        let Some(room_id) = self.active_room.clone() else {
            return Err(ChatSyncError::NoActiveRoom);
        };
        if self.room.state() != ChannelState::Open {
            return Err(ChatSyncError::ChannelNotOpen);
        }

        let frame = serde_json::to_string(&OutboundMessage {
            content: content.clone(),
        })?;
        let message = Message::optimistic(room_id, content);
        self.messages.push(message.clone());
        if let Err(e) = self.room.send(frame) {
            warn!("failed to queue outbound message: {e}");
        }
        Ok(message)
    }

    fn create_room(&mut self, other_user_id: UserId, reply: oneshot::Sender<Result<Room>>) {
        if !self.signed_in {
            let _ = reply.send(Err(ChatSyncError::NotSignedIn));
            return;
        }
        let api = Arc::clone(&self.api);
        let epoch = self.epoch;
        self.spawn_request(async move {
            Internal::RoomCreated {
                epoch,
                result: api.create_room(other_user_id).await,
                reply,
            }
        });
    }

    fn on_room_created(
        &mut self,
        epoch: u64,
        result: Result<Room>,
        reply: oneshot::Sender<Result<Room>>,
    ) {
        if epoch == self.epoch {
            match &result {
                Ok(room) => {
                    info!(room_id = %room.id, "room created");
                    self.pending_select = Some(room.id.clone());
                    self.request_rooms(Refetch::RoomCreated);
                }
                Err(e) if e.is_session_fatal() => {
                    self.end_session(SessionEndReason::CredentialsRejected);
                }
                Err(e) => debug!("room creation failed: {e}"),
            }
        }
        let _ = reply.send(result);
    }

    // ── Channels ────────────────────────────────────────────────────

    fn on_channel_input(&mut self, input: ChannelInput) {
        let ChannelInput {
            kind,
            generation,
            signal,
        } = input;
        let channel = match kind {
            ChannelKind::Lobby => &mut self.lobby,
            ChannelKind::Room => &mut self.room,
        };
        if !channel.accepts(generation) {
            debug!(?kind, generation, "dropping signal from retired channel");
            return;
        }

        match signal {
            ChannelSignal::Opened => {
                channel.mark_open();
                self.emit(ChatEvent::ChannelStateChanged {
                    kind,
                    state: ChannelState::Open,
                });
            }
            ChannelSignal::Frame(text) => match ServerEvent::parse(&text) {
                Ok(event) => match kind {
                    ChannelKind::Lobby => self.on_lobby_event(event),
                    ChannelKind::Room => self.on_room_event(event),
                },
                Err(e) => warn!(?kind, "discarding malformed event: {e}"),
            },
            ChannelSignal::Closed { code, error } => {
                channel.mark_closed();
                match error {
                    Some(error) => warn!(?kind, "channel failed: {error}"),
                    None => debug!(?kind, %code, "channel closed"),
                }
                self.emit(ChatEvent::ChannelStateChanged {
                    kind,
                    state: ChannelState::Closed,
                });
                if code.requires_new_token() {
                    info!(?kind, %code, "realtime token rejected, refetching room list");
                    self.request_rooms(Refetch::TokenRejected);
                }
            }
        }
    }

    fn on_lobby_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::RoomUpdate(update) => {
                let room_id = update.room_id;
                match self.rooms.apply_update(&room_id, update.last_message) {
                    RoomUpdateOutcome::Applied => debug!(%room_id, "room updated"),
                    RoomUpdateOutcome::Redundant => debug!(%room_id, "redundant room update"),
                    RoomUpdateOutcome::UnknownRoom => {
                        info!(%room_id, "update for unknown room, refetching room list");
                        self.request_rooms(Refetch::UnknownRoom);
                    }
                }
            }
            other => debug!(kind = other.kind(), "ignoring lobby event"),
        }
    }

    fn on_room_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage(message) => {
                debug!(id = %message.id, "new message");
                self.messages.push(message);
            }
            ServerEvent::Error { message } => {
                warn!("room channel error: {message}");
                self.emit(ChatEvent::ServerError { message });
            }
            ServerEvent::MessageSent(_) => debug!("send acknowledged"),
            other => debug!(kind = other.kind(), "ignoring room event"),
        }
    }

    // ── Output ──────────────────────────────────────────────────────

    fn spawn_request<F>(&self, request: F)
    where
        F: Future<Output = Internal> + Send + 'static,
    {
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let input = request.await;
            if internal_tx.send(input).is_err() {
                debug!("synchronizer gone, dropping request result");
            }
        });
    }

    fn emit(&self, event: ChatEvent) {
        emit_event(&self.event_tx, event);
    }

    fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            signed_in: self.signed_in,
            identity: self.identity.clone(),
            rooms: self.rooms.rooms().to_vec(),
            active_room: self.active_room.clone(),
            messages: self.messages.messages().to_vec(),
            lobby: self.lobby.state(),
            room_channel: self.room.state(),
        }
    }

    /// Push the current state to watchers if it changed.
    fn publish(&self) {
        let snapshot = self.snapshot();
        self.state_tx.send_if_modified(move |current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Emit an event to the event channel. If the channel is full, log a warning
/// and drop the event to avoid stalling the core.
fn emit_event(event_tx: &mpsc::Sender<ChatEvent>, event: ChatEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!("event channel full, dropping event: {dropped:?}");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// Emit [`ChatEvent::SessionEnded`], which must never be dropped.
///
/// If the channel is full, delivery moves to a helper task that waits for
/// room, so the core keeps running while the consumer catches up.
fn emit_session_ended(event_tx: &mpsc::Sender<ChatEvent>, reason: SessionEndReason) {
    match event_tx.try_send(ChatEvent::SessionEnded { reason }) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            debug!("event channel full, delivering session end in the background");
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                if event_tx.send(event).await.is_err() {
                    debug!("event channel closed, receiver dropped");
                }
            });
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}
