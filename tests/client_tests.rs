#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! End-to-end tests for the synchronization core.
//!
//! Uses the shared `MockApi` and `MockConnector` from `tests/common` to drive
//! a real `ChatClient`: HTTP results are scripted, and every realtime
//! connection the client opens is handed to the test to push frames into.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_test::assert_ok;

use chat_sync_client::{
    ChannelKind, ChannelState, ChatConfig, ChatEvent, ChatSyncError, Operation, SenderId,
    SessionEndReason,
};

use common::{
    error_json, eventually, message, message_sent_json, new_message_json, room,
    room_update_json, Harness, MockApi, WS_BASE,
};

// ════════════════════════════════════════════════════════════════════
// Session start
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn session_start_loads_sorted_rooms_and_opens_lobby() {
    let api = MockApi::with_rooms(vec![
        room("r1", vec![message("m1", "r1", 2, "old", 0)]),
        room("empty", vec![]),
        room("r2", vec![message("m2", "r2", 2, "new", 5_000)]),
    ]);
    let mut h = Harness::start(api);

    let lobby = h.next_connection().await;
    assert_eq!(lobby.url, format!("{WS_BASE}/rooms?token=tok-1"));

    let state = h
        .wait_for(|s| s.lobby == ChannelState::Open && s.identity.is_some())
        .await;
    let order: Vec<_> = state.rooms.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(order, ["r2", "r1", "empty"]);
    assert!(state.signed_in);
    assert_eq!(state.identity.unwrap().email, "ada@example.com");
    assert_eq!(state.room_channel, ChannelState::Closed);

    h.wait_event(|e| *e == ChatEvent::RoomsLoaded { count: 3 })
        .await;
    h.client.shutdown().await;
}

#[tokio::test]
async fn expired_session_ends_before_any_channel_opens() {
    let ended = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&ended);
    let config = ChatConfig::new("http://chat.test", WS_BASE).with_session_observer(move |reason| {
        assert_eq!(reason, SessionEndReason::CredentialsRejected);
        seen.fetch_add(1, Ordering::SeqCst);
    });
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    api.expired.store(true, Ordering::SeqCst);
    let mut h = Harness::start_with(api, config);

    h.wait_event(|e| {
        *e == ChatEvent::SessionEnded {
            reason: SessionEndReason::CredentialsRejected,
        }
    })
    .await;
    let state = h.wait_for(|s| !s.signed_in).await;
    assert!(state.rooms.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert_eq!(h.connector.connects(), 0);
    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Lobby updates and room ordering
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn update_appends_to_single_room() {
    let api = MockApi::with_rooms(vec![room("r1", vec![message("m1", "r1", 2, "hi", 0)])]);
    let (mut h, lobby) = Harness::signed_in(api).await;

    lobby.push(room_update_json("r1", &message("m2", "r1", 2, "yo", 1_000)));

    let state = h.wait_for(|s| s.rooms[0].messages.len() == 2).await;
    assert_eq!(state.rooms.len(), 1);
    let contents: Vec<_> = state.rooms[0]
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, ["hi", "yo"]);
    h.client.shutdown().await;
}

#[tokio::test]
async fn update_moves_room_to_front() {
    let api = MockApi::with_rooms(vec![
        room("r1", vec![message("m1", "r1", 2, "a", 0)]),
        room("r2", vec![message("m2", "r2", 2, "b", 5_000)]),
    ]);
    let (mut h, lobby) = Harness::signed_in(api).await;
    assert_eq!(h.client.snapshot().rooms[0].id, "r2");

    lobby.push(room_update_json("r1", &message("m3", "r1", 2, "c", 10_000)));

    let state = h.wait_for(|s| s.rooms[0].id == "r1").await;
    let order: Vec<_> = state.rooms.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(order, ["r1", "r2"]);
    h.client.shutdown().await;
}

#[tokio::test]
async fn repeated_update_is_applied_once() {
    let api = MockApi::with_rooms(vec![
        room("r1", vec![message("m1", "r1", 2, "a", 0)]),
        room("r2", vec![]),
    ]);
    let (mut h, lobby) = Harness::signed_in(api).await;

    let update = room_update_json("r1", &message("m2", "r1", 2, "b", 1_000));
    lobby.push(update.clone());
    lobby.push(update);
    // Sentinel: once r2 moves, both r1 frames have been handled.
    lobby.push(room_update_json("r2", &message("m3", "r2", 2, "c", 2_000)));

    let state = h.wait_for(|s| s.rooms[0].id == "r2").await;
    assert_eq!(state.rooms[1].messages.len(), 2);
    h.client.shutdown().await;
}

#[tokio::test]
async fn unknown_room_update_refetches_without_inserting() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let (mut h, lobby) = Harness::signed_in(api).await;

    lobby.push(room_update_json("ghost", &message("g1", "ghost", 3, "boo", 1_000)));

    // The refetch issues a new token, so the lobby reconnects with it.
    let relobby = h.next_connection().await;
    assert_eq!(relobby.url, format!("{WS_BASE}/rooms?token=tok-2"));
    assert_eq!(h.api.room_fetches(), 2);

    let state = h.wait_for(|s| s.lobby == ChannelState::Open).await;
    assert_eq!(state.rooms.len(), 1);
    assert!(state.rooms[0].messages.is_empty());
    eventually("old lobby closed", || lobby.is_closed()).await;
    h.client.shutdown().await;
}

#[tokio::test]
async fn malformed_frame_is_discarded() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let (mut h, lobby) = Harness::signed_in(api).await;

    lobby.push("{not json");
    lobby.push(r#"{"type":"ROOM_UPDATE","data":{"roomId":"r1"}}"#);
    lobby.push(r#"{"type":"TYPING","data":{}}"#);
    lobby.push(room_update_json("r1", &message("m1", "r1", 2, "ok", 1_000)));

    let state = h.wait_for(|s| s.rooms[0].messages.len() == 1).await;
    assert_eq!(state.lobby, ChannelState::Open);
    assert_eq!(h.api.room_fetches(), 1);
    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Active room
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn open_room_loads_history_then_connects() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    api.set_history(
        "r1",
        vec![
            message("m1", "r1", 1, "first", 0),
            message("m2", "r1", 2, "second", 1_000),
        ],
    );
    let (mut h, _lobby) = Harness::signed_in(api).await;

    let conn = h.enter_room("r1").await;
    assert_eq!(conn.url, format!("{WS_BASE}/room/r1?token=tok-1"));

    let state = h.client.snapshot();
    assert_eq!(state.messages.len(), 2);
    assert_eq!(state.messages[1].content, "second");
    h.client.shutdown().await;
}

#[tokio::test]
async fn late_history_for_previous_room_is_ignored() {
    let api = MockApi::with_rooms(vec![room("a", vec![]), room("b", vec![])]);
    api.set_history("a", vec![message("a1", "a", 2, "from a", 0)]);
    api.set_history("b", vec![message("b1", "b", 2, "from b", 0)]);
    let gate = api.gate_history("a");
    let (mut h, _lobby) = Harness::signed_in(api).await;

    assert_ok!(h.client.open_room("a"));
    let conn = h.enter_room("b").await;
    assert!(conn.url.contains("/room/b?"));

    gate.notify_one();
    eventually("history for a requested", || {
        h.api.history_fetches.load(Ordering::SeqCst) == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = h.client.snapshot();
    assert_eq!(state.active_room.as_deref(), Some("b"));
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].content, "from b");
    assert!(h.connections.try_recv().is_err(), "no channel for room a");
    assert_eq!(h.connector.max_concurrent_rooms(), 1);
    h.client.shutdown().await;
}

#[tokio::test]
async fn switching_rooms_never_overlaps_room_connections() {
    let api = MockApi::with_rooms(vec![room("r1", vec![]), room("r2", vec![])]);
    let (mut h, _lobby) = Harness::signed_in(api).await;

    let first = h.enter_room("r1").await;
    let second = h.enter_room("r2").await;
    let third = h.enter_room("r1").await;

    assert!(first.is_closed());
    assert!(second.is_closed());
    assert!(!third.is_closed());
    assert_eq!(h.connector.max_concurrent_rooms(), 1);
    h.client.shutdown().await;
}

#[tokio::test]
async fn history_failure_is_reported_and_channel_still_opens() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    api.history_broken.store(true, Ordering::SeqCst);
    let (mut h, _lobby) = Harness::signed_in(api).await;

    let _conn = h.enter_room("r1").await;
    let event = h
        .wait_event(|e| matches!(e, ChatEvent::RequestFailed { .. }))
        .await;
    match event {
        ChatEvent::RequestFailed { operation, error } => {
            assert_eq!(
                operation,
                Operation::History {
                    room_id: "r1".into()
                }
            );
            assert!(error.contains("500"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(h.client.snapshot().messages.is_empty());
    h.client.shutdown().await;
}

#[tokio::test]
async fn close_room_clears_messages_and_keeps_lobby() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    api.set_history("r1", vec![message("m1", "r1", 2, "hey", 0)]);
    let (mut h, lobby) = Harness::signed_in(api).await;
    let conn = h.enter_room("r1").await;

    assert_ok!(h.client.close_room());

    let state = h
        .wait_for(|s| s.active_room.is_none() && s.room_channel == ChannelState::Closed)
        .await;
    assert!(state.messages.is_empty());
    assert_eq!(state.lobby, ChannelState::Open);
    eventually("room connection closed", || conn.is_closed()).await;
    assert!(!lobby.is_closed());
    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Sending
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn send_appends_optimistic_entry_and_keeps_echo() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let (mut h, _lobby) = Harness::signed_in(api).await;
    let conn = h.enter_room("r1").await;

    let sent = h.client.send_message("hello").await.unwrap();
    assert!(sent.is_optimistic());
    assert_eq!(sent.sender_id, SenderId::Local);
    assert_eq!(h.client.snapshot().messages, vec![sent.clone()]);

    eventually("frame written", || !conn.sent().is_empty()).await;
    assert_eq!(conn.sent(), [r#"{"content":"hello"}"#]);

    conn.push(message_sent_json());
    conn.push(error_json("slow down"));
    let event = h
        .wait_event(|e| matches!(e, ChatEvent::ServerError { .. }))
        .await;
    assert_eq!(
        event,
        ChatEvent::ServerError {
            message: "slow down".into()
        }
    );
    assert_eq!(h.client.snapshot().messages.len(), 1);

    conn.push(new_message_json(&message("srv-1", "r1", 1, "hello", 1_000)));
    let state = h.wait_for(|s| s.messages.len() == 2).await;
    assert_eq!(state.messages[0], sent);
    assert_eq!(state.messages[1].id, "srv-1");
    assert_eq!(state.room_channel, ChannelState::Open);
    h.client.shutdown().await;
}

#[tokio::test]
async fn send_is_validated() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let (mut h, _lobby) = Harness::signed_in(api).await;

    assert!(matches!(
        h.client.send_message("hi").await,
        Err(ChatSyncError::NoActiveRoom)
    ));

    let conn = h.enter_room("r1").await;
    assert!(matches!(
        h.client.send_message(" \n\t").await,
        Err(ChatSyncError::EmptyMessage)
    ));

    conn.close_with(1000);
    h.wait_for(|s| s.room_channel == ChannelState::Closed).await;
    assert!(matches!(
        h.client.send_message("hi").await,
        Err(ChatSyncError::ChannelNotOpen)
    ));
    assert!(h.client.snapshot().messages.is_empty());
    // An ordinary close does not refetch.
    assert_eq!(h.api.room_fetches(), 1);

    assert_ok!(h.client.logout());
    h.wait_for(|s| !s.signed_in).await;
    assert!(matches!(
        h.client.send_message("hi").await,
        Err(ChatSyncError::NotSignedIn)
    ));
    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Token rejection
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rejected_token_refetches_once_and_reopens_both_channels() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let (mut h, lobby) = Harness::signed_in(api).await;
    let conn = h.enter_room("r1").await;

    lobby.close_with(4001);
    conn.close_with(4002);

    let mut urls = vec![h.next_connection().await.url, h.next_connection().await.url];
    urls.sort();
    assert_eq!(
        urls,
        [
            format!("{WS_BASE}/room/r1?token=tok-2"),
            format!("{WS_BASE}/rooms?token=tok-2"),
        ]
    );

    h.wait_for(|s| s.lobby == ChannelState::Open && s.room_channel == ChannelState::Open)
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.api.room_fetches(), 2);
    assert!(h.connections.try_recv().is_err());
    h.client.shutdown().await;
}

#[tokio::test]
async fn channel_state_changes_are_reported() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let (mut h, lobby) = Harness::signed_in(api).await;

    lobby.close_with(4002);
    h.wait_event(|e| {
        *e == ChatEvent::ChannelStateChanged {
            kind: ChannelKind::Lobby,
            state: ChannelState::Closed,
        }
    })
    .await;
    h.wait_event(|e| {
        *e == ChatEvent::ChannelStateChanged {
            kind: ChannelKind::Lobby,
            state: ChannelState::Open,
        }
    })
    .await;
    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Room creation
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn created_room_is_selected_after_refetch() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let (mut h, _lobby) = Harness::signed_in(api).await;

    let created = h.client.create_room(9).await.unwrap();
    assert_eq!(created.id, "room-with-9");

    let room_conn = loop {
        let conn = h.next_connection().await;
        if conn.is_room() {
            break conn;
        }
    };
    assert_eq!(room_conn.url, format!("{WS_BASE}/room/room-with-9?token=tok-2"));

    let state = h
        .wait_for(|s| s.active_room.as_deref() == Some("room-with-9"))
        .await;
    assert!(state.rooms.iter().any(|r| r.id == "room-with-9"));
    h.client.shutdown().await;
}

#[tokio::test]
async fn created_room_waits_for_a_list_fetched_after_creation() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let (mut h, _lobby) = Harness::signed_in(api).await;

    // A refresh is in flight and its list predates the new room.
    let gate = h.api.gate_rooms();
    assert_ok!(h.client.refresh_rooms());
    eventually("refresh started", || h.api.room_fetches() == 2).await;

    let created = h.client.create_room(9).await.unwrap();
    gate.notify_one();

    let state = h
        .wait_for(|s| s.active_room.as_deref() == Some("room-with-9"))
        .await;
    assert!(state.rooms.iter().any(|r| r.id == "room-with-9"));
    assert_eq!(h.api.room_fetches(), 3);
    assert_eq!(created.id, "room-with-9");
    h.client.shutdown().await;
}

#[tokio::test]
async fn failed_creation_changes_nothing() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    api.create_conflict.store(true, Ordering::SeqCst);
    let (mut h, _lobby) = Harness::signed_in(api).await;

    let err = h.client.create_room(9).await.unwrap_err();
    assert!(matches!(err, ChatSyncError::Http { status: 409, .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.api.room_fetches(), 1);
    let state = h.client.snapshot();
    assert_eq!(state.rooms.len(), 1);
    assert!(state.active_room.is_none());
    h.client.shutdown().await;
}

// ════════════════════════════════════════════════════════════════════
// Session end
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn logout_clears_everything_and_resume_starts_over() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    api.set_history("r1", vec![message("m1", "r1", 2, "hey", 0)]);
    let (mut h, lobby) = Harness::signed_in(api).await;
    let conn = h.enter_room("r1").await;

    assert_ok!(h.client.logout());
    h.wait_event(|e| {
        *e == ChatEvent::SessionEnded {
            reason: SessionEndReason::LoggedOut,
        }
    })
    .await;

    let state = h.wait_for(|s| !s.signed_in).await;
    assert!(state.rooms.is_empty());
    assert!(state.messages.is_empty());
    assert!(state.identity.is_none());
    assert!(state.active_room.is_none());
    assert_eq!(state.lobby, ChannelState::Closed);
    assert_eq!(state.room_channel, ChannelState::Closed);
    eventually("both connections closed", || {
        lobby.is_closed() && conn.is_closed()
    })
    .await;

    assert_ok!(h.client.resume_session());
    let relobby = h.next_connection().await;
    assert_eq!(relobby.url, format!("{WS_BASE}/rooms?token=tok-2"));
    let state = h
        .wait_for(|s| s.signed_in && s.lobby == ChannelState::Open)
        .await;
    assert_eq!(state.rooms.len(), 1);
    h.client.shutdown().await;
}

#[tokio::test]
async fn undrained_events_never_stall_the_core() {
    let ended = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&ended);
    let config = ChatConfig::new("http://chat.test", WS_BASE)
        .with_event_channel_capacity(1)
        .with_session_observer(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let mut h = Harness::start_with(api, config);
    let _lobby = h.next_connection().await;
    h.wait_for(|s| s.lobby == ChannelState::Open).await;

    // Nothing reads events while the session ends, restarts and ends again.
    assert_ok!(h.client.logout());
    h.wait_for(|s| !s.signed_in).await;
    assert_ok!(h.client.resume_session());
    h.wait_for(|s| s.signed_in && s.lobby == ChannelState::Open)
        .await;
    assert_ok!(h.client.logout());
    h.wait_for(|s| !s.signed_in).await;
    eventually("observer called per session end", || {
        ended.load(Ordering::SeqCst) == 2
    })
    .await;

    // Both session ends are still delivered once the consumer catches up.
    for _ in 0..2 {
        h.wait_event(|e| {
            *e == ChatEvent::SessionEnded {
                reason: SessionEndReason::LoggedOut,
            }
        })
        .await;
    }
    h.client.shutdown().await;
}

#[tokio::test]
async fn credential_failure_mid_session_ends_it() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let (mut h, lobby) = Harness::signed_in(api).await;

    h.api.expired.store(true, Ordering::SeqCst);
    assert_ok!(h.client.refresh_rooms());

    h.wait_event(|e| {
        *e == ChatEvent::SessionEnded {
            reason: SessionEndReason::CredentialsRejected,
        }
    })
    .await;
    eventually("lobby closed", || lobby.is_closed()).await;
    assert!(!h.client.snapshot().signed_in);
    h.client.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_channels_and_ends_event_stream() {
    let api = MockApi::with_rooms(vec![room("r1", vec![])]);
    let (mut h, lobby) = Harness::signed_in(api).await;
    let conn = h.enter_room("r1").await;

    h.client.shutdown().await;

    assert!(lobby.is_closed());
    assert!(conn.is_closed());
    let mut last = None;
    while let Some(event) = h.events.recv().await {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(ChatEvent::SessionEnded {
            reason: SessionEndReason::Shutdown
        })
    );
}
