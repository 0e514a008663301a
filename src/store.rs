//! In-memory room and message stores.
//!
//! Both stores are owned by the synchronization core and mutated only from its
//! task, so they are plain data structures with no interior locking.

use crate::protocol::{Message, Room, RoomId};

/// Result of applying a lobby `ROOM_UPDATE` to the [`RoomStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomUpdateOutcome {
    /// The message was appended and the store re-sorted.
    Applied,
    /// The room already holds this message; nothing changed.
    Redundant,
    /// No room with this id is known; the caller must refetch the list.
    UnknownRoom,
}

/// Rooms visible to the current identity, ordered by latest activity.
///
/// The order is derived: after every mutation rooms are sorted by the
/// timestamp of their tail message, newest first. Rooms without messages sort
/// as if their latest message were at time zero. Ties keep their previous
/// relative order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStore {
    rooms: Vec<Room>,
}

impl RoomStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every room with a freshly fetched list.
    pub fn replace(&mut self, rooms: Vec<Room>) {
        self.rooms = rooms;
        self.sort();
    }

    /// Apply a `ROOM_UPDATE`: append `last_message` to the room's tail.
    pub fn apply_update(&mut self, room_id: &str, last_message: Message) -> RoomUpdateOutcome {
        let Some(room) = self.rooms.iter_mut().find(|room| room.id == room_id) else {
            return RoomUpdateOutcome::UnknownRoom;
        };
        if room
            .messages
            .iter()
            .any(|message| message.id == last_message.id)
        {
            return RoomUpdateOutcome::Redundant;
        }
        room.messages.push(last_message);
        self.sort();
        RoomUpdateOutcome::Applied
    }

    /// Rooms in display order.
    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn clear(&mut self) {
        self.rooms.clear();
    }

    // `sort_by` is stable, which gives the tie-break for free.
    fn sort(&mut self) {
        self.rooms
            .sort_by(|a, b| b.latest_activity().cmp(&a.latest_activity()));
    }
}

/// Messages of the currently open room, in arrival order.
///
/// Server-confirmed order is authoritative; optimistic entries are appended at
/// the tail and never reordered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageStore {
    room_id: Option<RoomId>,
    messages: Vec<Message>,
}

impl MessageStore {
    /// Create an empty store bound to no room.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the store to `room_id` and drop any previous contents.
    pub fn reset(&mut self, room_id: impl Into<RoomId>) {
        self.room_id = Some(room_id.into());
        self.messages.clear();
    }

    /// Replace the contents with a fetched history.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Append one message at the tail.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Unbind the store and drop its contents.
    pub fn clear(&mut self) {
        self.room_id = None;
        self.messages.clear();
    }

    /// Room the store is bound to, if any.
    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
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
    use crate::protocol::SenderId;
    use chrono::{TimeZone, Utc};

    fn msg(id: &str, room: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            room_id: room.into(),
            sender_id: SenderId::User(2),
            content: format!("content of {id}"),
            created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    fn room(id: &str, messages: Vec<Message>) -> Room {
        Room {
            id: id.into(),
            user1_id: 1,
            user2_id: 2,
            messages,
        }
    }

    fn order(store: &RoomStore) -> Vec<&str> {
        store.rooms().iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn replace_sorts_newest_first_and_empty_last() {
        let mut store = RoomStore::new();
        store.replace(vec![
            room("empty", vec![]),
            room("old", vec![msg("a", "old", 0)]),
            room("new", vec![msg("b", "new", 50)]),
        ]);
        assert_eq!(order(&store), ["new", "old", "empty"]);
    }

    #[test]
    fn update_on_single_room_appends_and_keeps_it_first() {
        let mut store = RoomStore::new();
        store.replace(vec![room("r1", vec![msg("m1", "r1", 0)])]);

        let outcome = store.apply_update("r1", msg("m2", "r1", 1));

        assert_eq!(outcome, RoomUpdateOutcome::Applied);
        assert_eq!(store.rooms().len(), 1);
        assert_eq!(order(&store), ["r1"]);
        let contents: Vec<_> = store.rooms()[0].messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(contents, ["m1", "m2"]);
    }

    #[test]
    fn update_moves_room_to_front() {
        let mut store = RoomStore::new();
        store.replace(vec![
            room("r1", vec![msg("m1", "r1", 0)]),
            room("r2", vec![msg("m2", "r2", 5)]),
        ]);
        assert_eq!(order(&store), ["r2", "r1"]);

        store.apply_update("r1", msg("m3", "r1", 10));
        assert_eq!(order(&store), ["r1", "r2"]);
    }

    #[test]
    fn ties_keep_prior_relative_order() {
        let mut store = RoomStore::new();
        store.replace(vec![
            room("a", vec![msg("a1", "a", 3)]),
            room("b", vec![msg("b1", "b", 3)]),
            room("c", vec![]),
            room("d", vec![]),
        ]);
        assert_eq!(order(&store), ["a", "b", "c", "d"]);

        // "b" catches up with "a"'s timestamp exactly; no jump.
        store.apply_update("b", msg("b2", "b", 3));
        assert_eq!(order(&store), ["a", "b", "c", "d"]);
    }

    #[test]
    fn unknown_room_is_not_inserted() {
        let mut store = RoomStore::new();
        store.replace(vec![room("r1", vec![])]);
        let outcome = store.apply_update("ghost", msg("m1", "ghost", 1));
        assert_eq!(outcome, RoomUpdateOutcome::UnknownRoom);
        assert_eq!(order(&store), ["r1"]);
    }

    #[test]
    fn redundant_update_is_idempotent() {
        let mut store = RoomStore::new();
        store.replace(vec![room("r1", vec![msg("m1", "r1", 0)])]);
        assert_eq!(store.apply_update("r1", msg("m2", "r1", 1)), RoomUpdateOutcome::Applied);
        let snapshot = store.clone();
        assert_eq!(store.apply_update("r1", msg("m2", "r1", 1)), RoomUpdateOutcome::Redundant);
        assert_eq!(store, snapshot);
    }

    #[test]
    fn replayed_older_update_is_redundant() {
        let mut store = RoomStore::new();
        store.replace(vec![
            room("r1", vec![msg("m1", "r1", 0), msg("m2", "r1", 10)]),
            room("r2", vec![msg("m3", "r2", 5)]),
        ]);
        let before = store.clone();

        let outcome = store.apply_update("r1", msg("m1", "r1", 0));

        assert_eq!(outcome, RoomUpdateOutcome::Redundant);
        assert_eq!(order(&store), ["r1", "r2"]);
        assert_eq!(store, before);
    }

    #[test]
    fn ordering_holds_after_every_update_in_a_sequence() {
        let mut store = RoomStore::new();
        store.replace(vec![
            room("r1", vec![msg("x1", "r1", 2)]),
            room("r2", vec![]),
            room("r3", vec![msg("x3", "r3", 7)]),
            room("r4", vec![msg("x4", "r4", 7)]),
        ]);
        let updates = [("r2", 1), ("r1", 9), ("r4", 9), ("r3", 3), ("r2", 20), ("r1", 20)];
        for (n, (room_id, secs)) in updates.into_iter().enumerate() {
            let before = order(&store).into_iter().map(String::from).collect::<Vec<_>>();
            store.apply_update(room_id, msg(&format!("u{n}"), room_id, secs));

            let times: Vec<i64> = store.rooms().iter().map(Room::latest_activity).collect();
            assert!(times.windows(2).all(|w| w[0] >= w[1]), "not sorted: {times:?}");

            // Any two rooms with equal activity keep their previous relative order.
            let after = order(&store);
            for pair in store.rooms().windows(2) {
                if pair[0].latest_activity() == pair[1].latest_activity() {
                    let i = before.iter().position(|id| *id == pair[0].id).unwrap();
                    let j = before.iter().position(|id| *id == pair[1].id).unwrap();
                    assert!(i < j, "tie reordered: {before:?} -> {after:?}");
                }
            }
        }
        assert_eq!(order(&store), ["r2", "r1", "r4", "r3"]);
    }

    #[test]
    fn message_store_reset_binds_room() {
        let mut store = MessageStore::new();
        store.reset("r1");
        store.push(msg("m1", "r1", 0));
        assert_eq!(store.room_id(), Some("r1"));
        assert_eq!(store.messages().len(), 1);

        store.reset("r2");
        assert_eq!(store.room_id(), Some("r2"));
        assert!(store.messages().is_empty());

        store.clear();
        assert_eq!(store.room_id(), None);
    }

    #[test]
    fn message_store_appends_after_history() {
        let mut store = MessageStore::new();
        store.reset("r1");
        store.replace(vec![msg("m1", "r1", 0), msg("m2", "r1", 1)]);
        store.push(Message::optimistic("r1", "hi"));
        assert_eq!(store.messages().len(), 3);
        assert!(store.messages()[2].is_optimistic());
    }
}
