//! In-memory per-room presence tracking with multi-session support.
//!
//! Presence is per-**user**, not per-session: a user connected from two tabs
//! stays present until the last of those sessions leaves. Nothing here is
//! durable; a restart starts from empty.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;

/// Thread-safe, DashMap-backed presence tracker.
///
/// All mutation goes through [`join`](Self::join) and [`leave`](Self::leave)
/// (plus [`reconcile`](Self::reconcile) for membership revocations).
#[derive(Default)]
pub struct PresenceTracker {
    /// room -> user -> live session ids
    rooms: DashMap<String, HashMap<String, HashSet<String>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `session_id` for `user_id` in `room_id`.
    ///
    /// Returns `true` if the user was not present before, so the caller can
    /// broadcast `joined`.
    pub fn join(&self, room_id: &str, user_id: &str, session_id: &str) -> bool {
        let mut room = self.rooms.entry(room_id.to_string()).or_default();
        let sessions = room.entry(user_id.to_string()).or_default();
        let became_present = sessions.is_empty();
        sessions.insert(session_id.to_string());
        became_present
    }

    /// Forget `session_id`.
    ///
    /// Returns `true` if that was the user's last session in the room, so
    /// the caller can broadcast `left`. Leaving twice is a no-op.
    pub fn leave(&self, room_id: &str, user_id: &str, session_id: &str) -> bool {
        let went_absent = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return false;
            };
            let Some(sessions) = room.get_mut(user_id) else {
                return false;
            };
            if !sessions.remove(session_id) {
                return false;
            }
            let empty = sessions.is_empty();
            if empty {
                room.remove(user_id);
            }
            empty
        };
        self.rooms.remove_if(room_id, |_, users| users.is_empty());
        went_absent
    }

    pub fn contains(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.contains_key(user_id))
    }

    /// Users currently connected to `room_id`, sorted.
    pub fn online_users(&self, room_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .rooms
            .get(room_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Drop presence for users who are no longer active participants.
    /// Returns the users removed.
    pub fn reconcile(&self, room_id: &str, active: &HashSet<String>) -> Vec<String> {
        let mut removed = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return Vec::new();
            };
            let stale: Vec<String> = room
                .keys()
                .filter(|user_id| !active.contains(*user_id))
                .cloned()
                .collect();
            for user_id in &stale {
                room.remove(user_id);
            }
            stale
        };
        self.rooms.remove_if(room_id, |_, users| users.is_empty());
        removed.sort();
        removed
    }
}
