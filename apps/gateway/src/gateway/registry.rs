//! Registry of live room sessions, used to close connections from outside
//! their own task.

use dashmap::DashMap;

use super::session::{CloseSignal, ConnectionSession};
use crate::error::GatewayError;

struct RegisteredSession {
    room_id: String,
    user_id: String,
    signal: CloseSignal,
}

/// Every admitted session, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, RegisteredSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an admitted session. `signal` is what [`close_user`](Self::close_user)
    /// fires to end it.
    pub fn register(&self, session: &ConnectionSession, user_id: &str, signal: CloseSignal) {
        self.sessions.insert(
            session.session_id.clone(),
            RegisteredSession {
                room_id: session.room_id.clone(),
                user_id: user_id.to_string(),
                signal,
            },
        );
    }

    pub fn unregister(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Ask every session of `user_id` in `room_id` to close with `reason`.
    /// Returns how many sessions were signalled.
    pub fn close_user(&self, room_id: &str, user_id: &str, reason: &GatewayError) -> usize {
        let mut closed = 0;
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.room_id == room_id
                && session.user_id == user_id
                && session.signal.close(reason.clone())
            {
                closed += 1;
            }
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
