//! Per-connection session state and guaranteed cleanup.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use roomcast_common::id::{prefix, prefixed_ulid};
use tokio::sync::Notify;

use super::bus::{BroadcastBus, SubscriptionHandle};
use super::events::{PresenceAction, ServerEvent};
use super::presence::PresenceTracker;
use super::registry::SessionRegistry;
use crate::error::GatewayError;
use crate::store::UserIdentity;

/// Lifecycle of a room connection.
///
/// `Connecting -> Authorizing -> Active -> Closing -> Closed`. Admission can
/// fail straight from `Authorizing` to `Closed`, and a connection that drops
/// before authorizing goes directly to `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authorizing,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authorizing)
                | (Connecting, Closing)
                | (Authorizing, Active)
                | (Authorizing, Closing)
                | (Authorizing, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authorizing => "authorizing",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// State for a single room connection.
pub struct ConnectionSession {
    /// Unique session identifier (`ses_` prefixed ULID).
    pub session_id: String,
    pub room_id: String,
    state: Mutex<SessionState>,
    /// Set once, when admission succeeds.
    user: OnceLock<UserIdentity>,
}

impl ConnectionSession {
    pub fn new(room_id: &str) -> Self {
        Self {
            session_id: prefixed_ulid(prefix::SESSION),
            room_id: room_id.to_string(),
            state: Mutex::new(SessionState::Connecting),
            user: OnceLock::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn transition(&self, next: SessionState) -> Result<(), InvalidTransition> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: *state,
                to: next,
            });
        }
        tracing::trace!(session_id = %self.session_id, from = %*state, to = %next, "session transition");
        *state = next;
        Ok(())
    }

    /// Bind the admitted user and move to `Active`.
    pub fn activate(&self, user: UserIdentity) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Active)?;
        let _ = self.user.set(user);
        Ok(())
    }

    pub fn user(&self) -> Option<&UserIdentity> {
        self.user.get()
    }
}

/// One-shot request to close a connection from outside its own task.
///
/// The first [`close`](Self::close) wins; later reasons are ignored. Clones
/// share the same signal.
#[derive(Clone, Default)]
pub struct CloseSignal {
    inner: Arc<CloseInner>,
}

#[derive(Default)]
struct CloseInner {
    reason: OnceLock<GatewayError>,
    notify: Notify,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call set the reason.
    pub fn close(&self, reason: GatewayError) -> bool {
        let first = self.inner.reason.set(reason).is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn reason(&self) -> Option<&GatewayError> {
        self.inner.reason.get()
    }

    /// Resolves once a reason has been set.
    pub async fn closed(&self) -> &GatewayError {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.inner.reason.get() {
                return reason;
            }
            notified.await;
        }
    }
}

/// Releases an admitted session's bus subscription, presence entry and
/// registry slot.
///
/// Runs on [`release`](Self::release) or on drop, whichever comes first, so
/// cleanup also happens when the connection task is aborted or panics.
pub struct SessionGuard {
    bus: Arc<dyn BroadcastBus>,
    presence: Arc<PresenceTracker>,
    sessions: Arc<SessionRegistry>,
    handle: SubscriptionHandle,
    room_id: String,
    user_id: String,
    session_id: String,
    released: bool,
}

impl SessionGuard {
    pub fn new(
        bus: Arc<dyn BroadcastBus>,
        presence: Arc<PresenceTracker>,
        sessions: Arc<SessionRegistry>,
        handle: SubscriptionHandle,
        session: &ConnectionSession,
        user_id: &str,
    ) -> Self {
        Self {
            bus,
            presence,
            sessions,
            handle,
            room_id: session.room_id.clone(),
            user_id: user_id.to_string(),
            session_id: session.session_id.clone(),
            released: false,
        }
    }

    /// Unsubscribe, leave presence, and announce `left` if this was the
    /// user's last session in the room. Runs at most once.
    pub fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }

        // Unsubscribe first so this session never sees its own `left`.
        self.bus.unsubscribe(&self.handle);
        self.sessions.unregister(&self.session_id);
        if self.presence.leave(&self.room_id, &self.user_id, &self.session_id) {
            let event = ServerEvent::presence(&self.user_id, PresenceAction::Left);
            self.bus.publish(&self.room_id, Arc::new(event));
        }
        tracing::debug!(
            session_id = %self.session_id,
            room_id = %self.room_id,
            user_id = %self.user_id,
            "session released"
        );
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}
