//! Admission and inbound event dispatch.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::store::{NewMessage, StoreError, UserIdentity};
use crate::AppState;

use super::events::{ClientEvent, MessagePayload, PresenceAction, ServerEvent};
use super::session::ConnectionSession;

/// Authenticate `credential` and authorize its user for `room_id`.
///
/// A missing room is reported as `Unauthorized` so a client cannot discover
/// which rooms exist.
pub async fn admit(
    state: &AppState,
    room_id: &str,
    credential: Option<&str>,
) -> Result<UserIdentity, GatewayError> {
    let credential = credential
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or(GatewayError::Unauthenticated)?;

    let user = state.tokens.resolve(credential).await?;

    match state.rooms.is_active_participant(room_id, &user.id).await {
        Ok(true) => Ok(user),
        Ok(false) | Err(StoreError::RoomNotFound) => {
            tracing::debug!(user_id = %user.id, %room_id, "connection refused: not a participant");
            Err(GatewayError::Unauthorized)
        }
        Err(err) => Err(err.into()),
    }
}

/// Apply one inbound event from an active session.
///
/// Errors are local to the calling connection: nothing is published when
/// an event fails.
pub async fn handle_event(
    state: &AppState,
    session: &ConnectionSession,
    user: &UserIdentity,
    event: ClientEvent,
) -> Result<(), GatewayError> {
    match event {
        ClientEvent::SendMessage {
            content,
            attachment,
        } => send_message(state, session, user, content, attachment).await,
        ClientEvent::Typing { active } => {
            let event = ServerEvent::Typing {
                user_id: user.id.clone(),
                active,
            };
            state.bus.publish(&session.room_id, Arc::new(event));
            Ok(())
        }
        ClientEvent::MarkRead { message_id } => {
            if !state.messages.mark_read(message_id, &user.id).await? {
                return Err(GatewayError::NotFound("message"));
            }
            if state.config.broadcast_read_receipts {
                let event = ServerEvent::ReadReceipt {
                    message_id,
                    user_id: user.id.clone(),
                };
                state.bus.publish(&session.room_id, Arc::new(event));
            }
            Ok(())
        }
    }
}

/// Drop presence for users no longer in `active` and disconnect their
/// sessions with `Unauthorized`. Each removed user is announced as `left`
/// exactly once. Returns the removed users.
pub fn revoke_stale_presence(
    state: &AppState,
    room_id: &str,
    active: &HashSet<String>,
) -> Vec<String> {
    let removed = state.presence.reconcile(room_id, active);
    for user_id in &removed {
        let left = ServerEvent::presence(user_id, PresenceAction::Left);
        state.bus.publish(room_id, Arc::new(left));
        let closed = state
            .sessions
            .close_user(room_id, user_id, &GatewayError::Unauthorized);
        tracing::info!(%room_id, %user_id, closed, "revoked participant disconnected");
    }
    removed
}

async fn send_message(
    state: &AppState,
    session: &ConnectionSession,
    user: &UserIdentity,
    content: String,
    attachment: Option<String>,
) -> Result<(), GatewayError> {
    let content = content.trim().to_string();
    let attachment = attachment.filter(|a| !a.trim().is_empty());

    if content.is_empty() && attachment.is_none() {
        tracing::debug!(session_id = %session.session_id, "empty message ignored");
        return Ok(());
    }
    let max = state.config.max_message_len;
    if content.chars().count() > max {
        return Err(GatewayError::Validation(format!(
            "Message content exceeds {max} characters"
        )));
    }

    let message = state
        .messages
        .append_message(NewMessage {
            room_id: session.room_id.clone(),
            sender: user.clone(),
            content,
            attachment,
        })
        .await?;

    let payload = MessagePayload::new(message, user.clone());
    state
        .bus
        .publish(&session.room_id, Arc::new(ServerEvent::NewMessage(payload)));
    Ok(())
}
