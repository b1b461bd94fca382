//! Read-only room endpoints: message history and who's connected.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::gateway::handler;
use crate::store::{Message, StoreError, MAX_PAGE_SIZE};
use crate::AppState;

const DEFAULT_PAGE_SIZE: usize = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms/{room_id}/messages", get(list_messages))
        .route("/rooms/{room_id}/presence", get(room_presence))
}

/// 403 unless `user_id` is an active participant. A missing room is
/// indistinguishable from one the caller doesn't belong to.
async fn require_participant(
    state: &AppState,
    room_id: &str,
    user_id: &str,
) -> Result<(), ApiError> {
    match state.rooms.is_active_participant(room_id, user_id).await {
        Ok(true) => Ok(()),
        Ok(false) | Err(StoreError::RoomNotFound) => {
            Err(ApiError::forbidden("Not a participant of this room"))
        }
        Err(err) => Err(err.into()),
    }
}

// ---------------------------------------------------------------------------
// GET /api/v1/rooms/{room_id}/messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    /// Message id cursor (exclusive).
    pub before: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListMessagesResponse {
    pub data: Vec<Message>,
    pub has_more: bool,
}

async fn list_messages(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(params): Query<ListMessagesQuery>,
) -> Result<Json<ListMessagesResponse>, ApiError> {
    require_participant(&state, &room_id, &user.id).await?;

    let before = params
        .before
        .as_deref()
        .map(|b| b.trim().parse::<i64>())
        .transpose()
        .map_err(|_| ApiError::bad_request("`before` must be a message id"))?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let data = state
        .messages
        .messages_for_room(&room_id, before, limit)
        .await?;

    // Probe for one older message to decide `has_more`.
    let has_more = match data.first() {
        Some(oldest) if data.len() == limit => !state
            .messages
            .messages_for_room(&room_id, Some(oldest.id), 1)
            .await?
            .is_empty(),
        _ => false,
    };

    Ok(Json(ListMessagesResponse { data, has_more }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/rooms/{room_id}/presence
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub room_id: String,
    pub online: Vec<String>,
}

async fn room_presence(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<PresenceResponse>, ApiError> {
    require_participant(&state, &room_id, &user.id).await?;

    let active = state.rooms.list_active_participants(&room_id).await?;
    handler::revoke_stale_presence(&state, &room_id, &active);

    Ok(Json(PresenceResponse {
        online: state.presence.online_users(&room_id),
        room_id,
    }))
}
