use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Gateway errors
// ---------------------------------------------------------------------------

/// Failure kinds raised while admitting a connection or applying an event.
///
/// Credential problems are deliberately collapsed into `Unauthenticated`; the
/// connecting client only ever learns the close code.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("not authorized for this room")]
    Unauthorized,
    #[error("invalid event: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("subscriber dropped for backpressure")]
    Backpressure,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GatewayError {
    /// Stable machine-readable code carried in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Validation(_) | Self::Store(StoreError::Validation(_)) => "VALIDATION_ERROR",
            Self::NotFound(_) | Self::Store(StoreError::RoomNotFound) => "NOT_FOUND",
            Self::Backpressure => "BACKPRESSURE",
            Self::Store(StoreError::Database(_)) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show the initiating client.
    pub fn client_message(&self) -> String {
        match self {
            Self::Store(StoreError::Database(_)) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP errors
// ---------------------------------------------------------------------------

/// Structured API error returned to clients.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND".to_string(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED".to_string(),
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "FORBIDDEN".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RoomNotFound => Self::not_found("Room not found"),
            StoreError::Validation(message) => Self::bad_request(message),
            StoreError::Database(err) => {
                tracing::error!(%err, "store error");
                Self::internal("An internal error occurred")
            }
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Unauthenticated => Self::unauthorized("Invalid or expired token"),
            GatewayError::Unauthorized => Self::forbidden("Not a participant of this room"),
            GatewayError::Validation(message) => Self::bad_request(message),
            GatewayError::NotFound(what) => Self::not_found(format!("{what} not found")),
            GatewayError::Backpressure => Self::internal("An internal error occurred"),
            GatewayError::Store(err) => err.into(),
        }
    }
}
