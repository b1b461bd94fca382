//! Wire envelopes for the room socket.
//!
//! Both directions are JSON objects tagged by a `kind` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::store::{message_id, Message, UserIdentity};

// ---------------------------------------------------------------------------
// Close codes
// ---------------------------------------------------------------------------

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
pub const CLOSE_UNAUTHORIZED: u16 = 4003;
pub const CLOSE_BACKPRESSURE: u16 = 4008;
pub const CLOSE_IDLE_TIMEOUT: u16 = 4009;

impl GatewayError {
    /// Close code used when this error ends a connection.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Unauthenticated => CLOSE_UNAUTHENTICATED,
            Self::Unauthorized => CLOSE_UNAUTHORIZED,
            Self::Backpressure => CLOSE_BACKPRESSURE,
            _ => CLOSE_INTERNAL_ERROR,
        }
    }
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Inbound events. Anything that fails to parse into one of these is dropped.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage {
        #[serde(default)]
        content: String,
        #[serde(default)]
        attachment: Option<String>,
    },
    Typing {
        #[serde(default = "default_active")]
        active: bool,
    },
    MarkRead {
        #[serde(with = "message_id")]
        message_id: i64,
    },
}

fn default_active() -> bool {
    true
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::Validation(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceAction {
    Joined,
    Left,
}

/// Body of a `new_message` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessagePayload {
    #[serde(with = "message_id")]
    pub id: i64,
    pub room: String,
    pub sender: UserIdentity,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessagePayload {
    /// Build the broadcast body for a freshly stored message. The sender is
    /// the author who just sent it, so it is always known here.
    pub fn new(message: Message, sender: UserIdentity) -> Self {
        Self {
            id: message.id,
            room: message.room,
            sender: message.sender.unwrap_or(sender),
            content: message.content,
            attachment: message.attachment,
            created_at: message.created_at,
        }
    }
}

/// Outbound events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(MessagePayload),
    Typing {
        user_id: String,
        active: bool,
    },
    Presence {
        user_id: String,
        action: PresenceAction,
    },
    ReadReceipt {
        #[serde(with = "message_id")]
        message_id: i64,
        user_id: String,
    },
    /// Sent only to the connection whose event failed.
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn presence(user_id: &str, action: PresenceAction) -> Self {
        Self::Presence {
            user_id: user_id.to_string(),
            action,
        }
    }

    pub fn error(err: &GatewayError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.client_message(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new_message",
            Self::Typing { .. } => "typing",
            Self::Presence { .. } => "presence",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::Error { .. } => "error",
        }
    }
}
