//! Collaborator interfaces the gateway consumes: accounts, room membership,
//! and durable message storage.

pub mod memory;
pub mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Failures reported by a storage backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("room not found")]
    RoomNotFound,
    #[error("{0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for StoreError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        Self::Database(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// A resolved account: opaque id plus display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
}

/// A participant's role within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Admin => "admin",
        }
    }

    /// Parse a stored role; anything unrecognised is a plain member.
    pub fn parse(value: &str) -> Self {
        match value {
            "admin" => Role::Admin,
            _ => Role::Member,
        }
    }
}

/// A stored chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    #[serde(with = "message_id")]
    pub id: i64,
    pub room: String,
    /// `None` once the sender's account has been removed.
    pub sender: Option<UserIdentity>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub read_by: Vec<String>,
}

/// Input to [`MessageStore::append_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: String,
    pub sender: UserIdentity,
    pub content: String,
    pub attachment: Option<String>,
}

impl NewMessage {
    /// A message needs text, an attachment, or both.
    pub fn validate(&self) -> Result<(), StoreError> {
        let has_attachment = self.attachment.as_deref().is_some_and(|a| !a.is_empty());
        if self.content.trim().is_empty() && !has_attachment {
            return Err(StoreError::Validation(
                "Message needs content or an attachment".to_string(),
            ));
        }
        Ok(())
    }
}

/// Largest page `messages_for_room` will return.
pub const MAX_PAGE_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Read-only view of the account store.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// The identity for `user_id`, or `None` if unknown or deactivated.
    async fn find_active_user(&self, user_id: &str) -> Result<Option<UserIdentity>, StoreError>;
}

/// Answers room membership questions. Both operations fail with
/// `RoomNotFound` for an unknown room.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn is_active_participant(&self, room_id: &str, user_id: &str)
        -> Result<bool, StoreError>;

    async fn list_active_participants(&self, room_id: &str)
        -> Result<HashSet<String>, StoreError>;
}

/// Durable message storage.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message and point the room's last-message at it, atomically.
    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Add `user_id` to the message's readers. `Ok(false)` if the message
    /// does not exist.
    async fn mark_read(&self, message_id: i64, user_id: &str) -> Result<bool, StoreError>;

    /// Up to `limit` messages immediately before `before` (exclusive), or
    /// the latest ones, returned in creation order.
    async fn messages_for_room(
        &self,
        room_id: &str,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
}

/// Snowflake message ids travel as strings so JavaScript clients keep full
/// precision. Numbers are accepted on input.
pub mod message_id {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
            Raw::Number(n) => Ok(n),
        }
    }
}
