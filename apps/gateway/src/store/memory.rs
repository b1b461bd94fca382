//! In-process store used by tests and by deployments without a database.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use roomcast_common::{snowflake_datetime, SnowflakeGenerator};

use super::{
    Message, MessageStore, NewMessage, Role, RoomDirectory, StoreError, UserDirectory,
    UserIdentity, MAX_PAGE_SIZE,
};

struct UserRecord {
    identity: UserIdentity,
    active: bool,
}

struct ParticipantRecord {
    role: Role,
    active: bool,
}

#[derive(Default)]
struct RoomRecord {
    participants: HashMap<String, ParticipantRecord>,
    last_message_id: Option<i64>,
}

struct MessageRecord {
    room_id: String,
    sender_id: Option<String>,
    content: String,
    attachment: Option<String>,
    edited_at: Option<chrono::DateTime<chrono::Utc>>,
    read_by: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserRecord>,
    rooms: HashMap<String, RoomRecord>,
    /// Keyed by snowflake id, so iteration is creation order.
    messages: BTreeMap<i64, MessageRecord>,
}

/// Thread-safe in-memory implementation of every store trait.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    snowflake: SnowflakeGenerator,
}

impl MemoryStore {
    pub fn new(worker_id: u16) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            snowflake: SnowflakeGenerator::new(worker_id),
        }
    }

    // -- seeding ------------------------------------------------------------

    /// Insert or reactivate an account.
    pub fn insert_user(&self, id: &str, name: &str) {
        self.inner.write().users.insert(
            id.to_string(),
            UserRecord {
                identity: UserIdentity {
                    id: id.to_string(),
                    name: name.to_string(),
                },
                active: true,
            },
        );
    }

    pub fn deactivate_user(&self, id: &str) {
        if let Some(user) = self.inner.write().users.get_mut(id) {
            user.active = false;
        }
    }

    /// Remove an account entirely. Its messages keep a `None` sender.
    pub fn remove_user(&self, id: &str) {
        let mut inner = self.inner.write();
        inner.users.remove(id);
        for msg in inner.messages.values_mut() {
            if msg.sender_id.as_deref() == Some(id) {
                msg.sender_id = None;
            }
        }
    }

    pub fn insert_room(&self, id: &str) {
        self.inner
            .write()
            .rooms
            .entry(id.to_string())
            .or_default();
    }

    /// Add a participant, or reactivate an existing one with a new role.
    pub fn add_participant(&self, room_id: &str, user_id: &str, role: Role) {
        let mut inner = self.inner.write();
        let room = inner.rooms.entry(room_id.to_string()).or_default();
        room.participants.insert(
            user_id.to_string(),
            ParticipantRecord { role, active: true },
        );
    }

    /// Mark a participant inactive. The record itself is kept.
    pub fn deactivate_participant(&self, room_id: &str, user_id: &str) {
        if let Some(p) = self
            .inner
            .write()
            .rooms
            .get_mut(room_id)
            .and_then(|r| r.participants.get_mut(user_id))
        {
            p.active = false;
        }
    }

    // -- inspection ---------------------------------------------------------

    pub fn participant_role(&self, room_id: &str, user_id: &str) -> Option<Role> {
        self.inner
            .read()
            .rooms
            .get(room_id)?
            .participants
            .get(user_id)
            .map(|p| p.role)
    }

    pub fn last_message_id(&self, room_id: &str) -> Option<i64> {
        self.inner.read().rooms.get(room_id)?.last_message_id
    }

    pub fn message(&self, id: i64) -> Option<Message> {
        let inner = self.inner.read();
        inner.messages.get(&id).map(|m| to_message(&inner, id, m))
    }

    pub fn message_count(&self, room_id: &str) -> usize {
        self.inner
            .read()
            .messages
            .values()
            .filter(|m| m.room_id == room_id)
            .count()
    }
}

fn to_message(inner: &Inner, id: i64, record: &MessageRecord) -> Message {
    let sender = record
        .sender_id
        .as_ref()
        .and_then(|sid| inner.users.get(sid))
        .map(|u| u.identity.clone());

    Message {
        id,
        room: record.room_id.clone(),
        sender,
        content: record.content.clone(),
        attachment: record.attachment.clone(),
        created_at: snowflake_datetime(id),
        edited_at: record.edited_at,
        read_by: record.read_by.iter().cloned().collect(),
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_active_user(&self, user_id: &str) -> Result<Option<UserIdentity>, StoreError> {
        Ok(self
            .inner
            .read()
            .users
            .get(user_id)
            .filter(|u| u.active)
            .map(|u| u.identity.clone()))
    }
}

#[async_trait]
impl RoomDirectory for MemoryStore {
    async fn is_active_participant(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read();
        let room = inner.rooms.get(room_id).ok_or(StoreError::RoomNotFound)?;
        Ok(room.participants.get(user_id).is_some_and(|p| p.active))
    }

    async fn list_active_participants(
        &self,
        room_id: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let inner = self.inner.read();
        let room = inner.rooms.get(room_id).ok_or(StoreError::RoomNotFound)?;
        Ok(room
            .participants
            .iter()
            .filter(|(_, p)| p.active)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        message.validate()?;

        let mut inner = self.inner.write();
        if !inner.rooms.contains_key(&message.room_id) {
            return Err(StoreError::RoomNotFound);
        }

        // Generated under the write lock so id order matches insertion order.
        let id = self.snowflake.generate();
        let record = MessageRecord {
            room_id: message.room_id.clone(),
            sender_id: Some(message.sender.id.clone()),
            content: message.content,
            attachment: message.attachment.filter(|a| !a.is_empty()),
            edited_at: None,
            read_by: BTreeSet::new(),
        };

        if let Some(room) = inner.rooms.get_mut(&message.room_id) {
            room.last_message_id = Some(id);
        }
        inner.messages.insert(id, record);

        let stored = &inner.messages[&id];
        let mut out = to_message(&inner, id, stored);
        // The sender may not be a directory user (e.g. a seeded identity).
        out.sender.get_or_insert(message.sender);
        Ok(out)
    }

    async fn mark_read(&self, message_id: i64, user_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        match inner.messages.get_mut(&message_id) {
            Some(msg) => {
                msg.read_by.insert(user_id.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn messages_for_room(
        &self,
        room_id: &str,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read();
        if !inner.rooms.contains_key(room_id) {
            return Err(StoreError::RoomNotFound);
        }

        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let upper = before.unwrap_or(i64::MAX);
        let mut page: Vec<Message> = inner
            .messages
            .range(..upper)
            .rev()
            .filter(|(_, m)| m.room_id == room_id)
            .take(limit)
            .map(|(id, m)| to_message(&inner, *id, m))
            .collect();
        page.reverse();
        Ok(page)
    }
}
