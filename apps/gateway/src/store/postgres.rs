//! PostgreSQL-backed store (Diesel async + deadpool).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::OptionalExtension;
use diesel_async::AsyncConnection;
use roomcast_common::{snowflake_datetime, SnowflakeGenerator};
use scoped_futures::ScopedFutureExt;

use crate::db::pool::DbPool;
use crate::db::schema::{message_reads, messages, room_participants, rooms, users};
use crate::models::message::{MessageRow, NewMessageRead, NewMessageRow};
use crate::models::user::User;

use super::{
    Message, MessageStore, NewMessage, RoomDirectory, StoreError, UserDirectory, UserIdentity,
    MAX_PAGE_SIZE,
};

pub struct PgStore {
    db: DbPool,
    snowflake: SnowflakeGenerator,
}

impl PgStore {
    pub fn new(db: DbPool, worker_id: u16) -> Self {
        Self {
            db,
            snowflake: SnowflakeGenerator::new(worker_id),
        }
    }

    async fn require_room(
        &self,
        conn: &mut diesel_async::AsyncPgConnection,
        room_id: &str,
    ) -> Result<(), StoreError> {
        diesel_async::RunQueryDsl::get_result::<String>(
            rooms::table.find(room_id).select(rooms::id),
            conn,
        )
        .await
        .optional()?
        .map(|_| ())
        .ok_or(StoreError::RoomNotFound)
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn find_active_user(&self, user_id: &str) -> Result<Option<UserIdentity>, StoreError> {
        let mut conn = self.db.get().await?;

        let user: Option<User> = diesel_async::RunQueryDsl::get_result(
            users::table
                .find(user_id)
                .filter(users::is_active.eq(true))
                .select(User::as_select()),
            &mut conn,
        )
        .await
        .optional()?;

        Ok(user.map(UserIdentity::from))
    }
}

#[async_trait]
impl RoomDirectory for PgStore {
    async fn is_active_participant(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.db.get().await?;
        self.require_room(&mut conn, room_id).await?;

        let active = diesel_async::RunQueryDsl::get_result::<bool>(
            diesel::select(diesel::dsl::exists(
                room_participants::table
                    .filter(room_participants::room_id.eq(room_id))
                    .filter(room_participants::user_id.eq(user_id))
                    .filter(room_participants::is_active.eq(true)),
            )),
            &mut conn,
        )
        .await?;

        Ok(active)
    }

    async fn list_active_participants(
        &self,
        room_id: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.db.get().await?;
        self.require_room(&mut conn, room_id).await?;

        let ids: Vec<String> = diesel_async::RunQueryDsl::load(
            room_participants::table
                .filter(room_participants::room_id.eq(room_id))
                .filter(room_participants::is_active.eq(true))
                .select(room_participants::user_id),
            &mut conn,
        )
        .await?;

        Ok(ids.into_iter().collect())
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        message.validate()?;

        let mut conn = self.db.get().await?;
        let attachment = message.attachment.clone().filter(|a| !a.is_empty());
        let room_id = message.room_id.clone();
        let sender_id = message.sender.id.clone();
        let content = message.content.clone();
        let snowflake = &self.snowflake;

        let row = conn
            .transaction::<_, StoreError, _>(|conn| {
                async move {
                    // Lock the room row so concurrent appends to one room commit
                    // in id order and the last-message pointer only moves forward.
                    let locked: Option<String> = diesel_async::RunQueryDsl::get_result(
                        rooms::table
                            .find(&room_id)
                            .select(rooms::id)
                            .for_update(),
                        conn,
                    )
                    .await
                    .optional()?;

                    if locked.is_none() {
                        return Err(StoreError::RoomNotFound);
                    }

                    let id = snowflake.generate();
                    let created_at = snowflake_datetime(id);

                    let row: MessageRow = diesel_async::RunQueryDsl::get_result(
                        diesel::insert_into(messages::table)
                            .values(NewMessageRow {
                                id,
                                room_id: &room_id,
                                sender_id: Some(&sender_id),
                                content: &content,
                                attachment: attachment.as_deref(),
                                created_at,
                            })
                            .returning(MessageRow::as_returning()),
                        conn,
                    )
                    .await?;

                    diesel_async::RunQueryDsl::execute(
                        diesel::update(rooms::table.find(&room_id)).set((
                            rooms::last_message_id.eq(row.id),
                            rooms::updated_at.eq(created_at),
                        )),
                        conn,
                    )
                    .await?;

                    Ok(row)
                }
                .scope_boxed()
            })
            .await?;

        Ok(Message {
            id: row.id,
            room: row.room_id,
            sender: Some(message.sender),
            content: row.content,
            attachment: row.attachment,
            created_at: row.created_at,
            edited_at: row.edited_at,
            read_by: Vec::new(),
        })
    }

    async fn mark_read(&self, message_id: i64, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.db.get().await?;

        let exists: Option<i64> = diesel_async::RunQueryDsl::get_result(
            messages::table.find(message_id).select(messages::id),
            &mut conn,
        )
        .await
        .optional()?;

        if exists.is_none() {
            return Ok(false);
        }

        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(message_reads::table)
                .values(NewMessageRead {
                    message_id,
                    user_id,
                    read_at: Utc::now(),
                })
                .on_conflict_do_nothing(),
            &mut conn,
        )
        .await?;

        Ok(true)
    }

    async fn messages_for_room(
        &self,
        room_id: &str,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.db.get().await?;
        self.require_room(&mut conn, room_id).await?;

        let limit = limit.clamp(1, MAX_PAGE_SIZE) as i64;
        let before = before.unwrap_or(i64::MAX);

        let mut rows: Vec<MessageRow> = diesel_async::RunQueryDsl::load(
            messages::table
                .filter(messages::room_id.eq(room_id))
                .filter(messages::id.lt(before))
                .order(messages::id.desc())
                .limit(limit)
                .select(MessageRow::as_select()),
            &mut conn,
        )
        .await?;
        rows.reverse();

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let message_ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let sender_ids: Vec<String> = rows
            .iter()
            .filter_map(|r| r.sender_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let senders: HashMap<String, UserIdentity> = diesel_async::RunQueryDsl::load::<User>(
            users::table
                .filter(users::id.eq_any(&sender_ids))
                .select(User::as_select()),
            &mut conn,
        )
        .await?
        .into_iter()
        .map(|u| (u.id.clone(), UserIdentity::from(u)))
        .collect();

        let reads: Vec<(i64, String)> = diesel_async::RunQueryDsl::load(
            message_reads::table
                .filter(message_reads::message_id.eq_any(&message_ids))
                .order((message_reads::message_id.asc(), message_reads::user_id.asc()))
                .select((message_reads::message_id, message_reads::user_id)),
            &mut conn,
        )
        .await?;

        let mut readers: HashMap<i64, Vec<String>> = HashMap::new();
        for (message_id, user_id) in reads {
            readers.entry(message_id).or_default().push(user_id);
        }

        Ok(rows
            .into_iter()
            .map(|row| Message {
                sender: row.sender_id.as_ref().and_then(|id| senders.get(id).cloned()),
                read_by: readers.remove(&row.id).unwrap_or_default(),
                id: row.id,
                room: row.room_id,
                content: row.content,
                attachment: row.attachment,
                created_at: row.created_at,
                edited_at: row.edited_at,
            })
            .collect())
    }
}
