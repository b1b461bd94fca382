use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::{message_reads, messages};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = messages)]
pub struct MessageRow {
    pub id: i64,
    pub room_id: String,
    pub sender_id: Option<String>,
    pub content: String,
    pub attachment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessageRow<'a> {
    pub id: i64,
    pub room_id: &'a str,
    pub sender_id: Option<&'a str>,
    pub content: &'a str,
    pub attachment: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = message_reads)]
pub struct NewMessageRead<'a> {
    pub message_id: i64,
    pub user_id: &'a str,
    pub read_at: DateTime<Utc>,
}
