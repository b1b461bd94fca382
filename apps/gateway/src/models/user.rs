use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::users;
use crate::store::UserIdentity;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: String,
    pub username: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<User> for UserIdentity {
    fn from(user: User) -> Self {
        UserIdentity {
            id: user.id,
            name: user.username,
        }
    }
}
