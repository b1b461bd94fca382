use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;

pub type DbPool = Pool<AsyncPgConnection>;

/// Connections held by the message store. Each in-flight `send_message` or
/// `mark_read` holds one for the duration of its transaction.
const MAX_CONNECTIONS: usize = 20;

/// Create the async connection pool backing [`PgStore`](crate::store::PgStore).
pub async fn connect(database_url: &str) -> DbPool {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder(manager)
        .max_size(MAX_CONNECTIONS)
        .build()
        .expect("failed to build connection pool");

    tracing::info!(max_size = MAX_CONNECTIONS, "database pool created");

    pool
}
