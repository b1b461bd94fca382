use std::time::Duration;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string. Without one the gateway runs on the
    /// in-memory store.
    pub database_url: Option<String>,
    /// HS256 secret shared with the account service that issues access tokens.
    pub jwt_secret: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Envelopes queued per subscriber before it is dropped for backpressure.
    pub subscriber_buffer: usize,
    /// A connection with no inbound frame for this long is closed.
    pub idle_timeout: Duration,
    /// How often the server pings each connection.
    pub ping_interval: Duration,
    /// Broadcast `read_receipt` events after a successful `mark_read`.
    pub broadcast_read_receipts: bool,
    /// Snowflake worker id for message ids (0..1024).
    pub worker_id: u16,
    /// Maximum message content length, in characters.
    pub max_message_len: usize,
}

impl Config {
    /// Defaults for everything except the signing secret.
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            database_url: None,
            jwt_secret: jwt_secret.into(),
            port: 4100,
            subscriber_buffer: 256,
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(25),
            broadcast_read_receipts: false,
            worker_id: 0,
            max_message_len: 4000,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = Self::new(required_var("JWT_SECRET"));
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            port: parsed_var("PORT").unwrap_or(defaults.port),
            subscriber_buffer: parsed_var::<usize>("SUBSCRIBER_BUFFER")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.subscriber_buffer),
            idle_timeout: seconds_var("IDLE_TIMEOUT_SECS").unwrap_or(defaults.idle_timeout),
            ping_interval: seconds_var("PING_INTERVAL_SECS").unwrap_or(defaults.ping_interval),
            broadcast_read_receipts: parsed_var("BROADCAST_READ_RECEIPTS")
                .unwrap_or(defaults.broadcast_read_receipts),
            worker_id: parsed_var::<u16>("WORKER_ID")
                .filter(|id| *id < 1024)
                .unwrap_or(defaults.worker_id),
            max_message_len: parsed_var("MAX_MESSAGE_LEN").unwrap_or(defaults.max_message_len),
            ..defaults
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// A whole number of seconds. Zero is rejected because timers cannot tick
/// on a zero period.
fn seconds_var(name: &str) -> Option<Duration> {
    parsed_var::<u64>(name)
        .filter(|n| *n > 0)
        .map(Duration::from_secs)
}
