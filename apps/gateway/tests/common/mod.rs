#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use roomcast_gateway::config::Config;
use roomcast_gateway::store::{
    Message as StoredMessage, MemoryStore, MessageStore, NewMessage, Role, RoomDirectory,
    StoreError, UserDirectory, UserIdentity,
};
use roomcast_gateway::AppState;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TEST_SECRET: &str = "integration-test-secret";

pub fn test_config() -> Config {
    Config::new(TEST_SECRET)
}

/// Build a test AppState over a fresh in-memory store.
pub fn test_state(config: Config) -> (AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new(config.worker_id));
    (AppState::new(config, store.clone()), store)
}

/// Build the full application router wired to the test state.
pub fn test_app(config: Config) -> (Router, AppState, Arc<MemoryStore>) {
    let (state, store) = test_state(config);
    let app = roomcast_gateway::routes::router().with_state(state.clone());
    (app, state, store)
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background for the rest of the test.
pub async fn start_server(config: Config) -> (SocketAddr, AppState, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new(config.worker_id));
    let (addr, state) = start_server_with(config, store.clone()).await;
    (addr, state, store)
}

/// Like [`start_server`], over any store.
pub async fn start_server_with<S>(config: Config, store: Arc<S>) -> (SocketAddr, AppState)
where
    S: UserDirectory + RoomDirectory + MessageStore + 'static,
{
    let state = AppState::new(config, store);
    let app = roomcast_gateway::routes::router().with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

/// A [`MemoryStore`] whose membership checks or message writes can be made
/// to fail with a database error.
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_membership: AtomicBool,
    pub fail_appends: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(0),
            fail_membership: AtomicBool::new(false),
            fail_appends: AtomicBool::new(false),
        }
    }

    fn injected() -> StoreError {
        StoreError::Database("injected failure".to_string())
    }
}

#[async_trait]
impl UserDirectory for FlakyStore {
    async fn find_active_user(&self, user_id: &str) -> Result<Option<UserIdentity>, StoreError> {
        self.inner.find_active_user(user_id).await
    }
}

#[async_trait]
impl RoomDirectory for FlakyStore {
    async fn is_active_participant(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<bool, StoreError> {
        if self.fail_membership.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.is_active_participant(room_id, user_id).await
    }

    async fn list_active_participants(
        &self,
        room_id: &str,
    ) -> Result<HashSet<String>, StoreError> {
        if self.fail_membership.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.list_active_participants(room_id).await
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn append_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.append_message(message).await
    }

    async fn mark_read(&self, message_id: i64, user_id: &str) -> Result<bool, StoreError> {
        self.inner.mark_read(message_id, user_id).await
    }

    async fn messages_for_room(
        &self,
        room_id: &str,
        before: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.messages_for_room(room_id, before, limit).await
    }
}

/// Mint an access token valid for five minutes.
pub fn mint_token(user_id: &str) -> String {
    let exp = (chrono::Utc::now() + chrono::Duration::seconds(300)).timestamp();
    sign(&serde_json::json!({ "user_id": user_id, "exp": exp, "token_type": "access" }))
}

/// Mint an access token that expired five minutes ago.
pub fn mint_expired_token(user_id: &str) -> String {
    let exp = (chrono::Utc::now() - chrono::Duration::seconds(300)).timestamp();
    sign(&serde_json::json!({ "user_id": user_id, "exp": exp, "token_type": "access" }))
}

fn sign(claims: &Value) -> String {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("mint test token")
}

/// Seed `room_id` with the given `(user_id, name)` members plus one outsider
/// account (`usr_out`) that belongs to no room.
pub fn seed_room(store: &MemoryStore, room_id: &str, members: &[(&str, &str)]) {
    store.insert_room(room_id);
    for (id, name) in members {
        store.insert_user(id, name);
        store.add_participant(room_id, id, Role::Member);
    }
    store.insert_user("usr_out", "outsider");
}

/// Open a room socket. The upgrade always succeeds; refusals arrive as a
/// close frame.
pub async fn connect(addr: SocketAddr, room_id: &str, token: Option<&str>) -> Ws {
    let url = match token {
        Some(token) => format!("ws://{addr}/ws/rooms/{room_id}?token={token}"),
        None => format!("ws://{addr}/ws/rooms/{room_id}"),
    };
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    ws
}

/// Connect as `user_id` and wait for the server to acknowledge with our
/// own `presence joined`.
pub async fn join(addr: SocketAddr, room_id: &str, user_id: &str) -> Ws {
    let mut ws = connect(addr, room_id, Some(&mint_token(user_id))).await;
    let joined = next_event(&mut ws, "presence").await;
    assert_eq!(joined["user_id"], user_id);
    assert_eq!(joined["action"], "joined");
    ws
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

/// Next JSON text frame, skipping pings and pongs.
pub async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("parse event"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Next event of the given kind, skipping everything else.
pub async fn next_event(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let event = next_json(ws).await;
        if event["kind"] == kind {
            return event;
        }
    }
}

/// Assert nothing but pings arrives within `wait`.
pub async fn expect_silence(ws: &mut Ws, wait: Duration) {
    let deadline = time::Instant::now() + wait;
    loop {
        match time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected no events, got {other:?}"),
        }
    }
}

/// Read until the server's close frame and return its code.
pub async fn expect_close_code(ws: &mut Ws) -> u16 {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close");

        match msg {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(Message::Close(None))) => return u16::from(CloseCode::Status),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("ws error before close frame: {e}"),
            None => panic!("stream ended without close frame"),
        }
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(check: impl FnMut() -> bool) -> bool {
    eventually_within(Duration::from_secs(2), check).await
}

/// Poll `check` every 20ms until it holds or `limit` passes.
pub async fn eventually_within(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = time::Instant::now() + limit;
    while time::Instant::now() < deadline {
        if check() {
            return true;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
