//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::error::GatewayError;
use crate::store::{StoreError, UserIdentity};
use crate::AppState;

use super::bus::{Envelope, RecvError, Subscription};
use super::events::{ClientEvent, PresenceAction, ServerEvent, CLOSE_IDLE_TIMEOUT, CLOSE_NORMAL};
use super::handler;
use super::session::{CloseSignal, ConnectionSession, SessionGuard, SessionState};

/// Frames queued for one connection outside the bus (errors, pings, close).
const DIRECT_QUEUE: usize = 32;

/// How long the writer gets to flush a close frame before it is aborted.
const WRITER_SHUTDOWN: Duration = Duration::from_secs(2);

/// A single socket write that takes longer than this ends the connection.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/rooms/{room_id}", get(ws_upgrade))
}

/// Query parameters on the upgrade request. `access` is accepted as an
/// alias for `token`.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub access: Option<String>,
}

impl ConnectParams {
    fn credential(self) -> Option<String> {
        self.token.or(self.access)
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(room_id): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, room_id, params.credential()))
}

/// Outbound traffic that bypasses the bus.
enum Outbound {
    Event(Envelope),
    Ping,
    Close(u16, String),
}

async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    room_id: String,
    credential: Option<String>,
) {
    let (mut ws_tx, ws_rx) = socket.split();
    let session = Arc::new(ConnectionSession::new(&room_id));
    let _ = session.transition(SessionState::Authorizing);

    let user = match handler::admit(&state, &room_id, credential.as_deref()).await {
        Ok(user) => user,
        Err(err) => {
            if let GatewayError::Store(StoreError::Database(_)) = &err {
                tracing::error!(session_id = %session.session_id, %room_id, %err, "admission failed");
            } else {
                tracing::debug!(session_id = %session.session_id, %room_id, code = err.code(), "connection refused");
            }
            let _ = send_close(&mut ws_tx, err.close_code(), &err.client_message()).await;
            let _ = session.transition(SessionState::Closed);
            return;
        }
    };

    // Subscribe before announcing so the new session sees its own `joined`.
    let subscription = state.bus.subscribe(&room_id);
    let signal = subscription.close_signal();
    let mut guard = SessionGuard::new(
        state.bus.clone(),
        state.presence.clone(),
        state.sessions.clone(),
        subscription.handle().clone(),
        &session,
        &user.id,
    );
    if let Err(err) = session.activate(user.clone()) {
        tracing::warn!(session_id = %session.session_id, %err, "session could not activate");
        return;
    }
    state.sessions.register(&session, &user.id, signal.clone());
    if state.presence.join(&room_id, &user.id, &session.session_id) {
        let joined = ServerEvent::presence(&user.id, PresenceAction::Joined);
        state.bus.publish(&room_id, Arc::new(joined));
    }

    tracing::info!(
        session_id = %session.session_id,
        user_id = %user.id,
        %room_id,
        "room session established"
    );

    let (direct_tx, direct_rx) = mpsc::channel(DIRECT_QUEUE);
    let writer = tokio::spawn(write_loop(session.clone(), ws_tx, direct_rx, subscription));

    run_session(&state, &session, &user, ws_rx, direct_tx, writer, &signal, &mut guard).await;

    let _ = session.transition(SessionState::Closed);

    tracing::info!(
        session_id = %session.session_id,
        user_id = %user.id,
        %room_id,
        "room session ended"
    );
}

/// Reader side: dispatch inbound events, send keepalive pings, enforce the
/// idle timeout, and stop as soon as either half of the connection ends or
/// the session is told to close.
///
/// The guard is released as soon as the loop ends, before waiting on the
/// writer, so a stalled socket never holds up presence cleanup.
#[allow(clippy::too_many_arguments)]
async fn run_session(
    state: &AppState,
    session: &ConnectionSession,
    user: &UserIdentity,
    mut ws_rx: WsStream,
    direct_tx: mpsc::Sender<Outbound>,
    mut writer: tokio::task::JoinHandle<()>,
    signal: &CloseSignal,
    guard: &mut SessionGuard,
) {
    let idle_timeout = state.config.idle_timeout;
    let ping_interval = state.config.ping_interval;
    let mut ping = time::interval_at(Instant::now() + ping_interval, ping_interval);
    let idle = time::sleep(idle_timeout);
    tokio::pin!(idle);
    let mut writer_done = false;

    let close = loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::debug!(?e, session_id = %session.session_id, "ws read error");
                        break None;
                    }
                    None => break None,
                };
                idle.as_mut().reset(Instant::now() + idle_timeout);

                match frame {
                    Message::Text(text) => {
                        dispatch(state, session, user, &direct_tx, text.as_str()).await;
                    }
                    Message::Close(_) => break Some((CLOSE_NORMAL, String::new())),
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
                }
            }

            _ = ping.tick() => {
                let _ = direct_tx.try_send(Outbound::Ping);
            }

            _ = &mut idle => {
                tracing::debug!(session_id = %session.session_id, "idle timeout, closing connection");
                break Some((CLOSE_IDLE_TIMEOUT, "Idle timeout".to_string()));
            }

            reason = signal.closed() => {
                tracing::info!(session_id = %session.session_id, code = reason.code(), "closing session on request");
                break Some((reason.close_code(), reason.client_message()));
            }

            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break None;
            }
        }
    };

    let _ = session.transition(SessionState::Closing);
    guard.release();

    if writer_done {
        return;
    }
    let shutdown = async {
        if let Some((code, reason)) = close {
            let _ = direct_tx.send(Outbound::Close(code, reason)).await;
        }
        drop(direct_tx);
        let _ = (&mut writer).await;
    };
    if time::timeout(WRITER_SHUTDOWN, shutdown).await.is_err() {
        tracing::debug!(session_id = %session.session_id, "writer did not stop in time, aborting");
        writer.abort();
    }
}

/// Parse and apply one inbound text frame. Failures go back to this
/// connection only.
async fn dispatch(
    state: &AppState,
    session: &ConnectionSession,
    user: &UserIdentity,
    direct_tx: &mpsc::Sender<Outbound>,
    text: &str,
) {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(session_id = %session.session_id, %err, "dropping malformed event");
            return;
        }
    };

    if let Err(err) = handler::handle_event(state, session, user, event).await {
        match &err {
            GatewayError::Store(StoreError::Database(_)) => {
                tracing::error!(session_id = %session.session_id, %err, "event failed");
            }
            _ => tracing::debug!(session_id = %session.session_id, %err, "event rejected"),
        }
        let _ = direct_tx
            .send(Outbound::Event(Arc::new(ServerEvent::error(&err))))
            .await;
    }
}

/// Writer side: owns the socket sink and drains direct frames and the bus
/// subscription. Direct frames win ties so a close is never stuck behind
/// room traffic. Once the subscription ends the reader decides the close
/// code, so the writer only drains direct frames from then on.
async fn write_loop(
    session: Arc<ConnectionSession>,
    mut ws_tx: WsSink,
    mut direct_rx: mpsc::Receiver<Outbound>,
    mut subscription: Subscription,
) {
    let mut subscribed = true;
    loop {
        tokio::select! {
            biased;

            outbound = direct_rx.recv() => match outbound {
                Some(Outbound::Event(envelope)) => {
                    if send_event(&mut ws_tx, &envelope).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if send_frame(&mut ws_tx, Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close(code, reason)) => {
                    let _ = send_close(&mut ws_tx, code, &reason).await;
                    break;
                }
                None => break,
            },

            result = subscription.recv(), if subscribed => match result {
                Ok(envelope) => {
                    if !session.is_active() {
                        continue;
                    }
                    if send_event(&mut ws_tx, &envelope).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Backpressure) => {
                    tracing::warn!(session_id = %session.session_id, "closing connection for backpressure");
                    let err = GatewayError::Backpressure;
                    let _ = send_close(&mut ws_tx, err.close_code(), &err.client_message()).await;
                    break;
                }
                Err(RecvError::Unsubscribed) => subscribed = false,
            },
        }
    }
    subscription.unsubscribe();
}

async fn send_event(ws_tx: &mut WsSink, event: &ServerEvent) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(?e, kind = event.kind(), "failed to serialize event");
            return Ok(());
        }
    };
    send_frame(ws_tx, Message::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    send_frame(ws_tx, close_msg).await
}

async fn send_frame(ws_tx: &mut WsSink, msg: Message) -> Result<(), axum::Error> {
    match time::timeout(SEND_TIMEOUT, ws_tx.send(msg)).await {
        Ok(result) => result,
        Err(elapsed) => Err(axum::Error::new(elapsed)),
    }
}
