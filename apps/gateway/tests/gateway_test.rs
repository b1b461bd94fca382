mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use roomcast_gateway::gateway::events::ServerEvent;
use roomcast_gateway::gateway::handler;

use common::{
    connect, eventually, eventually_within, expect_close_code, expect_silence, join,
    mint_expired_token, mint_token, next_event, next_json, seed_room, send_json, start_server,
    start_server_with, test_config, FlakyStore,
};

const ROOM: &str = "room_r1";

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn participant_is_admitted_and_sees_own_join() {
    let (addr, state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice")]);

    let _ws = join(addr, ROOM, "usr_a").await;

    assert!(state.presence.contains(ROOM, "usr_a"));
    assert_eq!(state.bus.subscriber_count(ROOM), 1);
}

#[tokio::test]
async fn non_participant_is_refused_as_unauthorized() {
    let (addr, state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice")]);

    let mut ws = connect(addr, ROOM, Some(&mint_token("usr_out"))).await;
    assert_eq!(expect_close_code(&mut ws).await, 4003);

    assert_eq!(state.bus.subscriber_count(ROOM), 0);
    assert!(!state.presence.contains(ROOM, "usr_out"));
}

#[tokio::test]
async fn inactive_participant_and_unknown_room_are_unauthorized() {
    let (addr, _state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_b", "bob")]);
    store.deactivate_participant(ROOM, "usr_b");

    let mut ws = connect(addr, ROOM, Some(&mint_token("usr_b"))).await;
    assert_eq!(expect_close_code(&mut ws).await, 4003);

    let mut ws = connect(addr, "room_missing", Some(&mint_token("usr_a"))).await;
    assert_eq!(expect_close_code(&mut ws).await, 4003);
}

#[tokio::test]
async fn bad_credentials_are_unauthenticated() {
    let (addr, state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_gone", "gone")]);
    store.deactivate_user("usr_gone");

    for token in [
        Some(mint_expired_token("usr_a")),
        Some("garbage".to_string()),
        Some(mint_token("usr_gone")),
        None,
    ] {
        let mut ws = connect(addr, ROOM, token.as_deref()).await;
        assert_eq!(expect_close_code(&mut ws).await, 4001);
    }
    assert_eq!(state.bus.subscriber_count(ROOM), 0);
}

#[tokio::test]
async fn access_query_param_is_accepted() {
    let (addr, state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice")]);

    let url = format!("ws://{addr}/ws/rooms/{ROOM}?access={}", mint_token("usr_a"));
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    let joined = next_event(&mut ws, "presence").await;
    assert_eq!(joined["user_id"], "usr_a");
    assert!(state.presence.contains(ROOM, "usr_a"));
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn message_fans_out_to_every_participant_including_sender() {
    let (addr, _state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_c", "carol")]);

    let mut a = join(addr, ROOM, "usr_a").await;
    let mut c = join(addr, ROOM, "usr_c").await;

    send_json(&mut a, json!({ "kind": "send_message", "content": "hi" })).await;

    for ws in [&mut a, &mut c] {
        let event = next_event(ws, "new_message").await;
        assert_eq!(event["content"], "hi");
        assert_eq!(event["room"], ROOM);
        assert_eq!(event["sender"]["id"], "usr_a");
        assert_eq!(event["sender"]["name"], "alice");
        assert!(event["created_at"].is_string());
        assert!(event["id"].is_string());
    }
    assert_eq!(store.message_count(ROOM), 1);
}

#[tokio::test]
async fn empty_message_is_neither_stored_nor_broadcast() {
    let (addr, _state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice")]);
    let mut a = join(addr, ROOM, "usr_a").await;

    send_json(&mut a, json!({ "kind": "send_message", "content": "   " })).await;
    send_json(&mut a, json!({ "kind": "send_message" })).await;

    expect_silence(&mut a, Duration::from_millis(300)).await;
    assert_eq!(store.message_count(ROOM), 0);
}

#[tokio::test]
async fn messages_arrive_in_send_order() {
    let (addr, _state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_c", "carol")]);
    let mut a = join(addr, ROOM, "usr_a").await;
    let mut c = join(addr, ROOM, "usr_c").await;

    for i in 0..20 {
        send_json(&mut a, json!({ "kind": "send_message", "content": format!("m{i}") })).await;
    }

    for ws in [&mut a, &mut c] {
        let mut last_id = 0i64;
        for i in 0..20 {
            let event = next_event(ws, "new_message").await;
            assert_eq!(event["content"], format!("m{i}"));
            let id: i64 = event["id"].as_str().unwrap().parse().unwrap();
            assert!(id > last_id);
            last_id = id;
        }
    }
}

#[tokio::test]
async fn typing_is_broadcast_and_defaults_to_active() {
    let (addr, _state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_c", "carol")]);
    let mut a = join(addr, ROOM, "usr_a").await;
    let mut c = join(addr, ROOM, "usr_c").await;

    send_json(&mut a, json!({ "kind": "typing" })).await;
    let event = next_event(&mut c, "typing").await;
    assert_eq!(event, json!({ "kind": "typing", "user_id": "usr_a", "active": true }));

    send_json(&mut a, json!({ "kind": "typing", "active": false })).await;
    let event = next_event(&mut c, "typing").await;
    assert_eq!(event["active"], false);
    assert_eq!(store.message_count(ROOM), 0);
}

// ---------------------------------------------------------------------------
// Read receipts and errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mark_read_unknown_message_reports_to_caller_only() {
    let (addr, _state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_c", "carol")]);
    let mut a = join(addr, ROOM, "usr_a").await;
    let mut c = join(addr, ROOM, "usr_c").await;
    // Drain a's view of c joining.
    next_event(&mut a, "presence").await;

    send_json(&mut a, json!({ "kind": "mark_read", "message_id": "999999" })).await;
    let event = next_event(&mut a, "error").await;
    assert_eq!(event["code"], "NOT_FOUND");

    expect_silence(&mut c, Duration::from_millis(300)).await;

    // The connection is still usable.
    send_json(&mut a, json!({ "kind": "send_message", "content": "still here" })).await;
    assert_eq!(next_event(&mut a, "new_message").await["content"], "still here");
}

#[tokio::test]
async fn mark_read_records_reader_and_optionally_broadcasts() {
    let mut config = test_config();
    config.broadcast_read_receipts = true;
    let (addr, _state, store) = start_server(config).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_c", "carol")]);
    let mut a = join(addr, ROOM, "usr_a").await;
    let mut c = join(addr, ROOM, "usr_c").await;

    send_json(&mut a, json!({ "kind": "send_message", "content": "read me" })).await;
    let message_id = next_event(&mut c, "new_message").await["id"].clone();

    send_json(&mut c, json!({ "kind": "mark_read", "message_id": message_id })).await;
    let receipt = next_event(&mut a, "read_receipt").await;
    assert_eq!(receipt["message_id"], message_id);
    assert_eq!(receipt["user_id"], "usr_c");

    let id: i64 = message_id.as_str().unwrap().parse().unwrap();
    assert_eq!(store.message(id).unwrap().read_by, vec!["usr_c"]);
}

#[tokio::test]
async fn malformed_events_are_ignored() {
    let (addr, _state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice")]);
    let mut a = join(addr, ROOM, "usr_a").await;

    a.send(Message::Text("{not json".into())).await.unwrap();
    send_json(&mut a, json!({ "kind": "dance" })).await;
    expect_silence(&mut a, Duration::from_millis(300)).await;

    send_json(&mut a, json!({ "kind": "send_message", "content": "ok" })).await;
    assert_eq!(next_json(&mut a).await["kind"], "new_message");
}

// ---------------------------------------------------------------------------
// Disconnect and keepalive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_announces_left_exactly_once_and_releases() {
    let (addr, state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_c", "carol")]);
    let mut a = join(addr, ROOM, "usr_a").await;
    let mut c = join(addr, ROOM, "usr_c").await;
    assert_eq!(state.bus.subscriber_count(ROOM), 2);

    a.close(None).await.unwrap();
    drop(a);

    let left = next_event(&mut c, "presence").await;
    assert_eq!(left, json!({ "kind": "presence", "user_id": "usr_a", "action": "left" }));
    expect_silence(&mut c, Duration::from_millis(300)).await;

    let presence = state.presence.clone();
    assert!(eventually(|| !presence.contains(ROOM, "usr_a")).await);
    let bus = state.bus.clone();
    assert!(eventually(|| bus.subscriber_count(ROOM) == 1).await);
}

#[tokio::test]
async fn abrupt_drop_still_cleans_up() {
    let (addr, state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_c", "carol")]);
    let a = join(addr, ROOM, "usr_a").await;
    let mut c = join(addr, ROOM, "usr_c").await;

    // No close handshake.
    drop(a);

    let left = next_event(&mut c, "presence").await;
    assert_eq!(left["action"], "left");
    let presence = state.presence.clone();
    assert!(eventually(|| !presence.contains(ROOM, "usr_a")).await);
}

#[tokio::test]
async fn second_tab_keeps_user_present() {
    let (addr, state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_c", "carol")]);
    let mut c = join(addr, ROOM, "usr_c").await;
    let first = join(addr, ROOM, "usr_a").await;
    // The second tab sees no `joined` of its own since alice is already present.
    let mut second = connect(addr, ROOM, Some(&mint_token("usr_a"))).await;
    let bus = state.bus.clone();
    assert!(eventually(|| bus.subscriber_count(ROOM) == 3).await);
    expect_silence(&mut second, Duration::from_millis(200)).await;

    drop(first);
    assert!(eventually(|| bus.subscriber_count(ROOM) == 2).await);
    assert!(state.presence.contains(ROOM, "usr_a"));

    // c saw alice join once and never leave.
    let joined = next_event(&mut c, "presence").await;
    assert_eq!(joined["action"], "joined");
    expect_silence(&mut c, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let mut config = test_config();
    config.idle_timeout = Duration::from_secs(1);
    config.ping_interval = Duration::from_secs(60);
    let (addr, state, store) = start_server(config).await;
    seed_room(&store, ROOM, &[("usr_a", "alice")]);
    let mut a = join(addr, ROOM, "usr_a").await;

    assert_eq!(expect_close_code(&mut a).await, 4009);
    let presence = state.presence.clone();
    assert!(eventually(|| !presence.contains(ROOM, "usr_a")).await);
}

#[tokio::test]
async fn revoked_participant_is_disconnected_and_announced_once() {
    let (addr, state, store) = start_server(test_config()).await;
    seed_room(&store, ROOM, &[("usr_a", "alice"), ("usr_b", "bob")]);
    let mut a = join(addr, ROOM, "usr_a").await;
    let mut b = join(addr, ROOM, "usr_b").await;
    assert_eq!(next_event(&mut a, "presence").await["user_id"], "usr_b");

    store.deactivate_participant(ROOM, "usr_b");
    let active = state.rooms.list_active_participants(ROOM).await.unwrap();
    assert_eq!(handler::revoke_stale_presence(&state, ROOM, &active), vec!["usr_b"]);

    assert_eq!(expect_close_code(&mut b).await, 4003);
    let left = next_event(&mut a, "presence").await;
    assert_eq!(left, json!({ "kind": "presence", "user_id": "usr_b", "action": "left" }));
    expect_silence(&mut a, Duration::from_millis(300)).await;

    let sessions = state.sessions.clone();
    assert!(eventually(|| sessions.len() == 1).await);
    assert_eq!(state.bus.subscriber_count(ROOM), 1);
    assert!(!state.presence.contains(ROOM, "usr_b"));
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscriber_that_falls_behind_is_closed_with_4008() {
    let mut config = test_config();
    config.subscriber_buffer = 4;
    let (addr, state, store) = start_server(config).await;
    seed_room(&store, ROOM, &[("usr_a", "alice")]);
    let mut a = join(addr, ROOM, "usr_a").await;

    // No await between publishes, so the writer cannot drain the queue.
    let delivered: usize = (0..10)
        .map(|i| {
            let event = ServerEvent::Typing {
                user_id: format!("usr_{i}"),
                active: true,
            };
            state.bus.publish(ROOM, Arc::new(event))
        })
        .sum();
    assert_eq!(delivered, 4);
    assert_eq!(state.bus.subscriber_count(ROOM), 0);

    assert_eq!(expect_close_code(&mut a).await, 4008);
    let presence = state.presence.clone();
    assert!(eventually(|| !presence.contains(ROOM, "usr_a")).await);
    let sessions = state.sessions.clone();
    assert!(eventually(|| sessions.is_empty()).await);
}

#[tokio::test]
async fn stalled_reader_is_evicted_and_cleaned_up_promptly() {
    let mut config = test_config();
    config.subscriber_buffer = 4;
    let (addr, state, store) = start_server(config).await;
    seed_room(&store, ROOM, &[("usr_a", "alice")]);
    // Joined, then never read from again.
    let _a = join(addr, ROOM, "usr_a").await;

    let envelope = Arc::new(ServerEvent::Typing {
        user_id: "x".repeat(60_000),
        active: true,
    });
    let mut published = 0;
    while state.bus.publish(ROOM, envelope.clone()) > 0 {
        published += 1;
        assert!(published < 5_000, "subscriber was never evicted");
        tokio::task::yield_now().await;
    }

    // Well inside the idle timeout.
    let presence = state.presence.clone();
    assert!(eventually_within(Duration::from_secs(3), || !presence.contains(ROOM, "usr_a")).await);
    let sessions = state.sessions.clone();
    assert!(eventually(|| sessions.is_empty()).await);
    assert_eq!(state.bus.subscriber_count(ROOM), 0);
}

// ---------------------------------------------------------------------------
// Store failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_failure_on_send_reaches_only_the_sender() {
    let store = Arc::new(FlakyStore::new());
    seed_room(&store.inner, ROOM, &[("usr_a", "alice"), ("usr_c", "carol")]);
    let (addr, _state) = start_server_with(test_config(), store.clone()).await;
    let mut a = join(addr, ROOM, "usr_a").await;
    let mut c = join(addr, ROOM, "usr_c").await;
    assert_eq!(next_event(&mut a, "presence").await["user_id"], "usr_c");

    store.fail_appends.store(true, Ordering::SeqCst);
    send_json(&mut a, json!({ "kind": "send_message", "content": "hello" })).await;

    let err = next_event(&mut a, "error").await;
    assert_eq!(
        err,
        json!({ "kind": "error", "code": "INTERNAL_ERROR", "message": "An internal error occurred" })
    );
    expect_silence(&mut c, Duration::from_millis(300)).await;
    assert_eq!(store.inner.message_count(ROOM), 0);

    // The connection survives the failure.
    store.fail_appends.store(false, Ordering::SeqCst);
    send_json(&mut a, json!({ "kind": "send_message", "content": "again" })).await;
    assert_eq!(next_event(&mut c, "new_message").await["content"], "again");
}

#[tokio::test]
async fn store_failure_during_admission_closes_with_1011() {
    let store = Arc::new(FlakyStore::new());
    seed_room(&store.inner, ROOM, &[("usr_a", "alice")]);
    let (addr, state) = start_server_with(test_config(), store.clone()).await;

    store.fail_membership.store(true, Ordering::SeqCst);
    let mut ws = connect(addr, ROOM, Some(&mint_token("usr_a"))).await;

    assert_eq!(expect_close_code(&mut ws).await, 1011);
    assert!(!state.presence.contains(ROOM, "usr_a"));
    assert_eq!(state.bus.subscriber_count(ROOM), 0);
    assert!(state.sessions.is_empty());
}
