//! Client behavior against a scripted server on an in-memory duplex pipe.

use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tether_client::{
    Client, ClientConfig, CloseReason, ConnectionStatus, MAX_BACKLOG, WatchEvent, Watcher, WatcherState,
};
use tether_core::request::UnwatchBody;
use tether_core::wire::WatchAck;
use tether_core::{
    AuthState, ChangeKind, Entity, Request, RequestFrame, Role, Selector, ServerFrame, TetherError, UserId, Visibility,
    WatchId,
};
use tether_transport::{DEFAULT_MAX_FRAME_BYTES, ServerCodec};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

struct FakeServer {
    frames: Framed<DuplexStream, ServerCodec>,
}

impl FakeServer {
    async fn recv(&mut self) -> RequestFrame {
        self.frames.next().await.expect("stream open").expect("valid frame")
    }

    async fn send(&mut self, frame: ServerFrame) {
        self.frames.send(frame).await.expect("send frame");
    }

    async fn reply(&mut self, frame: &RequestFrame, message: Value) {
        self.send(ServerFrame::respond(frame.id.clone(), message)).await;
    }
}

fn pair_with(config: ClientConfig) -> (Client, FakeServer) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let client = Client::from_stream(client_io, &config);
    let server = FakeServer {
        frames: Framed::new(server_io, ServerCodec::new(DEFAULT_MAX_FRAME_BYTES)),
    };
    (client, server)
}

fn pair() -> (Client, FakeServer) {
    pair_with(ClientConfig::new("duplex").with_request_timeout(None))
}

fn entity(key: &str, version: u64) -> Entity {
    Entity {
        kind: "listing".into(),
        key: key.into(),
        owner: UserId::from("u1"),
        visibility: Visibility::Public,
        version,
        data: json!({ "price": version * 10 }),
    }
}

// ── Correlation ─────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_requests_resolve_with_their_own_replies() {
    let (client, mut server) = pair();

    let a = tokio::spawn({
        let client = client.clone();
        async move { client.get("listing", "a").await }
    });
    let b = tokio::spawn({
        let client = client.clone();
        async move { client.get("listing", "b").await }
    });

    let first = server.recv().await;
    let second = server.recv().await;
    assert_ne!(first.id, second.id);

    // Answer in reverse arrival order.
    for frame in [&second, &first] {
        let key = frame.body["key"].as_str().unwrap().to_owned();
        server.reply(frame, serde_json::to_value(entity(&key, 1)).unwrap()).await;
    }

    assert_eq!(a.await.unwrap().unwrap().key, "a");
    assert_eq!(b.await.unwrap().unwrap().key, "b");
}

#[tokio::test]
async fn request_frames_carry_type_and_body() {
    let (client, mut server) = pair();
    let call = tokio::spawn(async move { client.list("listing").await });

    let frame = server.recv().await;
    assert_eq!(frame.kind, "entity.list");
    assert_eq!(frame.body, json!({ "kind": "listing" }));
    server.reply(&frame, json!([])).await;
    assert!(call.await.unwrap().unwrap().is_empty());
}

#[tokio::test]
async fn reply_for_unknown_id_is_discarded() {
    let (client, mut server) = pair();
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.ping().await }
    });

    let frame = server.recv().await;
    server
        .send(ServerFrame::respond("no-such-request".into(), json!({ "stray": true })))
        .await;
    server.reply(&frame, json!({ "pong": true })).await;

    assert_eq!(call.await.unwrap().unwrap(), json!({ "pong": true }));
    assert_eq!(client.status(), ConnectionStatus::Open);
}

#[tokio::test]
async fn error_reply_fails_only_its_request() {
    let (client, mut server) = pair();
    let create = tokio::spawn({
        let client = client.clone();
        async move { client.create("listing", "a", json!({}), Visibility::Public).await }
    });
    let first = server.recv().await;
    let ping = tokio::spawn({
        let client = client.clone();
        async move { client.ping().await }
    });
    let second = server.recv().await;

    server
        .send(ServerFrame::error(first.id.clone(), &TetherError::DuplicateKey { key: "a".into() }))
        .await;
    server.reply(&second, json!({ "pong": true })).await;

    assert_matches!(create.await.unwrap(), Err(TetherError::DuplicateKey { key }) if key == "a");
    assert!(ping.await.unwrap().is_ok());
}

#[tokio::test]
async fn invalid_request_is_refused_before_sending() {
    let (client, mut server) = pair();
    assert_matches!(client.get("", "a").await, Err(TetherError::ValidationFailed { .. }));

    let call = tokio::spawn(async move { client.ping().await });
    let frame = server.recv().await;
    assert_eq!(frame.kind, "system.ping");
    server.reply(&frame, json!({ "pong": true })).await;
    assert!(call.await.unwrap().is_ok());
}

// ── Timeouts ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn timed_out_request_ignores_late_reply() {
    let (client, mut server) =
        pair_with(ClientConfig::new("duplex").with_request_timeout(Some(Duration::from_millis(100))));

    assert_matches!(client.ping().await, Err(TetherError::Timeout));

    let stale = server.recv().await;
    server.reply(&stale, json!({ "late": true })).await;

    let (result, ()) = tokio::join!(client.ping(), async {
        let frame = server.recv().await;
        assert_ne!(frame.id, stale.id);
        server.reply(&frame, json!({ "pong": true })).await;
    });
    assert_eq!(result.unwrap(), json!({ "pong": true }));
}

fn short_timeout() -> ClientConfig {
    ClientConfig::new("duplex").with_request_timeout(Some(Duration::from_millis(100)))
}

/// Round-trip a ping so every frame sent before it has been handled.
async fn settle(client: &Client, server: &mut FakeServer) {
    let (result, ()) = tokio::join!(client.ping(), async {
        let frame = server.recv().await;
        server.reply(&frame, json!({ "pong": true })).await;
    });
    result.unwrap();
}

#[tokio::test(start_paused = true)]
async fn login_reply_after_timeout_still_authenticates() {
    let (client, mut server) = pair_with(short_timeout());

    assert_matches!(client.login("ann", "pw").await, Err(TetherError::Timeout));
    assert_eq!(client.auth_state(), AuthState::Anonymous);

    let stale = server.recv().await;
    assert_eq!(stale.kind, "auth.login");
    server.reply(&stale, json!({ "userId": "u1", "role": "seller" })).await;
    settle(&client, &mut server).await;

    assert_matches!(
        client.auth_state(),
        AuthState::Authenticated(identity) if identity.user_id == UserId::from("u1")
    );
}

#[tokio::test(start_paused = true)]
async fn logout_reply_after_timeout_still_closes_watchers() {
    let (client, mut server) = pair_with(short_timeout());
    let (_, ()) = tokio::join!(client.login("ann", "pw"), async {
        let frame = server.recv().await;
        server.reply(&frame, json!({ "userId": "u1", "role": "buyer" })).await;
    });
    let watcher = open_watch(&client, &mut server, "w1", vec![]).await;

    assert_matches!(client.logout().await, Err(TetherError::Timeout));
    let stale = server.recv().await;
    assert_eq!(stale.kind, "auth.logout");
    server.reply(&stale, json!({ "loggedOut": true })).await;
    settle(&client, &mut server).await;

    assert_eq!(client.auth_state(), AuthState::Anonymous);
    assert_eq!(watcher.state(), WatcherState::Closed);
}

#[tokio::test(start_paused = true)]
async fn unwatch_reply_after_timeout_still_closes_the_watcher() {
    let (client, mut server) = pair_with(short_timeout());
    let watcher = open_watch(&client, &mut server, "w1", vec![]).await;
    let (_id, mut events) = watcher.events();
    assert_matches!(events.recv().await, Some(WatchEvent::Snapshot(_)));

    let request = Request::Unwatch(UnwatchBody {
        watch_id: WatchId::from("w1"),
    });
    assert_matches!(client.send(request).await, Err(TetherError::Timeout));
    assert_eq!(watcher.state(), WatcherState::Closing);

    let stale = server.recv().await;
    assert_eq!(stale.kind, "unwatch");
    server.reply(&stale, json!({ "closed": true })).await;
    settle(&client, &mut server).await;

    assert_eq!(watcher.state(), WatcherState::Closed);
    assert!(events.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn watch_ack_after_timeout_is_unwatched() {
    let (client, mut server) = pair_with(short_timeout());

    assert_matches!(
        client.watch(Selector::collection("listing")).await,
        Err(TetherError::Timeout)
    );
    let stale = server.recv().await;
    let ack = WatchAck {
        watch_id: WatchId::from("orphan"),
        snapshot: vec![],
    };
    server.reply(&stale, serde_json::to_value(ack).unwrap()).await;

    let cleanup = server.recv().await;
    assert_eq!(cleanup.kind, "unwatch");
    assert_eq!(cleanup.body["watchId"], "orphan");
}

// ── Connection-wide failures ────────────────────────────────────────

#[tokio::test]
async fn socket_closed_fails_pending_gracefully() {
    let (client, mut server) = pair();
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.ping().await }
    });
    let _ = server.recv().await;

    server.send(ServerFrame::socket_closed("account registered")).await;

    assert_matches!(call.await.unwrap(), Err(TetherError::SocketClosed));
    let status = client.closed().await;
    assert_matches!(
        status,
        ConnectionStatus::Closed(CloseReason::ServerClosed { ref reason }) if reason == "account registered"
    );
    assert_matches!(client.ping().await, Err(TetherError::SocketClosed));
}

#[tokio::test]
async fn eof_without_close_frame_is_connection_lost() {
    let (client, mut server) = pair();
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.ping().await }
    });
    let _ = server.recv().await;
    drop(server);

    assert_matches!(call.await.unwrap(), Err(TetherError::ConnectionLost));
    assert_eq!(client.closed().await, ConnectionStatus::Closed(CloseReason::Lost));
}

#[tokio::test]
async fn malformed_frame_fails_every_pending_request() {
    let (client, mut server) = pair();
    let a = tokio::spawn({
        let client = client.clone();
        async move { client.ping().await }
    });
    let _ = server.recv().await;
    let b = tokio::spawn({
        let client = client.clone();
        async move { client.list("listing").await }
    });
    let _ = server.recv().await;

    let garbage = b"{nope";
    let io = server.frames.get_mut();
    io.write_all(&u32::try_from(garbage.len()).unwrap().to_be_bytes()).await.unwrap();
    io.write_all(garbage).await.unwrap();

    assert_matches!(a.await.unwrap(), Err(TetherError::MalformedFrame { .. }));
    assert_matches!(b.await.unwrap(), Err(TetherError::MalformedFrame { .. }));
    assert_matches!(client.closed().await, ConnectionStatus::Closed(CloseReason::Malformed { .. }));
}

#[tokio::test]
async fn shutdown_fails_pending_and_closes_stream() {
    let (client, mut server) = pair();
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.ping().await }
    });
    let _ = server.recv().await;

    let status = client.shutdown().await;
    assert_eq!(status, ConnectionStatus::Closed(CloseReason::Shutdown));
    assert_matches!(call.await.unwrap(), Err(TetherError::ConnectionLost));
    assert!(server.frames.next().await.is_none());
}

// ── Authentication ──────────────────────────────────────────────────

#[tokio::test]
async fn login_and_logout_track_identity() {
    let (client, mut server) = pair();
    assert_eq!(client.auth_state(), AuthState::Anonymous);

    let (identity, ()) = tokio::join!(client.login("ann", "pw"), async {
        let frame = server.recv().await;
        assert_eq!(frame.kind, "auth.login");
        assert_eq!(frame.body["username"], "ann");
        server.reply(&frame, json!({ "userId": "u1", "role": "seller" })).await;
    });
    let identity = identity.unwrap();
    assert_eq!(identity.role, Role::Seller);
    assert_eq!(client.auth_state(), AuthState::Authenticated(identity));

    let (result, ()) = tokio::join!(client.logout(), async {
        let frame = server.recv().await;
        server.reply(&frame, json!({ "loggedOut": true })).await;
    });
    result.unwrap();
    assert_eq!(client.auth_state(), AuthState::Anonymous);
}

#[tokio::test]
async fn failed_login_stays_anonymous() {
    let (client, mut server) = pair();
    let (result, ()) = tokio::join!(client.login("ann", "wrong"), async {
        let frame = server.recv().await;
        server.send(ServerFrame::error(frame.id, &TetherError::Unauthorized)).await;
    });
    assert_matches!(result, Err(TetherError::Unauthorized));
    assert_eq!(client.auth_state(), AuthState::Anonymous);
}

// ── Watches ─────────────────────────────────────────────────────────

async fn open_watch(client: &Client, server: &mut FakeServer, watch_id: &str, snapshot: Vec<Entity>) -> Watcher {
    let (watcher, ()) = tokio::join!(client.watch(Selector::collection("listing")), async {
        let frame = server.recv().await;
        assert_eq!(frame.kind, "watch");
        let ack = WatchAck {
            watch_id: WatchId::from(watch_id),
            snapshot,
        };
        server.reply(&frame, serde_json::to_value(ack).unwrap()).await;
    });
    watcher.unwrap()
}

#[tokio::test]
async fn snapshot_precedes_buffered_and_live_pushes() {
    let (client, mut server) = pair();
    let watcher = open_watch(&client, &mut server, "w1", vec![entity("a", 1)]).await;
    assert_eq!(watcher.snapshot().len(), 1);
    assert_eq!(watcher.state(), WatcherState::Active);

    // Arrives before any listener is attached.
    server
        .send(ServerFrame::push(ChangeKind::Created, WatchId::from("w1"), entity("b", 1)))
        .await;
    let (_id, mut events) = watcher.events();
    server
        .send(ServerFrame::push(ChangeKind::Updated, WatchId::from("w1"), entity("a", 2)))
        .await;

    assert_matches!(events.recv().await, Some(WatchEvent::Snapshot(s)) if s.len() == 1);
    assert_matches!(events.recv().await, Some(WatchEvent::Created(e)) if e.key == "b");
    assert_matches!(events.recv().await, Some(WatchEvent::Updated(e)) if e.key == "a" && e.version == 2);
}

#[tokio::test]
async fn pushes_for_other_watches_are_not_delivered() {
    let (client, mut server) = pair();
    let watcher = open_watch(&client, &mut server, "w1", vec![]).await;
    let (_id, mut events) = watcher.events();
    assert_matches!(events.recv().await, Some(WatchEvent::Snapshot(_)));

    server
        .send(ServerFrame::push(ChangeKind::Created, WatchId::from("other"), entity("x", 1)))
        .await;
    server
        .send(ServerFrame::push(ChangeKind::Removed, WatchId::from("w1"), entity("y", 3)))
        .await;

    assert_matches!(events.recv().await, Some(WatchEvent::Removed(e)) if e.key == "y");
}

#[tokio::test]
async fn push_arriving_during_close_is_dropped() {
    let (client, mut server) = pair();
    let watcher = open_watch(&client, &mut server, "w1", vec![]).await;
    let (_id, mut events) = watcher.events();
    assert_matches!(events.recv().await, Some(WatchEvent::Snapshot(_)));

    let (closed, ()) = tokio::join!(watcher.close(), async {
        let frame = server.recv().await;
        assert_eq!(frame.kind, "unwatch");
        assert_eq!(frame.body["watchId"], "w1");
        server
            .send(ServerFrame::push(ChangeKind::Updated, WatchId::from("w1"), entity("a", 9)))
            .await;
        server.reply(&frame, json!({ "closed": true })).await;
    });
    closed.unwrap();

    assert_eq!(watcher.state(), WatcherState::Closed);
    assert!(events.recv().await.is_none());
    // Second close is a no-op and sends nothing.
    watcher.close().await.unwrap();
}

#[tokio::test]
async fn watcher_without_listener_is_cancelled_when_backlog_fills() {
    let (client, mut server) = pair();
    let watcher = open_watch(&client, &mut server, "w1", vec![]).await;

    for version in 0..=MAX_BACKLOG as u64 {
        server
            .send(ServerFrame::push(ChangeKind::Updated, WatchId::from("w1"), entity("a", version)))
            .await;
    }

    let cancel = server.recv().await;
    assert_eq!(cancel.kind, "unwatch");
    assert_eq!(cancel.body["watchId"], "w1");
    assert_eq!(watcher.state(), WatcherState::Closed);
    assert_eq!(client.status(), ConnectionStatus::Open);
}

#[tokio::test]
async fn logout_closes_every_watcher() {
    let (client, mut server) = pair();
    let (_, ()) = tokio::join!(client.login("ann", "pw"), async {
        let frame = server.recv().await;
        server.reply(&frame, json!({ "userId": "u1", "role": "buyer" })).await;
    });
    let first = open_watch(&client, &mut server, "w1", vec![]).await;
    let second = open_watch(&client, &mut server, "w2", vec![]).await;

    let (result, ()) = tokio::join!(client.logout(), async {
        let frame = server.recv().await;
        server.reply(&frame, json!({ "loggedOut": true })).await;
    });
    result.unwrap();

    assert_eq!(first.state(), WatcherState::Closed);
    assert_eq!(second.state(), WatcherState::Closed);
}

#[tokio::test]
async fn connection_loss_closes_watchers() {
    let (client, mut server) = pair();
    let watcher = open_watch(&client, &mut server, "w1", vec![]).await;
    drop(server);

    let _ = client.closed().await;
    assert_eq!(watcher.state(), WatcherState::Closed);
}
