//! End-to-end tests: real server on an ephemeral port, real WebSocket clients.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use secrecy::SecretString;
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use parley_core::{EventKind, UserId, WireEvent};
use parley_server::auth::Claims;
use parley_server::{start, JwtValidator, ServerConfig, ServerHandle};
use parley_store::{Database, MessageRepo};
use parley_telemetry::MetricsRecorder;

const SECRET: &str = "integration-secret";
const WAIT: Duration = Duration::from_secs(5);

fn token(user: &str, ttl_secs: i64) -> String {
    let claims = Claims {
        user_id: Some(user.to_string()),
        sub: None,
        exp: (chrono::Utc::now().timestamp() + ttl_secs) as u64,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

struct TestServer {
    handle: ServerHandle,
    repo: MessageRepo,
}

async fn boot() -> TestServer {
    let repo = MessageRepo::new(Database::in_memory().unwrap());
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    };
    let handle = start(
        config,
        Arc::new(JwtValidator::hs256(&SecretString::from(SECRET))),
        Arc::new(repo.clone()),
        Arc::new(MetricsRecorder::new()),
    )
    .await
    .unwrap();
    TestServer { handle, repo }
}

impl TestServer {
    fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.handle.port)
    }

    async fn connect(&self, user: &str) -> Client {
        let mut request = self.ws_url().into_client_request().unwrap();
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", token(user, 3600)).parse().unwrap(),
        );
        let (ws, _) = connect_async(request).await.unwrap();
        let client = Client { ws, pending: VecDeque::new(), skipped: Vec::new() };
        let user_id = UserId::from(user);
        wait_until(|| self.handle.hub().is_online(&user_id)).await;
        client
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<WireEvent>,
    /// Events passed over by `next_of_kind`.
    skipped: Vec<WireEvent>,
}

impl Client {
    async fn send(&mut self, frame: serde_json::Value) {
        self.ws.send(Message::text(frame.to_string())).await.unwrap();
    }

    /// Next event, splitting coalesced frames on newlines.
    async fn next_event(&mut self) -> WireEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            let message = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .expect("read failed");
            if let Message::Text(text) = message {
                for line in text.as_str().split('\n') {
                    self.pending.push_back(WireEvent::decode(line.as_bytes()).unwrap());
                }
            }
        }
    }

    async fn next_of_kind(&mut self, kind: EventKind) -> WireEvent {
        loop {
            let event = self.next_event().await;
            if event.kind == kind {
                return event;
            }
            self.skipped.push(event);
        }
    }

    async fn join(&mut self, conversation: &str) {
        self.send(json!({"type": "join_conversation", "conversation_id": conversation}))
            .await;
        let ack = self.next_of_kind(EventKind::JoinSuccess).await;
        assert_eq!(ack.conversation_id.as_str(), conversation);
    }

    /// True if the server closes the connection within the wait window.
    async fn expect_closed(&mut self) -> bool {
        let result = tokio::time::timeout(WAIT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        result.is_ok()
    }
}

#[tokio::test]
async fn users_see_each_other_come_and_go() {
    let server = boot().await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    let seen_by_alice = alice.next_of_kind(EventKind::UserOnline).await;
    assert_eq!(seen_by_alice.sender_id.as_str(), "bob");
    let seen_by_bob = bob.next_of_kind(EventKind::UserOnline).await;
    assert_eq!(seen_by_bob.sender_id.as_str(), "alice");

    bob.ws.close(None).await.unwrap();
    let gone = alice.next_of_kind(EventKind::UserOffline).await;
    assert_eq!(gone.sender_id.as_str(), "bob");
    assert!(!server.handle.hub().is_online(&"bob".into()));

    server.handle.shutdown().await;
}

#[tokio::test]
async fn message_is_persisted_and_relayed_to_members() {
    let server = boot().await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    let mut carol = server.connect("carol").await;

    alice.join("c1").await;
    bob.join("c1").await;

    alice
        .send(json!({
            "type": "new_message",
            "conversation_id": "c1",
            "sender_id": "mallory",
            "message": "hi"
        }))
        .await;

    let received = bob.next_of_kind(EventKind::NewMessage).await;
    assert_eq!(received.message, "hi");
    assert_eq!(received.sender_id.as_str(), "alice");
    assert!(received.created_at > 0);

    let stored = server.repo.list_for_conversation(&"c1".into(), 10).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sender_id.as_str(), "alice");
    assert_eq!(stored[0].created_at, received.created_at);

    // Carol never joined c1. Everything she saw before her own join ack
    // must be presence.
    carol.join("c2").await;
    bob.send(json!({"type": "new_conversation", "conversation_id": "c2", "message": "Lunch"}))
        .await;
    let next = carol.next_event().await;
    assert_eq!(next.kind, EventKind::NewConversation);
    assert_eq!(next.sender_id.as_str(), "bob");
    assert!(carol.skipped.iter().all(|e| e.kind.is_presence()));
    assert!(alice.skipped.iter().all(|e| e.kind != EventKind::NewMessage));

    server.handle.shutdown().await;
}

#[tokio::test]
async fn malformed_frame_keeps_session_open() {
    let server = boot().await;
    let mut alice = server.connect("alice").await;

    alice.ws.send(Message::text("{definitely not json")).await.unwrap();
    alice.join("c1").await;
    assert!(server.handle.hub().is_online(&"alice".into()));

    server.handle.shutdown().await;
}

#[tokio::test]
async fn second_connection_supersedes_first() {
    let server = boot().await;
    let mut first = server.connect("alice").await;
    let _second = server.connect("alice").await;

    assert!(first.expect_closed().await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.handle.hub().is_online(&"alice".into()));
    assert_eq!(server.handle.hub().online_count(), 1);

    server.handle.shutdown().await;
}

#[tokio::test]
async fn query_token_is_accepted() {
    let server = boot().await;
    let url = format!("{}?token={}", server.ws_url(), token("dave", 3600));
    let (_ws, response) = connect_async(url).await.unwrap();
    assert_eq!(response.status(), 101);
    wait_until(|| server.handle.hub().is_online(&"dave".into())).await;

    server.handle.shutdown().await;
}

#[tokio::test]
async fn upgrade_without_valid_token_is_rejected() {
    let server = boot().await;

    let missing = connect_async(server.ws_url()).await;
    assert!(matches!(missing, Err(tungstenite::Error::Http(ref r)) if r.status() == 401));

    let expired_url = format!("{}?token={}", server.ws_url(), token("alice", -120));
    let expired = connect_async(expired_url).await;
    assert!(matches!(expired, Err(tungstenite::Error::Http(ref r)) if r.status() == 401));

    assert_eq!(server.handle.hub().online_count(), 0);
    server.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let server = boot().await;
    let mut alice = server.connect("alice").await;

    server.handle.shutdown().await;
    assert!(alice.expect_closed().await);
}

#[tokio::test]
async fn presence_endpoint_lists_connected_users() {
    let server = boot().await;
    let _alice = server.connect("alice").await;

    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/presence", server.handle.port))
        .bearer_auth(token("bob", 3600))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["online"], json!(["alice"]));

    server.handle.shutdown().await;
}
