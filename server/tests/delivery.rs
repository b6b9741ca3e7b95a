use async_trait::async_trait;
use courier::api::{build_router, AppState};
use courier::auth::issue_token;
use courier::config::{Config, EntitlementConfig};
use courier::devices::DeviceAddress;
use courier::notify::{Notification, PushError, PushProvider};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const SECRET: &str = "integration-secret";

#[derive(Default)]
struct RecordingProvider {
    pushes: Mutex<Vec<(String, Notification)>>,
}

#[async_trait]
impl PushProvider for RecordingProvider {
    async fn push(&self, device: &DeviceAddress, note: &Notification) -> Result<(), PushError> {
        self.pushes.lock().push((device.address.clone(), note.clone()));
        Ok(())
    }
}

struct TestServer {
    addr: SocketAddr,
    provider: Arc<RecordingProvider>,
    _server: JoinHandle<()>,
    _tmp: tempfile::TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

async fn spawn_server(daily_limit: Option<u32>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: addr.to_string(),
        data_dir: tmp.path().to_path_buf(),
        jwt_secret: SECRET.into(),
        entitlements: EntitlementConfig {
            daily_limit,
            unlimited_users: Vec::new(),
        },
        ..Default::default()
    };
    let provider = Arc::new(RecordingProvider::default());
    let state = AppState::with_provider(config, provider.clone()).await.unwrap();
    let app = build_router(state);
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service()).await.unwrap();
    });
    TestServer { addr, provider, _server: server, _tmp: tmp }
}

fn token(user: &str, name: &str) -> String {
    issue_token(SECRET.as_bytes(), user, Some(name), time::Duration::minutes(10)).unwrap()
}

async fn open_conversation(client: &reqwest::Client, srv: &TestServer, tok: &str, peer: &str) -> String {
    let resp = client
        .post(srv.url("/api/conversations"))
        .bearer_auth(tok)
        .json(&json!({ "peer_id": peer }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    resp.json::<Value>().await.unwrap()["id"].as_str().unwrap().to_string()
}

async fn send(client: &reqwest::Client, srv: &TestServer, tok: &str, body: Value) -> reqwest::Response {
    client
        .post(srv.url("/api/messages"))
        .bearer_auth(tok)
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn offline_recipient_is_notified_once() {
    let srv = spawn_server(None).await;
    let client = reqwest::Client::new();
    let alice = token("alice", "Alice");
    let bob = token("bob", "Bob");
    let resp = client
        .post(srv.url("/api/devices"))
        .bearer_auth(&bob)
        .json(&json!({ "address": "bob-phone", "platform": "android" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let conv = open_conversation(&client, &srv, &alice, "bob").await;

    let resp = send(&client, &srv, &alice, json!({ "conversation_id": conv, "text": "are you there?" })).await;
    assert_eq!(resp.status(), 201);
    let sent: Value = resp.json().await.unwrap();
    assert_eq!(sent["message"]["status"], "sent");

    for _ in 0..100 {
        if !srv.provider.pushes.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let pushes = srv.provider.pushes.lock();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "bob-phone");
    assert_eq!(pushes[0].1.title, "Alice");
    assert_eq!(pushes[0].1.data["conversation_id"], conv.as_str());
}

#[tokio::test]
async fn resend_with_same_temp_id_is_collapsed() {
    let srv = spawn_server(None).await;
    let client = reqwest::Client::new();
    let alice = token("alice", "Alice");
    let conv = open_conversation(&client, &srv, &alice, "bob").await;
    let body = json!({ "conversation_id": conv, "text": "once", "client_temp_id": "tmp-1" });

    let first = send(&client, &srv, &alice, body.clone()).await;
    assert_eq!(first.status(), 201);
    let first: Value = first.json().await.unwrap();
    let second = send(&client, &srv, &alice, body).await;
    assert_eq!(second.status(), 200);
    let second: Value = second.json().await.unwrap();
    assert_eq!(first["message_id"], second["message_id"]);
    assert_eq!(second["client_temp_id"], "tmp-1");

    let history: Vec<Value> = client
        .get(srv.url(&format!("/api/conversations/{conv}/messages")))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn temp_id_reused_in_another_conversation_is_a_new_send() {
    let srv = spawn_server(None).await;
    let client = reqwest::Client::new();
    let alice = token("alice", "Alice");
    let with_bob = open_conversation(&client, &srv, &alice, "bob").await;
    let with_carol = open_conversation(&client, &srv, &alice, "carol").await;

    let first = send(&client, &srv, &alice, json!({ "conversation_id": with_bob, "text": "to bob", "client_temp_id": "t1" })).await;
    assert_eq!(first.status(), 201);
    let second = send(&client, &srv, &alice, json!({ "conversation_id": with_carol, "text": "to carol", "client_temp_id": "t1" })).await;
    assert_eq!(second.status(), 201);
    let second: Value = second.json().await.unwrap();
    assert_eq!(second["message"]["conversation_id"], with_carol.as_str());
    assert_eq!(second["message"]["text"], "to carol");

    let history: Vec<Value> = client
        .get(srv.url(&format!("/api/conversations/{with_carol}/messages")))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn malformed_bodies_are_invalid_requests() {
    let srv = spawn_server(None).await;
    let client = reqwest::Client::new();
    let alice = token("alice", "Alice");
    let conv = open_conversation(&client, &srv, &alice, "bob").await;

    let resp = send(&client, &srv, &alice, json!({ "conversation_id": conv, "client_temp_id": "m-1" })).await;
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "INVALID_REQUEST");
    assert_eq!(err["retryable"], false);

    let resp = client
        .post(srv.url("/api/read"))
        .bearer_auth(&alice)
        .header("content-type", "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "INVALID_REQUEST");

    let resp = client
        .post(srv.url("/api/conversations"))
        .bearer_auth(&alice)
        .body(r#"{"peer_id":"bob"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn read_receipts_drive_unread_counts() {
    let srv = spawn_server(None).await;
    let client = reqwest::Client::new();
    let alice = token("alice", "Alice");
    let bob = token("bob", "Bob");
    let conv = open_conversation(&client, &srv, &alice, "bob").await;
    let mut ids = Vec::new();
    for text in ["one", "two", "three"] {
        let resp: Value = send(&client, &srv, &alice, json!({ "conversation_id": conv, "text": text }))
            .await
            .json()
            .await
            .unwrap();
        ids.push(resp["message_id"].as_str().unwrap().to_string());
    }

    let unread = |tok: String| {
        let client = client.clone();
        let url = srv.url(&format!("/api/conversations/{conv}/unread"));
        async move {
            let v: Value = client.get(url).bearer_auth(tok).send().await.unwrap().json().await.unwrap();
            v["unread"].as_u64().unwrap()
        }
    };
    assert_eq!(unread(bob.clone()).await, 3);
    assert_eq!(unread(alice.clone()).await, 0);

    // out of order: newest first
    let resp: Value = client
        .post(srv.url("/api/read"))
        .bearer_auth(&bob)
        .json(&json!({ "conversation_id": conv, "message_ids": [ids[2], ids[0]] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["count"], 2);
    assert_eq!(unread(bob.clone()).await, 1);

    let again: Value = client
        .post(srv.url("/api/read"))
        .bearer_auth(&bob)
        .json(&json!({ "conversation_id": conv, "message_ids": [ids[2]] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["count"], 0);

    client
        .post(srv.url("/api/read"))
        .bearer_auth(&bob)
        .json(&json!({ "conversation_id": conv }))
        .send()
        .await
        .unwrap();
    assert_eq!(unread(bob.clone()).await, 0);

    let listed: Vec<Value> = client
        .get(srv.url("/api/conversations"))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["peer_id"], "alice");
    assert_eq!(listed[0]["unread_count"], 0);
}

#[tokio::test]
async fn deleted_conversation_has_empty_history() {
    let srv = spawn_server(None).await;
    let client = reqwest::Client::new();
    let alice = token("alice", "Alice");
    let mallory = token("mallory", "Mallory");
    let conv = open_conversation(&client, &srv, &alice, "bob").await;
    send(&client, &srv, &alice, json!({ "conversation_id": conv, "text": "soon gone" })).await;

    let resp = client
        .get(srv.url(&format!("/api/conversations/{conv}/messages")))
        .bearer_auth(&mallory)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let resp = client
        .delete(srv.url(&format!("/api/conversations/{conv}")))
        .bearer_auth(&mallory)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = client
        .delete(srv.url(&format!("/api/conversations/{conv}")))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let history: Vec<Value> = client
        .get(srv.url(&format!("/api/conversations/{conv}/messages")))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(history.is_empty());

    let resp = send(&client, &srv, &alice, json!({ "conversation_id": conv, "text": "hello?" })).await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn message_limit_is_reported_and_not_retryable() {
    let srv = spawn_server(Some(2)).await;
    let client = reqwest::Client::new();
    let alice = token("alice", "Alice");
    let conv = open_conversation(&client, &srv, &alice, "bob").await;
    for i in 0..2 {
        let resp = send(&client, &srv, &alice, json!({ "conversation_id": conv, "text": format!("m{i}") })).await;
        assert_eq!(resp.status(), 201);
    }
    let resp = send(
        &client,
        &srv,
        &alice,
        json!({ "conversation_id": conv, "text": "one too many", "client_temp_id": "tmp-over" }),
    )
    .await;
    assert_eq!(resp.status(), 429);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "MESSAGE_LIMIT_REACHED");
    assert_eq!(err["retryable"], false);
    assert_eq!(err["client_temp_id"], "tmp-over");
}

#[tokio::test]
async fn invalid_sends_are_rejected() {
    let srv = spawn_server(None).await;
    let client = reqwest::Client::new();
    let alice = token("alice", "Alice");
    let mallory = token("mallory", "Mallory");
    let conv = open_conversation(&client, &srv, &alice, "bob").await;

    let resp = send(&client, &srv, &alice, json!({ "conversation_id": conv, "text": "   " })).await;
    assert_eq!(resp.status(), 400);
    let resp = send(&client, &srv, &mallory, json!({ "conversation_id": conv, "text": "hi" })).await;
    assert_eq!(resp.status(), 403);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["code"], "NOT_PARTICIPANT");

    let resp = client
        .post(srv.url("/api/conversations"))
        .bearer_auth(&alice)
        .json(&json!({ "peer_id": "alice" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client.get(srv.url("/api/conversations")).send().await.unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn deregistered_device_is_not_pushed() {
    let srv = spawn_server(None).await;
    let client = reqwest::Client::new();
    let alice = token("alice", "Alice");
    let bob = token("bob", "Bob");
    for address in ["bob-old", "bob-new"] {
        client
            .post(srv.url("/api/devices"))
            .bearer_auth(&bob)
            .json(&json!({ "address": address, "platform": "ios" }))
            .send()
            .await
            .unwrap();
    }
    let resp = client
        .delete(srv.url("/api/devices"))
        .bearer_auth(&bob)
        .json(&json!({ "address": "bob-old" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    let devices: Vec<Value> = client
        .get(srv.url("/api/devices"))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(devices.len(), 2);

    let conv = open_conversation(&client, &srv, &alice, "bob").await;
    send(&client, &srv, &alice, json!({ "conversation_id": conv, "text": "ping" })).await;
    for _ in 0..100 {
        if !srv.provider.pushes.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let pushes = srv.provider.pushes.lock();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "bob-new");
}
