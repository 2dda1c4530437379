//! End-to-end relay tests over a locally bound server.
//!
//! Exercises the full path: signed webhook POST → StreamHub fan-out →
//! WebSocket subscriber, including backlog snapshots, artifact filtering,
//! and session cleanup after the client goes away.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_tungstenite::tungstenite::Message;

use pipewatch_api::{app, AppState, SIGNATURE_HEADER};
use pipewatch_core::StreamHub;

type HmacSha256 = Hmac<Sha256>;

const SECRET: &str = "test-secret";

async fn spawn_app(secret: Option<&str>) -> (SocketAddr, AppState) {
    let state = AppState::new(Arc::new(StreamHub::new()), secret.map(String::from));
    let router = app(state.clone(), vec![]);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

fn sign(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn event_json(artifact: &str, timestamp: i64) -> serde_json::Value {
    serde_json::json!({
        "receivedArtifact": artifact,
        "timestamp": timestamp,
        "eventType": "TASK_DONE",
        "eventMessage": format!("{artifact} finished"),
        "audioRequestID": "req-1",
    })
}

async fn post_event(addr: SocketAddr, event: &serde_json::Value) -> reqwest::StatusCode {
    let body = event.to_string();
    reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/pipeline/events/webhook"))
        .header("Content-Type", "application/json")
        .header(SIGNATURE_HEADER, sign(SECRET, &body))
        .body(body)
        .send()
        .await
        .unwrap()
        .status()
}

async fn connect_ws(
    addr: SocketAddr,
    query: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://{addr}/api/v1/pipeline/events/ws{query}");
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Poll until the hub reports `count` live subscribers; registration happens
/// in the upgrade task, slightly after the client handshake completes.
async fn wait_for_subscribers(state: &AppState, count: usize) {
    for _ in 0..200 {
        if state.hub.subscriber_count() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {count} subscribers, have {}",
        state.hub.subscriber_count()
    );
}

async fn next_json(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for websocket message")
            .expect("websocket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn test_subscriber_receives_published_event() {
    let (addr, state) = spawn_app(Some(SECRET)).await;

    let mut ws = connect_ws(addr, "?artifact=maker&skipSnapshot=true").await;
    wait_for_subscribers(&state, 1).await;

    let status = post_event(addr, &event_json("maker", 100)).await;
    assert_eq!(status, reqwest::StatusCode::ACCEPTED);

    let received = next_json(&mut ws).await;
    assert_eq!(received["receivedArtifact"], "maker");
    assert_eq!(received["timestamp"], 100);
    assert_eq!(received["audioRequestID"], "req-1");
    assert!(received["userEmail"].is_null());
}

#[tokio::test]
async fn test_snapshot_backlog_is_merged_and_sorted() {
    let (addr, _state) = spawn_app(Some(SECRET)).await;

    // Buffers: "A" = [100, 200], "B" = [300]
    post_event(addr, &event_json("a", 100)).await;
    post_event(addr, &event_json("b", 300)).await;
    post_event(addr, &event_json("a", 200)).await;

    // Wildcard connect replays all three ascending by timestamp.
    let mut ws = connect_ws(addr, "").await;
    let mut timestamps = Vec::new();
    for _ in 0..3 {
        timestamps.push(next_json(&mut ws).await["timestamp"].as_i64().unwrap());
    }
    assert_eq!(timestamps, vec![100, 200, 300]);
}

#[tokio::test]
async fn test_skip_snapshot_suppresses_backlog() {
    let (addr, state) = spawn_app(Some(SECRET)).await;

    post_event(addr, &event_json("maker", 100)).await;

    let mut ws = connect_ws(addr, "?skipSnapshot=true").await;
    wait_for_subscribers(&state, 1).await;

    // Nothing replayed; the first frame is the next live event.
    post_event(addr, &event_json("maker", 200)).await;
    let received = next_json(&mut ws).await;
    assert_eq!(received["timestamp"], 200);
}

#[tokio::test]
async fn test_filtered_subscriber_ignores_other_artifacts() {
    let (addr, state) = spawn_app(Some(SECRET)).await;

    let mut ws = connect_ws(addr, "?artifact=export&skipSnapshot=true").await;
    wait_for_subscribers(&state, 1).await;

    post_event(addr, &event_json("maker", 100)).await;
    post_event(addr, &event_json("export", 200)).await;

    // The maker event was never delivered here; the first frame is export's.
    let received = next_json(&mut ws).await;
    assert_eq!(received["receivedArtifact"], "export");
}

#[tokio::test]
async fn test_session_cleanup_after_client_disconnect() {
    let (addr, state) = spawn_app(Some(SECRET)).await;

    let ws = connect_ws(addr, "?skipSnapshot=true").await;
    wait_for_subscribers(&state, 1).await;

    drop(ws);
    wait_for_subscribers(&state, 0).await;
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let (addr, _state) = spawn_app(Some(SECRET)).await;
    let body = event_json("maker", 100).to_string();

    let status = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/pipeline/events/webhook"))
        .header("Content-Type", "application/json")
        .header(SIGNATURE_HEADER, sign("wrong-secret", &body))
        .body(body.clone())
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);

    let status = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/pipeline/events/webhook"))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_webhook_unavailable_without_secret() {
    let (addr, _state) = spawn_app(None).await;
    let status = post_event(addr, &event_json("maker", 100)).await;
    assert_eq!(status, reqwest::StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_webhook_rejects_malformed_event() {
    let (addr, _state) = spawn_app(Some(SECRET)).await;

    // Correctly signed, but missing mandatory fields.
    let body = r#"{"receivedArtifact":"maker"}"#.to_string();
    let status = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/pipeline/events/webhook"))
        .header("Content-Type", "application/json")
        .header(SIGNATURE_HEADER, sign(SECRET, &body))
        .body(body)
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
}
