//! End-to-end tests over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use parley_server::{start, Backends, ServerConfig, ServerHandle, Services};
use parley_settings::Settings;

const WAIT: Duration = Duration::from_secs(5);

async fn boot() -> ServerHandle {
    let services = Arc::new(Services::new(Backends::in_memory(), &Settings::default()));
    start(ServerConfig::default(), services).await.unwrap()
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    async fn connect(handle: &ServerHandle) -> Self {
        let url = format!("ws://127.0.0.1:{}/ws", handle.port);
        let (ws, _) = connect_async(url).await.unwrap();
        Self { ws }
    }

    async fn send(&mut self, frame: Value) {
        self.ws.send(Message::Text(frame.to_string().into())).await.unwrap();
    }

    /// Next text frame as JSON, or `None` once the server closes the socket.
    async fn next_envelope(&mut self) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a frame");
            match frame {
                Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(other)) => panic!("unexpected frame {other:?}"),
            }
        }
    }

    /// Skip frames until one of `kind` arrives.
    async fn expect(&mut self, kind: &str) -> Value {
        loop {
            let env = self.next_envelope().await.expect("connection closed");
            if env["type"] == kind {
                return env;
            }
        }
    }

    async fn login(&mut self, user: &str) {
        self.send(json!({"type": "login", "data": {"user_id": user, "token": "t", "platform": "test"}}))
            .await;
        let reply = self.expect("login").await;
        assert_eq!(reply["data"]["success"], true);
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn login_and_heartbeat() {
    let handle = boot().await;
    let mut client = Client::connect(&handle).await;

    client.send(json!({"type": "heartbeat", "message_id": "hb-1"})).await;
    let beat = client.expect("heartbeat").await;
    assert_eq!(beat["message_id"], "hb-1");
    assert!(beat["data"]["timestamp"].as_i64().unwrap() > 0);

    client.login("alice").await;
    assert_eq!(handle.services().registry.online_users(), 1);

    handle.shutdown(Some(WAIT)).await;
}

#[tokio::test]
async fn private_message_reaches_online_receiver() {
    let handle = boot().await;
    let mut alice = Client::connect(&handle).await;
    let mut bob = Client::connect(&handle).await;
    alice.login("alice").await;
    bob.login("bob").await;

    alice
        .send(json!({"type": "send_message", "data": {"receiver_id": "bob", "type": "text", "content": "hello bob"}}))
        .await;
    let sent = alice.expect("send_message").await;
    let id = sent["data"]["id"].as_str().unwrap().to_string();

    let push = bob.expect("new_message").await;
    assert_eq!(push["data"]["id"], id.as_str());
    assert_eq!(push["data"]["sender_id"], "alice");
    assert_eq!(push["data"]["content"], "hello bob");

    bob.send(json!({"type": "ack", "data": {"message_id": id, "status": "read"}})).await;
    let ack = bob.expect("ack").await;
    assert_eq!(ack["data"]["applied"], true);

    handle.shutdown(Some(WAIT)).await;
}

#[tokio::test]
async fn offline_messages_are_synced_after_login() {
    let handle = boot().await;
    let mut alice = Client::connect(&handle).await;
    alice.login("alice").await;
    for i in 0..3 {
        alice
            .send(json!({"type": "send_message", "data": {"receiver_id": "bob", "content": format!("m{i}")}}))
            .await;
        let _ = alice.expect("send_message").await;
    }

    let mut bob = Client::connect(&handle).await;
    bob.login("bob").await;
    bob.send(json!({"type": "sync_offline", "data": {"limit": 10}})).await;
    let page = bob.expect("sync_offline").await;
    let contents: Vec<&str> = page["data"]["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["m0", "m1", "m2"]);
    assert_eq!(page["data"]["has_more"], false);

    handle.shutdown(Some(WAIT)).await;
}

#[tokio::test]
async fn second_login_evicts_first_connection() {
    let handle = boot().await;
    let mut first = Client::connect(&handle).await;
    first.login("alice").await;
    let mut second = Client::connect(&handle).await;
    second.login("alice").await;

    assert!(first.next_envelope().await.is_none());
    let registry = handle.services().registry.clone();
    wait_until(|| registry.count() == 1).await;
    assert_eq!(registry.online_users(), 1);

    // The surviving connection still works.
    second.send(json!({"type": "heartbeat"})).await;
    let _ = second.expect("heartbeat").await;

    handle.shutdown(Some(WAIT)).await;
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let handle = boot().await;
    let mut client = Client::connect(&handle).await;
    let limit = Settings::default().session.max_frame_bytes;

    client
        .send(json!({"type": "heartbeat", "data": {"pad": "x".repeat(limit)}}))
        .await;
    assert!(client.next_envelope().await.is_none());

    let registry = handle.services().registry.clone();
    wait_until(|| registry.count() == 0).await;
    handle.shutdown(Some(WAIT)).await;
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let handle = boot().await;
    let mut client = Client::connect(&handle).await;

    client.ws.send(Message::Text("not json".to_string().into())).await.unwrap();
    let err = client.expect("error").await;
    assert_eq!(err["data"]["code"], "PROTOCOL_ERROR");

    client.send(json!({"type": "heartbeat"})).await;
    let _ = client.expect("heartbeat").await;

    handle.shutdown(Some(WAIT)).await;
}

#[tokio::test]
async fn shutdown_closes_live_sessions() {
    let handle = boot().await;
    let mut client = Client::connect(&handle).await;
    client.login("alice").await;

    handle.shutdown(Some(WAIT)).await;
    assert!(client.next_envelope().await.is_none());
}
