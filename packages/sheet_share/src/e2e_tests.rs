//! End-to-end tests: the real router on a loopback port, driven by
//! tokio-tungstenite clients.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

use crate::client::{ControllerEvent, ReconnectPolicy, ReconnectingClient, WsConnector};
use crate::config::{ServerConfig, ServerFileConfig};
use crate::ws::{ClientMessage, ServerMessage};

/// Timeout for each async operation in tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start the relay on a random port and return its address.
async fn start_server(sweep_interval_secs: u64) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig::from_file(&ServerFileConfig {
        sweep_interval_secs,
        ..Default::default()
    });
    tokio::spawn(crate::serve(listener, config, std::future::pending()));
    addr
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = timeout(
        TEST_TIMEOUT,
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws")),
    )
    .await
    .expect("timed out connecting")
    .expect("connect failed");
    ws
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send failed");
}

async fn recv_json(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(TEST_TIMEOUT, ws.next())
            .await
            .expect("timed out reading message")
            .expect("stream closed")
            .expect("read error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("server sent invalid JSON");
        }
    }
}

/// Read messages until `predicate` matches, discarding the rest.
async fn read_until(ws: &mut Ws, predicate: impl Fn(&Value) -> bool, max_messages: usize) -> Value {
    for _ in 0..max_messages {
        let msg = recv_json(ws).await;
        if predicate(&msg) {
            return msg;
        }
    }
    panic!("no matching message within {max_messages} messages");
}

async fn next_event(events: &mut mpsc::Receiver<ControllerEvent>) -> ControllerEvent {
    timeout(TEST_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

fn is_type(kind: &'static str) -> impl Fn(&Value) -> bool {
    move |v| v["type"] == kind
}

/// Connect and consume the two greeting messages.
async fn connect_greeted(addr: SocketAddr) -> Ws {
    let mut ws = connect(addr).await;
    assert_eq!(recv_json(&mut ws).await["type"], "connection-established");
    assert_eq!(recv_json(&mut ws).await["type"], "online-users");
    ws
}

#[tokio::test]
async fn test_presence_and_share_scenario() {
    let addr = start_server(1).await;

    // nova registers
    let mut nova = connect_greeted(addr).await;
    send_json(&mut nova, json!({"type": "register-user", "username": "nova"})).await;
    read_until(&mut nova, is_type("register-confirmed"), 5).await;
    let snapshot = read_until(&mut nova, is_type("online-users"), 5).await;
    assert_eq!(snapshot["users"], json!(["nova"]));

    // zed registers; nova sees both
    let mut zed = connect_greeted(addr).await;
    send_json(&mut zed, json!({"type": "register-user", "username": "zed"})).await;
    let snapshot = read_until(
        &mut nova,
        |v| v["type"] == "online-users" && v["users"] == json!(["nova", "zed"]),
        10,
    )
    .await;
    assert_eq!(snapshot["users"], json!(["nova", "zed"]));

    // nova shares a character
    send_json(
        &mut nova,
        json!({"type": "share-character", "content": {"name": "Rex"}, "username": "nova"}),
    )
    .await;
    let shared = read_until(&mut zed, is_type("shared-character"), 10).await;
    assert_eq!(shared["content"], json!({"name": "Rex"}));
    assert_eq!(shared["sharedBy"], "nova");
    let confirmed = read_until(&mut nova, is_type("share-confirmed"), 10).await;
    assert_eq!(confirmed["delivered"], 1);

    // nova disconnects
    nova.close(None).await.unwrap();
    let leave = read_until(&mut zed, is_type("user-status"), 10).await;
    assert_eq!(leave["action"], "leave");
    assert_eq!(leave["username"], "nova");
    let snapshot = read_until(&mut zed, is_type("online-users"), 10).await;
    assert_eq!(snapshot["users"], json!(["zed"]));
}

#[tokio::test]
async fn test_malformed_frames_get_one_error_each() {
    let addr = start_server(30).await;
    let mut a = connect_greeted(addr).await;
    let mut b = connect_greeted(addr).await;

    send_json(&mut a, json!({"type": "register-user", "username": "nova"})).await;
    read_until(&mut a, is_type("online-users"), 5).await;
    read_until(&mut b, |v| v["users"] == json!(["nova"]), 5).await;

    a.send(Message::Text("{not json".into())).await.unwrap();
    let err = recv_json(&mut a).await;
    assert_eq!(err["type"], "error");
    assert!(err["detail"].is_object());

    send_json(&mut a, json!({"type": "teleport"})).await;
    let err = recv_json(&mut a).await;
    assert_eq!(err["type"], "error");
    assert!(err["message"].as_str().unwrap().contains("teleport"));

    // Presence is untouched and b saw nothing: its next message is the ack
    // of a share, not a presence update
    send_json(&mut a, json!({"type": "share-character", "content": {"name": "Rex"}})).await;
    let next = recv_json(&mut b).await;
    assert_eq!(next["type"], "shared-character");
    assert_eq!(next["sharedBy"], "nova");
}

#[tokio::test]
async fn test_kind_discriminator_is_accepted() {
    let addr = start_server(30).await;
    let mut ws = connect_greeted(addr).await;
    send_json(&mut ws, json!({"kind": "register-user", "username": "zed"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "register-confirmed");
}

#[tokio::test]
async fn test_duplicate_identity_survives_one_disconnect() {
    let addr = start_server(30).await;
    let mut tab1 = connect_greeted(addr).await;
    let mut tab2 = connect_greeted(addr).await;
    let mut watcher = connect_greeted(addr).await;

    send_json(&mut tab1, json!({"type": "register-user", "username": "nova"})).await;
    read_until(&mut watcher, |v| v["users"] == json!(["nova"]), 5).await;
    send_json(&mut tab2, json!({"type": "register-user", "username": "nova"})).await;
    read_until(&mut tab2, is_type("online-users"), 5).await;

    tab1.close(None).await.unwrap();
    // Drain tab1 until the server finishes the closing handshake
    while let Ok(Some(Ok(_))) = timeout(TEST_TIMEOUT, tab1.next()).await {}
    tokio::time::sleep(Duration::from_millis(200)).await;

    send_json(&mut tab2, json!({"type": "share-character", "content": {}})).await;
    let mut seen = Vec::new();
    loop {
        let msg = recv_json(&mut watcher).await;
        if msg["type"] == "shared-character" {
            assert_eq!(msg["sharedBy"], "nova");
            break;
        }
        seen.push(msg);
    }
    assert!(
        seen.iter().all(|m| m["type"] != "user-status"),
        "unexpected presence change: {seen:?}"
    );
}

#[tokio::test]
async fn test_reconnecting_client_against_live_server() {
    let addr = start_server(30).await;
    let mut peer = connect_greeted(addr).await;

    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts: 3,
    };
    let (client, mut events) =
        ReconnectingClient::spawn(WsConnector::new(format!("ws://{addr}/ws")), policy);

    assert_eq!(next_event(&mut events).await, ControllerEvent::Opened);
    client
        .send(&ClientMessage::RegisterUser {
            username: "zed".into(),
        })
        .unwrap();

    // Peer hears about the client's registration
    let joined = read_until(&mut peer, is_type("user-status"), 5).await;
    assert_eq!(joined["username"], "zed");

    // Client receives typed messages
    loop {
        if let ControllerEvent::Message(ServerMessage::RegisterConfirmed { .. }) =
            next_event(&mut events).await
        {
            break;
        }
    }

    client.close();
    loop {
        if let ControllerEvent::Closed { deliberate, .. } = next_event(&mut events).await {
            assert!(deliberate);
            break;
        }
    }
    let leave = read_until(&mut peer, is_type("user-status"), 5).await;
    assert_eq!(leave["action"], "leave");
    assert_eq!(leave["username"], "zed");
}
