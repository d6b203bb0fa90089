use chat_server::api::{build_router, AppState};
use chat_server::config::Config;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let state = AppState::new(Config::in_memory(addr.to_string())).await.unwrap();
    let app = build_router(state);
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server)
}

async fn next_frame(ws: &mut Ws) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str::<Value>(&text).unwrap(),
                _ => continue,
            }
        }
    })
    .await
    .expect("no frame within 5s")
}

/// Skip frames until one named `event` arrives and return its data.
async fn expect_event(ws: &mut Ws, event: &str) -> Value {
    loop {
        let frame = next_frame(ws).await;
        if frame["event"] == event {
            return frame["data"].clone();
        }
    }
}

async fn emit(ws: &mut Ws, event: &str, data: Value) {
    let frame = json!({"event": event, "data": data}).to_string();
    ws.send(WsMessage::Text(frame)).await.unwrap();
}

async fn open(addr: SocketAddr) -> Ws {
    let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    let hello = next_frame(&mut ws).await;
    assert_eq!(hello["event"], "connected");
    assert!(hello["data"]["sessionId"].is_string());
    let count = next_frame(&mut ws).await;
    assert_eq!(count["event"], "online_users_count");
    ws
}

async fn open_registered(addr: SocketAddr, user_id: &str, username: &str) -> Ws {
    let mut ws = open(addr).await;
    emit(
        &mut ws,
        "register_user",
        json!({"userId": user_id, "username": username, "firstName": username, "lastName": ""}),
    )
    .await;
    expect_event(&mut ws, "online_users_count").await;
    ws
}

#[tokio::test]
async fn room_chat_flow() {
    let (addr, server) = spawn_server().await;

    let mut alice = open_registered(addr, "u1", "alice").await;
    emit(&mut alice, "join_room", json!("general")).await;
    let history = expect_event(&mut alice, "previous_messages").await;
    assert_eq!(history, json!([]));

    let mut bob = open_registered(addr, "u2", "bob").await;
    let online = expect_event(&mut alice, "user_online").await;
    assert_eq!(online["userId"], "u2");
    assert_eq!(online["username"], "bob");
    assert_eq!(expect_event(&mut alice, "online_users_count").await, 2);

    emit(&mut bob, "join_room", json!({"roomId": "general"})).await;
    expect_event(&mut bob, "previous_messages").await;

    emit(
        &mut alice,
        "send_message",
        json!({"roomId": "general", "text": "hi", "sender": "u1", "senderUsername": "alice"}),
    )
    .await;
    for ws in [&mut alice, &mut bob] {
        let msg = expect_event(ws, "receive_message").await;
        assert_eq!(msg["text"], "hi");
        assert_eq!(msg["roomId"], "general");
        assert_eq!(msg["sender"], "u1");
        assert_eq!(msg["isPrivate"], false);
    }

    emit(&mut bob, "typing", json!({"roomId": "general", "username": "bob"})).await;
    assert_eq!(expect_event(&mut alice, "user_typing").await["username"], "bob");
    emit(&mut bob, "stop_typing", json!({"roomId": "general"})).await;
    expect_event(&mut alice, "user_stop_typing").await;

    alice.close(None).await.unwrap();
    let offline = expect_event(&mut bob, "user_offline").await;
    assert_eq!(offline["userId"], "u1");
    assert_eq!(expect_event(&mut bob, "online_users_count").await, 1);

    let mut carol = open_registered(addr, "u3", "carol").await;
    emit(&mut carol, "join_room", json!("general")).await;
    let history = expect_event(&mut carol, "previous_messages").await;
    let texts: Vec<_> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(texts, ["hi"]);

    server.abort();
}

#[tokio::test]
async fn direct_message_reaches_recipient_and_history() {
    let (addr, server) = spawn_server().await;
    let mut u1 = open_registered(addr, "u1", "alice").await;
    let mut u2 = open_registered(addr, "u2", "bob").await;

    emit(
        &mut u2,
        "direct_message",
        json!({"recipientId": "u1", "text": "psst", "sender": "u2", "senderUsername": "bob"}),
    )
    .await;
    for ws in [&mut u1, &mut u2] {
        let msg = expect_event(ws, "private_message").await;
        assert_eq!(msg["roomId"], "u1-u2");
        assert_eq!(msg["text"], "psst");
        assert_eq!(msg["isPrivate"], true);
    }

    let history: Value = reqwest::get(format!("http://{}/api/messages/u1-u2", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["sender"], "u2");
    server.abort();
}

#[tokio::test]
async fn unregistered_disconnect_is_silent() {
    let (addr, server) = spawn_server().await;
    let mut watcher = open_registered(addr, "u9", "watcher").await;
    let mut ghost = open(addr).await;
    ghost.close(None).await.unwrap();

    let frame = next_frame(&mut watcher).await;
    assert_eq!(frame["event"], "online_users_count");
    assert_eq!(frame["data"], 1);
    server.abort();
}

#[tokio::test]
async fn two_tabs_are_two_presence_entries() {
    let (addr, server) = spawn_server().await;
    let _tab1 = open_registered(addr, "u1", "alice").await;
    let _tab2 = open_registered(addr, "u1", "alice").await;

    let online: Value = reqwest::get(format!("http://{}/api/users/online", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = online.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e["userId"] == "u1"));
    assert_ne!(entries[0]["sessionId"], entries[1]["sessionId"]);
    server.abort();
}

#[tokio::test]
async fn bad_frames_get_error_replies() {
    let (addr, server) = spawn_server().await;
    let mut ws = open(addr).await;

    ws.send(WsMessage::Text("{nope".into())).await.unwrap();
    assert_eq!(expect_event(&mut ws, "error").await["reason"], "malformed_frame");

    emit(&mut ws, "join_room", json!("general")).await;
    let err = expect_event(&mut ws, "error").await;
    assert_eq!(err["event"], "join_room");
    assert_eq!(err["reason"], "not_registered");

    emit(&mut ws, "fly", json!({})).await;
    assert_eq!(expect_event(&mut ws, "error").await["reason"], "unknown_event");
    server.abort();
}
