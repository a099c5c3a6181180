//! End-to-end socket tests against a server on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use taskify::app::api::{AppState, SharedState};
use taskify::app::db::{DbHandle, TaskifyDb};
use taskify::app::models::{ConversationKind, WorkflowType};
use taskify::config::TaskifyConfig;
use taskify::integrations::NoopMailer;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: SharedState,
    _shutdown: oneshot::Sender<()>,
}

async fn start() -> TestServer {
    let mut config = TaskifyConfig::default();
    config.server.dev_mode = true;
    config.validate().unwrap();
    let db = DbHandle::new(TaskifyDb::new_in_memory().unwrap());
    let state: SharedState =
        Arc::new(AppState::new(db, config, Arc::new(NoopMailer), None).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let serve_state = state.clone();
    tokio::spawn(async move {
        taskify::app::server::serve(listener, serve_state, async {
            let _ = rx.await;
        })
        .await
        .unwrap();
    });
    TestServer {
        addr,
        state,
        _shutdown: tx,
    }
}

/// Ada owns a project with Bob as member and a group chat between them.
/// Eve is registered but outside the project.
async fn seed(state: &SharedState) -> (i64, i64, i64, i64) {
    state
        .db
        .call(|db| {
            let ada = db.create_user("Ada", "ada@example.com", "hash")?;
            let bob = db.create_user("Bob", "bob@example.com", "hash")?;
            let eve = db.create_user("Eve", "eve@example.com", "hash")?;
            let project = db.create_project(ada.id, "Apollo", "", WorkflowType::Automated)?;
            db.add_member(project.id, bob.id)?;
            let conversation = db.create_conversation(
                project.id,
                ConversationKind::Group,
                Some("crew"),
                ada.id,
                &[bob.id],
            )?;
            Ok((ada.id, bob.id, eve.id, conversation.id))
        })
        .await
        .unwrap()
}

async fn connect(server: &TestServer, user_id: i64) -> Socket {
    let token = server.state.tokens.issue_access(user_id).unwrap();
    let url = format!("ws://{}/socket?token={}", server.addr, token);
    let (socket, _) = connect_async(url).await.unwrap();
    socket
}

async fn send(socket: &mut Socket, event: Value) {
    socket.send(Message::text(event.to_string())).await.unwrap();
}

/// Next text frame as JSON, or `None` if nothing arrives in time.
async fn next_event(socket: &mut Socket, wait: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let frame = tokio::time::timeout_at(deadline, socket.next()).await.ok()??;
        if let Message::Text(text) = frame.ok()? {
            return serde_json::from_str(text.as_str()).ok();
        }
    }
}

async fn expect_event(socket: &mut Socket) -> Value {
    next_event(socket, Duration::from_secs(2))
        .await
        .expect("expected a frame")
}

fn http() -> reqwest::Client {
    reqwest::Client::new()
}

#[tokio::test]
async fn socket_rejects_missing_token() {
    let server = start().await;
    let url = format!("ws://{}/socket", server.addr);
    match connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn non_member_cannot_join_conversation() {
    let server = start().await;
    let (_ada, _bob, eve, conversation) = seed(&server.state).await;

    let mut socket = connect(&server, eve).await;
    send(
        &mut socket,
        json!({"event": "conversation:join", "data": {"conversation_id": conversation}}),
    )
    .await;

    let reply = expect_event(&mut socket).await;
    assert_eq!(reply["event"], "error");
    assert_eq!(reply["data"]["event"], "conversation:join");
    assert_eq!(reply["data"]["code"], "forbidden");
    assert!(next_event(&mut socket, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn rest_send_fans_out_once_per_recipient() {
    let server = start().await;
    let (ada, bob, _eve, conversation) = seed(&server.state).await;

    let mut ada_socket = connect(&server, ada).await;
    send(
        &mut ada_socket,
        json!({"event": "conversation:join", "data": {"conversation_id": conversation}}),
    )
    .await;
    let joined = expect_event(&mut ada_socket).await;
    assert_eq!(joined["event"], "room:joined");
    let mut bob_socket = connect(&server, bob).await;
    // Any acknowledged frame proves Bob's connection is registered.
    send(
        &mut bob_socket,
        json!({"event": "conversation:leave", "data": {"conversation_id": conversation}}),
    )
    .await;
    assert_eq!(expect_event(&mut bob_socket).await["event"], "room:left");

    let token = server.state.tokens.issue_access(ada).unwrap();
    let response = http()
        .post(format!(
            "http://{}/api/v1/conversations/{}/messages",
            server.addr, conversation
        ))
        .bearer_auth(token)
        .json(&json!({"content": "liftoff"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // The sender sees it through the conversation room only.
    let frame = expect_event(&mut ada_socket).await;
    assert_eq!(frame["event"], "message:new");
    assert_eq!(frame["data"]["content"], "liftoff");
    assert!(next_event(&mut ada_socket, Duration::from_millis(200)).await.is_none());

    // Bob has not joined the room and hears it through his personal room.
    let frame = expect_event(&mut bob_socket).await;
    assert_eq!(frame["event"], "message:new");
    assert_eq!(frame["data"]["sender_id"], ada);
    assert!(next_event(&mut bob_socket, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn socket_send_reaches_room_and_non_sender_edit_is_forbidden() {
    let server = start().await;
    let (ada, bob, _eve, conversation) = seed(&server.state).await;

    let mut ada_socket = connect(&server, ada).await;
    let mut bob_socket = connect(&server, bob).await;
    for socket in [&mut ada_socket, &mut bob_socket] {
        send(
            socket,
            json!({"event": "conversation:join", "data": {"conversation_id": conversation}}),
        )
        .await;
        assert_eq!(expect_event(socket).await["event"], "room:joined");
    }

    send(
        &mut ada_socket,
        json!({"event": "message:send", "data": {"conversation_id": conversation, "content": "hello"}}),
    )
    .await;
    let frame = expect_event(&mut bob_socket).await;
    assert_eq!(frame["event"], "message:new");
    let message_id = frame["data"]["id"].as_i64().unwrap();
    assert_eq!(expect_event(&mut ada_socket).await["event"], "message:new");

    let bob_token = server.state.tokens.issue_access(bob).unwrap();
    let response = http()
        .patch(format!("http://{}/api/v1/messages/{}", server.addr, message_id))
        .bearer_auth(&bob_token)
        .json(&json!({"content": "hijacked"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    send(
        &mut bob_socket,
        json!({"event": "message:delete", "data": {"message_id": message_id}}),
    )
    .await;
    let reply = expect_event(&mut bob_socket).await;
    assert_eq!(reply["event"], "error");
    assert_eq!(reply["data"]["code"], "forbidden");

    let messages: Vec<Value> = http()
        .get(format!(
            "http://{}/api/v1/conversations/{}/messages",
            server.addr, conversation
        ))
        .bearer_auth(&bob_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "hello");
}
