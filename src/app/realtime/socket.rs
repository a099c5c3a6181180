use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::events::{ClientEvent, ServerEvent};
use super::rooms::{ConnId, Room};
use crate::app::api::SharedState;
use crate::app::messaging::{self, Origin};
use crate::auth::access_token_from_headers;
use crate::errors::{ApiError, ApiResult};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    token: Option<String>,
}

/// `GET /socket`. The access token is checked before the upgrade so an
/// unauthenticated client gets a plain 401.
pub async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<SocketQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = access_token_from_headers(&headers)
        .or(query.token)
        .ok_or_else(|| ApiError::Unauthorized("Authentication required".to_string()))?;
    let user_id = state
        .tokens
        .verify_access(&token)
        .ok_or_else(|| ApiError::Unauthorized("Invalid or expired token".to_string()))?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, user_id))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: SharedState, user_id: i64) {
    let (conn_id, outbound) = state.rooms.register(user_id).await;
    info!(user_id, conn_id, "socket connected");

    let (sender, receiver) = socket.split();
    run_socket_loop(&state, conn_id, user_id, sender, receiver, outbound).await;

    state.rooms.unregister(conn_id).await;
    info!(user_id, conn_id, "socket disconnected");
}

/// Core socket loop with ping/pong keepalive.
///
/// Forwards queued room frames, dispatches client events and pings on a
/// timer. If no Pong arrives within [`PONG_TIMEOUT`] of a Ping the
/// connection is considered dead and the loop exits. The loop also exits
/// when the registry drops the connection's queue.
async fn run_socket_loop(
    state: &SharedState,
    conn_id: ConnId,
    user_id: i64,
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut outbound: tokio::sync::mpsc::Receiver<std::sync::Arc<String>>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(conn_id, "pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            frame = outbound.recv() => {
                match frame {
                    Some(json) => {
                        if sender.send(Message::Text(json.as_str().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(state, conn_id, user_id, text.as_str()).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Parse and dispatch one client frame. Failures go back to this socket only.
async fn handle_frame(state: &SharedState, conn_id: ConnId, user_id: i64, text: &str) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            let name = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("event").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| "unknown".to_string());
            let err = ApiError::BadRequest(format!("Malformed event: {}", e));
            state
                .rooms
                .emit_to_conn(conn_id, &ServerEvent::error(&name, &err))
                .await;
            return;
        }
    };

    let name = event.name();
    if let Err(err) = dispatch(state, conn_id, user_id, event).await {
        match &err {
            ApiError::Internal(e) => {
                error!(conn_id, user_id, event = name, error = format!("{:#}", e), "socket event failed");
            }
            _ => debug!(conn_id, user_id, event = name, error = %err, "socket event rejected"),
        }
        state
            .rooms
            .emit_to_conn(conn_id, &ServerEvent::error(name, &err))
            .await;
    }
}

async fn dispatch(
    state: &SharedState,
    conn_id: ConnId,
    user_id: i64,
    event: ClientEvent,
) -> ApiResult<()> {
    match event {
        ClientEvent::ProjectJoin { project_id } => {
            let role = state
                .db
                .call(move |db| db.project_role(project_id, user_id))
                .await?;
            if role.is_none() {
                return Err(ApiError::Forbidden(
                    "Not a member of this project".to_string(),
                ));
            }
            join(state, conn_id, Room::Project(project_id)).await;
        }
        ClientEvent::ProjectLeave { project_id } => {
            leave(state, conn_id, Room::Project(project_id)).await;
        }
        ClientEvent::ConversationJoin { conversation_id } => {
            messaging::require_member(state, conversation_id, user_id).await?;
            join(state, conn_id, Room::Conversation(conversation_id)).await;
            state
                .db
                .call(move |db| db.mark_conversation_read(conversation_id, user_id))
                .await?;
        }
        ClientEvent::ConversationLeave { conversation_id } => {
            leave(state, conn_id, Room::Conversation(conversation_id)).await;
        }
        ClientEvent::MessageSend {
            conversation_id,
            content,
        } => {
            messaging::send_message(state, user_id, conversation_id, &content, Origin::Socket)
                .await?;
        }
        ClientEvent::MessageEdit {
            message_id,
            content,
        } => {
            messaging::edit_message(state, user_id, message_id, &content).await?;
        }
        ClientEvent::MessageDelete { message_id } => {
            messaging::delete_message(state, user_id, message_id).await?;
        }
        ClientEvent::TypingStart { conversation_id } => {
            messaging::relay_typing(state, conn_id, user_id, conversation_id, true).await?;
        }
        ClientEvent::TypingStop { conversation_id } => {
            messaging::relay_typing(state, conn_id, user_id, conversation_id, false).await?;
        }
    }
    Ok(())
}

async fn join(state: &SharedState, conn_id: ConnId, room: Room) {
    state.rooms.join(conn_id, room).await;
    state
        .rooms
        .emit_to_conn(
            conn_id,
            &ServerEvent::RoomJoined {
                room: room.to_string(),
            },
        )
        .await;
}

async fn leave(state: &SharedState, conn_id: ConnId, room: Room) {
    state.rooms.leave(conn_id, room).await;
    state
        .rooms
        .emit_to_conn(
            conn_id,
            &ServerEvent::RoomLeft {
                room: room.to_string(),
            },
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::api::testing::{seed_user, test_state};
    use crate::app::models::WorkflowType;

    fn next(rx: &mut tokio::sync::mpsc::Receiver<std::sync::Arc<String>>) -> serde_json::Value {
        serde_json::from_str(&rx.try_recv().expect("frame")).unwrap()
    }

    #[tokio::test]
    async fn non_member_conversation_join_is_scoped_error() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let mallory = seed_user(&state, "Mallory").await;
        let conv = state
            .db
            .call(move |db| {
                let p = db.create_project(ada, "Apollo", "", WorkflowType::Automated)?;
                Ok(db.get_project_conversation(p.id)?.map(|c| c.id))
            })
            .await
            .unwrap()
            .unwrap();
        let (conn, mut rx) = state.rooms.register(mallory).await;
        let (_ada_conn, mut ada_rx) = state.rooms.register(ada).await;

        let frame = format!(r#"{{"event":"conversation:join","data":{{"conversation_id":{}}}}}"#, conv);
        handle_frame(&state, conn, mallory, &frame).await;

        let reply = next(&mut rx);
        assert_eq!(reply["event"], "error");
        assert_eq!(reply["data"]["event"], "conversation:join");
        assert_eq!(reply["data"]["code"], "forbidden");
        assert!(!state.rooms.is_in_room(conn, Room::Conversation(conv)).await);
        assert!(ada_rx.try_recv().is_err());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn storage_failure_is_logged_as_error_and_not_leaked() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .with_max_level(tracing::Level::ERROR)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let conv = state
            .db
            .call(move |db| {
                let p = db.create_project(ada, "Apollo", "", WorkflowType::Automated)?;
                let c = db.get_project_conversation(p.id)?.unwrap();
                crate::app::db::test_support::drop_table(db, "messages");
                Ok(c.id)
            })
            .await
            .unwrap();
        let (conn, mut rx) = state.rooms.register(ada).await;

        let frame = format!(
            r#"{{"event":"message:send","data":{{"conversation_id":{},"content":"hi"}}}}"#,
            conv
        );
        handle_frame(&state, conn, ada, &frame).await;

        let reply = next(&mut rx);
        assert_eq!(reply["data"]["event"], "message:send");
        assert_eq!(reply["data"]["code"], "internal");
        assert_eq!(reply["data"]["message"], "Internal server error");

        let out = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("ERROR"), "{out}");
        assert!(out.contains("socket event failed"), "{out}");
        assert!(out.contains("messages"), "{out}");
    }

    #[tokio::test]
    async fn member_join_marks_read_and_acknowledges() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let bob = seed_user(&state, "Bob").await;
        let conv = state
            .db
            .call(move |db| {
                let p = db.create_project(ada, "Apollo", "", WorkflowType::Automated)?;
                db.add_member(p.id, bob)?;
                let c = db.get_project_conversation(p.id)?.unwrap();
                db.create_message(c.id, ada, "welcome")?;
                Ok(c.id)
            })
            .await
            .unwrap();
        let (conn, mut rx) = state.rooms.register(bob).await;

        let frame = format!(r#"{{"event":"conversation:join","data":{{"conversation_id":{}}}}}"#, conv);
        handle_frame(&state, conn, bob, &frame).await;

        let reply = next(&mut rx);
        assert_eq!(reply["event"], "room:joined");
        assert_eq!(reply["data"]["room"], format!("conversation:{}", conv));
        assert!(state.rooms.is_in_room(conn, Room::Conversation(conv)).await);
        let unread = state.db.call(move |db| db.unread_count(conv, bob)).await.unwrap();
        assert_eq!(unread, 0);
    }

    #[tokio::test]
    async fn project_join_requires_membership() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let eve = seed_user(&state, "Eve").await;
        let project = state
            .db
            .call(move |db| db.create_project(ada, "Apollo", "", WorkflowType::Automated))
            .await
            .unwrap();
        let (eve_conn, mut eve_rx) = state.rooms.register(eve).await;
        let (ada_conn, mut ada_rx) = state.rooms.register(ada).await;

        let frame = format!(r#"{{"event":"project:join","data":{{"project_id":{}}}}}"#, project.id);
        handle_frame(&state, eve_conn, eve, &frame).await;
        handle_frame(&state, ada_conn, ada, &frame).await;

        assert_eq!(next(&mut eve_rx)["event"], "error");
        assert_eq!(next(&mut ada_rx)["event"], "room:joined");
        assert_eq!(state.rooms.room_size(Room::Project(project.id)).await, 1);
    }

    #[tokio::test]
    async fn malformed_frame_gets_scoped_error() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let (conn, mut rx) = state.rooms.register(ada).await;

        handle_frame(&state, conn, ada, r#"{"event":"message:send","data":{}}"#).await;
        let reply = next(&mut rx);
        assert_eq!(reply["event"], "error");
        assert_eq!(reply["data"]["event"], "message:send");
        assert_eq!(reply["data"]["code"], "bad_request");

        handle_frame(&state, conn, ada, "garbage").await;
        assert_eq!(next(&mut rx)["data"]["event"], "unknown");
    }
}
