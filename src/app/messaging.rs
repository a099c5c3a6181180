//! Chat operations shared by the socket handler and the REST routes.
//!
//! Each operation validates membership or authorship, persists the change,
//! then emits to the conversation room. The REST send path additionally
//! notifies every other member through their personal room and bumps the
//! conversation's `updated_at`.

use tracing::debug;

use crate::app::api::SharedState;
use crate::app::models::{Conversation, Message};
use crate::app::realtime::events::ServerEvent;
use crate::app::realtime::rooms::{ConnId, Room};
use crate::errors::{ApiError, ApiResult};

/// Where a send request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Socket,
    Rest,
}

/// Load a conversation and check the user belongs to it.
pub async fn require_member(
    state: &SharedState,
    conversation_id: i64,
    user_id: i64,
) -> ApiResult<Conversation> {
    let conversation = state
        .db
        .call(move |db| db.get_conversation(conversation_id))
        .await?
        .ok_or_else(|| ApiError::not_found("Conversation", conversation_id))?;
    if !conversation.has_member(user_id) {
        return Err(ApiError::Forbidden(
            "Not a member of this conversation".to_string(),
        ));
    }
    Ok(conversation)
}

/// Load a message and check `user_id` sent it.
async fn require_sender(state: &SharedState, message_id: i64, user_id: i64) -> ApiResult<Message> {
    let message = state
        .db
        .call(move |db| db.get_message(message_id))
        .await?
        .ok_or_else(|| ApiError::not_found("Message", message_id))?;
    if message.sender_id != user_id {
        return Err(ApiError::Forbidden(
            "Only the sender can modify this message".to_string(),
        ));
    }
    Ok(message)
}

fn validate_content(content: &str) -> ApiResult<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest("Message content is required".to_string()));
    }
    Ok(trimmed.to_string())
}

pub async fn send_message(
    state: &SharedState,
    sender_id: i64,
    conversation_id: i64,
    content: &str,
    origin: Origin,
) -> ApiResult<Message> {
    let content = validate_content(content)?;
    let conversation = require_member(state, conversation_id, sender_id).await?;

    let message = state
        .db
        .call(move |db| {
            let message = db.create_message(conversation_id, sender_id, &content)?;
            if origin == Origin::Rest {
                db.touch_conversation(conversation_id)?;
            }
            Ok(message)
        })
        .await?;

    let event = ServerEvent::MessageNew(message.clone());
    state
        .rooms
        .emit(Room::Conversation(conversation_id), &event, None)
        .await;
    if origin == Origin::Rest {
        for member in conversation.member_ids() {
            if member != sender_id {
                state.rooms.emit_to_user(member, &event).await;
            }
        }
    }
    debug!(conversation_id, message_id = message.id, ?origin, "message sent");
    Ok(message)
}

pub async fn edit_message(
    state: &SharedState,
    editor_id: i64,
    message_id: i64,
    content: &str,
) -> ApiResult<Message> {
    let content = validate_content(content)?;
    require_sender(state, message_id, editor_id).await?;
    let message = state
        .db
        .call(move |db| db.update_message_content(message_id, &content))
        .await?;
    state
        .rooms
        .emit(
            Room::Conversation(message.conversation_id),
            &ServerEvent::MessageEdited(message.clone()),
            None,
        )
        .await;
    Ok(message)
}

pub async fn delete_message(state: &SharedState, user_id: i64, message_id: i64) -> ApiResult<()> {
    let message = require_sender(state, message_id, user_id).await?;
    state
        .db
        .call(move |db| db.delete_message(message_id))
        .await?;
    state
        .rooms
        .emit(
            Room::Conversation(message.conversation_id),
            &ServerEvent::MessageDeleted {
                message_id,
                conversation_id: message.conversation_id,
            },
            None,
        )
        .await;
    Ok(())
}

/// Relay a typing indicator to the other sockets in the conversation room.
pub async fn relay_typing(
    state: &SharedState,
    conn_id: ConnId,
    user_id: i64,
    conversation_id: i64,
    typing: bool,
) -> ApiResult<()> {
    require_member(state, conversation_id, user_id).await?;
    let event = if typing {
        ServerEvent::UserTyping {
            conversation_id,
            user_id,
        }
    } else {
        ServerEvent::UserStopped {
            conversation_id,
            user_id,
        }
    };
    state
        .rooms
        .emit(Room::Conversation(conversation_id), &event, Some(conn_id))
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::api::testing::{seed_user, test_state};
    use crate::app::models::WorkflowType;

    fn frames(rx: &mut tokio::sync::mpsc::Receiver<std::sync::Arc<String>>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    async fn project_chat(state: &SharedState) -> (i64, i64, i64) {
        let ada = seed_user(state, "Ada").await;
        let bob = seed_user(state, "Bob").await;
        let conv = state
            .db
            .call(move |db| {
                let p = db.create_project(ada, "Apollo", "", WorkflowType::Automated)?;
                db.add_member(p.id, bob)?;
                Ok(db.get_project_conversation(p.id)?.map(|c| c.id))
            })
            .await
            .unwrap()
            .unwrap();
        (ada, bob, conv)
    }

    #[tokio::test]
    async fn rest_send_fans_out_without_sender_duplicate() {
        let state = test_state();
        let (ada, bob, conv) = project_chat(&state).await;
        let (ada_conn, mut ada_rx) = state.rooms.register(ada).await;
        let (bob_conn, mut bob_rx) = state.rooms.register(bob).await;
        state.rooms.join(ada_conn, Room::Conversation(conv)).await;
        state.rooms.join(bob_conn, Room::Conversation(conv)).await;

        send_message(&state, ada, conv, "hello", Origin::Rest).await.unwrap();

        // Ada: once via the conversation room only.
        let ada_frames = frames(&mut ada_rx);
        assert_eq!(ada_frames.len(), 1);
        assert_eq!(ada_frames[0]["event"], "message:new");
        // Bob: conversation room plus personal room.
        let bob_frames = frames(&mut bob_rx);
        assert_eq!(bob_frames.len(), 2);
        assert!(bob_frames.iter().all(|f| f["event"] == "message:new"));
    }

    #[tokio::test]
    async fn socket_send_only_targets_conversation_room() {
        let state = test_state();
        let (ada, bob, conv) = project_chat(&state).await;
        let (_bob_conn, mut bob_rx) = state.rooms.register(bob).await;

        send_message(&state, ada, conv, "hi", Origin::Socket).await.unwrap();
        assert!(frames(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn send_rejects_empty_and_non_members() {
        let state = test_state();
        let (ada, _bob, conv) = project_chat(&state).await;
        let carol = seed_user(&state, "Carol").await;

        let err = send_message(&state, ada, conv, "   ", Origin::Rest).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
        let err = send_message(&state, carol, conv, "hi", Origin::Rest).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        let err = send_message(&state, ada, 9999, "hi", Origin::Rest).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn non_sender_cannot_edit_or_delete() {
        let state = test_state();
        let (ada, bob, conv) = project_chat(&state).await;
        let msg = send_message(&state, ada, conv, "original", Origin::Socket).await.unwrap();

        let err = edit_message(&state, bob, msg.id, "hijack").await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
        let err = delete_message(&state, bob, msg.id).await.unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));

        let id = msg.id;
        let stored = state.db.call(move |db| db.get_message(id)).await.unwrap().unwrap();
        assert_eq!(stored.content, "original");
        assert!(!stored.is_edited);
    }

    #[tokio::test]
    async fn edit_and_delete_emit_to_room() {
        let state = test_state();
        let (ada, bob, conv) = project_chat(&state).await;
        let (bob_conn, mut bob_rx) = state.rooms.register(bob).await;
        state.rooms.join(bob_conn, Room::Conversation(conv)).await;
        let msg = send_message(&state, ada, conv, "v1", Origin::Socket).await.unwrap();

        let edited = edit_message(&state, ada, msg.id, "v2").await.unwrap();
        assert!(edited.is_edited);
        delete_message(&state, ada, msg.id).await.unwrap();

        let events: Vec<String> = frames(&mut bob_rx)
            .iter()
            .map(|f| f["event"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(events, vec!["message:new", "message:edited", "message:deleted"]);
    }

    #[tokio::test]
    async fn edit_missing_message_is_not_found() {
        let state = test_state();
        let (ada, _bob, _conv) = project_chat(&state).await;
        let err = edit_message(&state, ada, 404, "x").await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn typing_skips_the_typist() {
        let state = test_state();
        let (ada, bob, conv) = project_chat(&state).await;
        let (ada_conn, mut ada_rx) = state.rooms.register(ada).await;
        let (bob_conn, mut bob_rx) = state.rooms.register(bob).await;
        state.rooms.join(ada_conn, Room::Conversation(conv)).await;
        state.rooms.join(bob_conn, Room::Conversation(conv)).await;

        relay_typing(&state, ada_conn, ada, conv, true).await.unwrap();
        assert!(frames(&mut ada_rx).is_empty());
        let bob_frames = frames(&mut bob_rx);
        assert_eq!(bob_frames.len(), 1);
        assert_eq!(bob_frames[0]["event"], "typing:user_typing");
        assert_eq!(bob_frames[0]["data"]["user_id"], ada);
    }
}
