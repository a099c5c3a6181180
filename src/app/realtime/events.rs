//! Socket frame types.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::app::models::{Conversation, Message, Notification, Task};
use crate::errors::ApiError;

// ── Client → server ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "project:join")]
    ProjectJoin { project_id: i64 },
    #[serde(rename = "project:leave")]
    ProjectLeave { project_id: i64 },
    #[serde(rename = "conversation:join")]
    ConversationJoin { conversation_id: i64 },
    #[serde(rename = "conversation:leave")]
    ConversationLeave { conversation_id: i64 },
    #[serde(rename = "message:send")]
    MessageSend { conversation_id: i64, content: String },
    #[serde(rename = "message:edit")]
    MessageEdit { message_id: i64, content: String },
    #[serde(rename = "message:delete")]
    MessageDelete { message_id: i64 },
    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: i64 },
    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: i64 },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::ProjectJoin { .. } => "project:join",
            ClientEvent::ProjectLeave { .. } => "project:leave",
            ClientEvent::ConversationJoin { .. } => "conversation:join",
            ClientEvent::ConversationLeave { .. } => "conversation:leave",
            ClientEvent::MessageSend { .. } => "message:send",
            ClientEvent::MessageEdit { .. } => "message:edit",
            ClientEvent::MessageDelete { .. } => "message:delete",
            ClientEvent::TypingStart { .. } => "typing:start",
            ClientEvent::TypingStop { .. } => "typing:stop",
        }
    }
}

// ── Server → client ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew(Message),
    #[serde(rename = "message:edited")]
    MessageEdited(Message),
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        message_id: i64,
        conversation_id: i64,
    },
    #[serde(rename = "conversation:created")]
    ConversationCreated(Conversation),
    #[serde(rename = "typing:user_typing")]
    UserTyping { conversation_id: i64, user_id: i64 },
    #[serde(rename = "typing:user_stopped")]
    UserStopped { conversation_id: i64, user_id: i64 },
    #[serde(rename = "notification:new")]
    NotificationNew(Notification),
    #[serde(rename = "task:created")]
    TaskCreated(Task),
    #[serde(rename = "task:updated")]
    TaskUpdated(Task),
    #[serde(rename = "task:deleted")]
    TaskDeleted { task_id: i64, project_id: i64 },
    #[serde(rename = "room:joined")]
    RoomJoined { room: String },
    #[serde(rename = "room:left")]
    RoomLeft { room: String },
    #[serde(rename = "error")]
    Error {
        event: String,
        message: String,
        code: &'static str,
    },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::MessageNew(_) => "message:new",
            ServerEvent::MessageEdited(_) => "message:edited",
            ServerEvent::MessageDeleted { .. } => "message:deleted",
            ServerEvent::ConversationCreated(_) => "conversation:created",
            ServerEvent::UserTyping { .. } => "typing:user_typing",
            ServerEvent::UserStopped { .. } => "typing:user_stopped",
            ServerEvent::NotificationNew(_) => "notification:new",
            ServerEvent::TaskCreated(_) => "task:created",
            ServerEvent::TaskUpdated(_) => "task:updated",
            ServerEvent::TaskDeleted { .. } => "task:deleted",
            ServerEvent::RoomJoined { .. } => "room:joined",
            ServerEvent::RoomLeft { .. } => "room:left",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Scoped error reply for a failed client event.
    pub fn error(event: &str, err: &ApiError) -> Self {
        ServerEvent::Error {
            event: event.to_string(),
            message: err.to_string(),
            code: err.code(),
        }
    }
}
