use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
};
use serde::Deserialize;
use tracing::info;

use super::{SharedState, notify, require_project_member};
use crate::app::messaging::{self, Origin};
use crate::app::models::{
    Conversation, ConversationKind, ConversationSummary, Message, NewNotification,
    NotificationKind,
};
use crate::app::realtime::ServerEvent;
use crate::auth::AuthUser;
use crate::errors::{ApiError, ApiResult};

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 100;

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route(
            "/projects/{id}/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/conversations/{id}", get(get_conversation))
        .route("/conversations/{id}/read", post(mark_read))
        .route(
            "/conversations/{id}/messages",
            get(list_messages).post(send_message),
        )
        .route("/messages/{id}", patch(edit_message).delete(delete_message))
}

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    pub kind: ConversationKind,
    pub name: Option<String>,
    #[serde(default)]
    pub member_ids: Vec<i64>,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<u32>,
    /// Page backwards from this message id.
    pub before: Option<i64>,
}

#[derive(Deserialize)]
pub struct MessageRequest {
    pub content: String,
}

async fn list_conversations(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    require_project_member(&state, id, auth.id).await?;
    let conversations = state
        .db
        .call(move |db| db.list_conversations_for_user(id, auth.id))
        .await?;
    Ok(Json(conversations))
}

/// Start a DIRECT or GROUP conversation. A DIRECT conversation that already
/// exists between the same two users is returned as-is with 200.
async fn create_conversation(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let (project, _) = require_project_member(&state, id, auth.id).await?;

    let mut others: Vec<i64> = req.member_ids.into_iter().filter(|&u| u != auth.id).collect();
    others.sort_unstable();
    others.dedup();

    match req.kind {
        ConversationKind::Project => {
            return Err(ApiError::BadRequest(
                "Each project has exactly one project conversation".to_string(),
            ));
        }
        ConversationKind::Direct if others.len() != 1 => {
            return Err(ApiError::BadRequest(
                "A direct conversation needs exactly one other member".to_string(),
            ));
        }
        ConversationKind::Group if others.is_empty() => {
            return Err(ApiError::BadRequest(
                "A group conversation needs at least one other member".to_string(),
            ));
        }
        _ => {}
    }

    let project_members = state.db.call(move |db| db.member_ids(id)).await?;
    if others.iter().any(|u| !project_members.contains(u)) {
        return Err(ApiError::BadRequest(
            "Every participant must be a member of the project".to_string(),
        ));
    }

    if req.kind == ConversationKind::Direct {
        let other = others[0];
        let existing = state
            .db
            .call(move |db| db.find_direct_conversation(id, auth.id, other))
            .await?;
        if let Some(conversation) = existing {
            return Ok((StatusCode::OK, Json(conversation)));
        }
    }

    let kind = req.kind;
    let name = req
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());
    let members = others.clone();
    let conversation = state
        .db
        .call(move |db| db.create_conversation(id, kind, name.as_deref(), auth.id, &members))
        .await?;
    info!(
        conversation_id = conversation.id,
        project_id = id,
        kind = kind.as_str(),
        "conversation created"
    );

    let creator_name = conversation
        .members
        .iter()
        .find(|m| m.user_id == auth.id)
        .map(|m| m.name.clone())
        .unwrap_or_default();
    let event = ServerEvent::ConversationCreated(conversation.clone());
    let link = state.link(&format!("/projects/{}/chat/{}", id, conversation.id));
    for user_id in others {
        state.rooms.emit_to_user(user_id, &event).await;
        notify(
            &state,
            NewNotification {
                user_id,
                kind: NotificationKind::ConversationCreated,
                title: format!("New conversation in {}", project.name),
                body: format!("{} started a conversation with you", creator_name),
                link: Some(link.clone()),
            },
        )
        .await?;
    }
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_conversation(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Conversation>> {
    let conversation = messaging::require_member(&state, id, auth.id).await?;
    Ok(Json(conversation))
}

async fn mark_read(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    messaging::require_member(&state, id, auth.id).await?;
    state
        .db
        .call(move |db| db.mark_conversation_read(id, auth.id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_messages(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    messaging::require_member(&state, id, auth.id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let messages = state
        .db
        .call(move |db| db.list_messages(id, limit, query.before))
        .await?;
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = messaging::send_message(&state, auth.id, id, &req.content, Origin::Rest).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn edit_message(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<Json<Message>> {
    let message = messaging::edit_message(&state, auth.id, id, &req.content).await?;
    Ok(Json(message))
}

async fn delete_message(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    messaging::delete_message(&state, auth.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
