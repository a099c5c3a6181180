use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
};
use serde::Deserialize;

use super::{SharedState, require_non_empty, require_project_member};
use crate::app::models::{Document, MemberRole, Note};
use crate::auth::AuthUser;
use crate::errors::{ApiError, ApiResult};

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/projects/{id}/notes", get(list_notes).post(create_note))
        .route(
            "/notes/{id}",
            get(get_note).patch(update_note).delete(delete_note),
        )
        .route(
            "/projects/{id}/documents",
            get(list_documents).post(create_document),
        )
        .route("/documents/{id}", delete(delete_document))
}

#[derive(Deserialize)]
pub struct CreateNoteRequest {
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Deserialize)]
pub struct UpdateNoteRequest {
    pub title: Option<String>,
    pub content: Option<String>,
}

/// Document metadata; the file itself is stored wherever `url` points.
#[derive(Deserialize)]
pub struct CreateDocumentRequest {
    pub name: String,
    pub url: String,
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
}

fn require_author_or_owner(author_id: i64, user_id: i64, role: MemberRole, what: &str) -> ApiResult<()> {
    if author_id != user_id && role != MemberRole::Owner {
        return Err(ApiError::Forbidden(format!(
            "Only the {} or project owner can do this",
            what
        )));
    }
    Ok(())
}

// ── Notes ─────────────────────────────────────────────────────────────

async fn load_note(state: &SharedState, id: i64, user_id: i64) -> ApiResult<(Note, MemberRole)> {
    let note = state
        .db
        .call(move |db| db.get_note(id))
        .await?
        .ok_or_else(|| ApiError::not_found("Note", id))?;
    let (_, role) = require_project_member(state, note.project_id, user_id).await?;
    Ok((note, role))
}

async fn list_notes(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Note>>> {
    require_project_member(&state, id, auth.id).await?;
    let notes = state.db.call(move |db| db.list_notes(id)).await?;
    Ok(Json(notes))
}

async fn create_note(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<CreateNoteRequest>,
) -> ApiResult<(StatusCode, Json<Note>)> {
    require_project_member(&state, id, auth.id).await?;
    let title = require_non_empty(&req.title, "Title")?;
    let note = state
        .db
        .call(move |db| db.create_note(id, auth.id, &title, &req.content))
        .await?;
    Ok((StatusCode::CREATED, Json(note)))
}

async fn get_note(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Note>> {
    let (note, _) = load_note(&state, id, auth.id).await?;
    Ok(Json(note))
}

async fn update_note(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateNoteRequest>,
) -> ApiResult<Json<Note>> {
    let (note, role) = load_note(&state, id, auth.id).await?;
    require_author_or_owner(note.author_id, auth.id, role, "author")?;
    let title = req
        .title
        .as_deref()
        .map(|t| require_non_empty(t, "Title"))
        .transpose()?;
    let note = state
        .db
        .call(move |db| db.update_note(id, title.as_deref(), req.content.as_deref()))
        .await?;
    Ok(Json(note))
}

async fn delete_note(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let (note, role) = load_note(&state, id, auth.id).await?;
    require_author_or_owner(note.author_id, auth.id, role, "author")?;
    state.db.call(move |db| db.delete_note(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Documents ─────────────────────────────────────────────────────────

async fn list_documents(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Document>>> {
    require_project_member(&state, id, auth.id).await?;
    let documents = state.db.call(move |db| db.list_documents(id)).await?;
    Ok(Json(documents))
}

async fn create_document(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<CreateDocumentRequest>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    require_project_member(&state, id, auth.id).await?;
    let name = require_non_empty(&req.name, "Name")?;
    let url = require_non_empty(&req.url, "URL")?;
    if req.size_bytes.is_some_and(|s| s < 0) {
        return Err(ApiError::BadRequest("size_bytes must not be negative".to_string()));
    }
    let document = state
        .db
        .call(move |db| {
            db.create_document(id, auth.id, &name, &url, req.mime_type.as_deref(), req.size_bytes)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn delete_document(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let document = state
        .db
        .call(move |db| db.get_document(id))
        .await?
        .ok_or_else(|| ApiError::not_found("Document", id))?;
    let (_, role) = require_project_member(&state, document.project_id, auth.id).await?;
    require_author_or_owner(document.uploaded_by, auth.id, role, "uploader")?;
    state.db.call(move |db| db.delete_document(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::app::api::testing::*;
    use crate::app::models::WorkflowType;

    async fn setup(state: &SharedState) -> (i64, i64, i64, i64) {
        let ada = seed_user(state, "Ada").await;
        let bob = seed_user(state, "Bob").await;
        let carol = seed_user(state, "Carol").await;
        let p = state
            .db
            .call(move |db| {
                let p = db.create_project(ada, "Apollo", "", WorkflowType::Automated)?;
                db.add_member(p.id, bob)?;
                db.add_member(p.id, carol)?;
                Ok(p.id)
            })
            .await
            .unwrap();
        (ada, bob, carol, p)
    }

    #[tokio::test]
    async fn test_note_mutations_are_author_or_owner() {
        let state = test_state();
        let (ada, bob, carol, p) = setup(&state).await;

        let uri = format!("/api/v1/projects/{}/notes", p);
        let response = app(&state)
            .oneshot(request(&state, "POST", &uri, Some(bob), Some(json!({"title": "Plan", "content": "v1"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let note: serde_json::Value = body_json(response.into_body()).await;
        let uri = format!("/api/v1/notes/{}", note["id"]);

        let response = app(&state)
            .oneshot(request(&state, "PATCH", &uri, Some(carol), Some(json!({"content": "v2"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app(&state)
            .oneshot(request(&state, "PATCH", &uri, Some(bob), Some(json!({"content": "v2"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let updated: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(updated["title"], "Plan");
        assert_eq!(updated["content"], "v2");

        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(ada), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_documents_store_metadata() {
        let state = test_state();
        let (ada, bob, carol, p) = setup(&state).await;

        let uri = format!("/api/v1/projects/{}/documents", p);
        let response = app(&state)
            .oneshot(request(
                &state,
                "POST",
                &uri,
                Some(bob),
                Some(json!({"name": "spec.pdf", "url": "https://files.example.com/spec.pdf", "mime_type": "application/pdf", "size_bytes": 2048})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let document: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(document["size_bytes"], 2048);

        let response = app(&state)
            .oneshot(request(&state, "GET", &uri, Some(ada), None))
            .await
            .unwrap();
        let documents: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(documents.len(), 1);

        let uri = format!("/api/v1/documents/{}", document["id"]);
        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(carol), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(bob), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
