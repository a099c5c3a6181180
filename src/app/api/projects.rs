use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, patch},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{SharedState, notify, require_non_empty, require_project_member, require_project_owner, send_email};
use crate::app::models::{
    Activity, CustomColumn, MemberRole, NewActivity, NewNotification, NotificationKind, Project,
    ProjectMember, WorkflowType,
};
use crate::app::realtime::Room;
use crate::auth::AuthUser;
use crate::errors::{ApiError, ApiResult};
use crate::integrations::email;

const DEFAULT_ACTIVITY_LIMIT: u32 = 50;
const MAX_ACTIVITY_LIMIT: u32 = 200;

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/projects/{id}/members", get(list_members).post(add_member))
        .route("/projects/{id}/members/{user_id}", delete(remove_member))
        .route("/projects/{id}/activity", get(list_activity))
        .route("/projects/{id}/columns", get(list_columns).post(create_column))
        .route("/columns/{id}", patch(update_column).delete(delete_column))
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
    pub workflow: Option<WorkflowType>,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub workflow: Option<WorkflowType>,
}

/// Identify the new member by id or by email.
#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Option<i64>,
    pub email: Option<String>,
}

#[derive(Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct CreateColumnRequest {
    pub name: String,
    pub color: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateColumnRequest {
    pub name: Option<String>,
    pub position: Option<i32>,
    pub color: Option<String>,
}

#[derive(Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub role: MemberRole,
    pub members: Vec<ProjectMember>,
}

// ── Projects ──────────────────────────────────────────────────────────

async fn list_projects(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> ApiResult<Json<Vec<Project>>> {
    let projects = state
        .db
        .call(move |db| db.list_projects_for_user(auth.id))
        .await?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    auth: AuthUser,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let name = require_non_empty(&req.name, "Project name")?;
    let description = req.description.unwrap_or_default();
    let workflow = req.workflow.unwrap_or(WorkflowType::Automated);
    let project = state
        .db
        .call(move |db| {
            let project = db.create_project(auth.id, &name, &description, workflow)?;
            db.record_activity(&NewActivity {
                project_id: project.id,
                task_id: None,
                user_id: Some(auth.id),
                action: "PROJECT_CREATED",
                from_value: None,
                to_value: Some(project.name.clone()),
            })?;
            Ok(project)
        })
        .await?;
    info!(project_id = project.id, owner_id = auth.id, "project created");
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProjectDetail>> {
    let (project, role) = require_project_member(&state, id, auth.id).await?;
    let members = state.db.call(move |db| db.list_members(id)).await?;
    Ok(Json(ProjectDetail {
        project,
        role,
        members,
    }))
}

async fn update_project(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateProjectRequest>,
) -> ApiResult<Json<Project>> {
    require_project_owner(&state, id, auth.id).await?;
    let name = req
        .name
        .as_deref()
        .map(|n| require_non_empty(n, "Project name"))
        .transpose()?;
    let project = state
        .db
        .call(move |db| {
            db.update_project(id, name.as_deref(), req.description.as_deref(), req.workflow)
        })
        .await?;
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    require_project_owner(&state, id, auth.id).await?;
    state.db.call(move |db| db.delete_project(id)).await?;
    info!(project_id = id, "project deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ── Members ───────────────────────────────────────────────────────────

async fn list_members(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<ProjectMember>>> {
    require_project_member(&state, id, auth.id).await?;
    let members = state.db.call(move |db| db.list_members(id)).await?;
    Ok(Json(members))
}

/// Owner adds a user. The new member joins the project conversation and is
/// notified in-app and by email.
async fn add_member(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<AddMemberRequest>,
) -> ApiResult<(StatusCode, Json<Vec<ProjectMember>>)> {
    let project = require_project_owner(&state, id, auth.id).await?;

    let (user, inviter) = state
        .db
        .call(move |db| {
            let user = match (req.user_id, req.email.as_deref()) {
                (Some(user_id), _) => db.get_user(user_id)?,
                (None, Some(email)) => db.find_user_by_email(&email.trim().to_lowercase())?,
                (None, None) => None,
            };
            Ok((user, db.get_user(auth.id)?))
        })
        .await?;
    let user = user.ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let user_id = user.id;
    let added = state.db.call(move |db| db.add_member(id, user_id)).await?;
    if !added {
        return Err(ApiError::Conflict(
            "User is already a member of this project".to_string(),
        ));
    }
    state
        .db
        .call(move |db| {
            db.record_activity(&NewActivity {
                project_id: id,
                task_id: None,
                user_id: Some(auth.id),
                action: "MEMBER_ADDED",
                from_value: None,
                to_value: Some(user_id.to_string()),
            })
        })
        .await?;
    info!(project_id = id, user_id, "member added");

    let link = state.link(&format!("/projects/{}", id));
    let inviter_name = inviter.map(|u| u.name).unwrap_or_default();
    notify(
        &state,
        NewNotification {
            user_id,
            kind: NotificationKind::MemberAdded,
            title: format!("Added to {}", project.name),
            body: format!("{} added you to {}", inviter_name, project.name),
            link: Some(link.clone()),
        },
    )
    .await?;
    send_email(
        &state,
        email::member_added(&user.email, &project.name, &inviter_name, &link),
    );

    let members = state.db.call(move |db| db.list_members(id)).await?;
    Ok((StatusCode::CREATED, Json(members)))
}

/// The owner removes a member, or a member leaves. The owner can't be
/// removed. Live sockets are evicted from the project's rooms.
async fn remove_member(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path((id, user_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    let (project, role) = require_project_member(&state, id, auth.id).await?;
    if user_id != auth.id && role != MemberRole::Owner {
        return Err(ApiError::Forbidden(
            "Only the project owner can remove members".to_string(),
        ));
    }
    if user_id == project.owner_id {
        return Err(ApiError::BadRequest(
            "The project owner cannot be removed".to_string(),
        ));
    }

    let (removed, conversation_ids) = state
        .db
        .call(move |db| {
            let conversations: Vec<i64> = db
                .list_conversations_for_user(id, user_id)?
                .into_iter()
                .map(|s| s.conversation.id)
                .collect();
            let removed = db.remove_member(id, user_id)?;
            Ok((removed, conversations))
        })
        .await?;
    if !removed {
        return Err(ApiError::NotFound(
            "User is not a member of this project".to_string(),
        ));
    }

    state.rooms.evict_user(user_id, Room::Project(id)).await;
    for conversation_id in conversation_ids {
        state
            .rooms
            .evict_user(user_id, Room::Conversation(conversation_id))
            .await;
    }
    state
        .db
        .call(move |db| {
            db.record_activity(&NewActivity {
                project_id: id,
                task_id: None,
                user_id: Some(auth.id),
                action: "MEMBER_REMOVED",
                from_value: Some(user_id.to_string()),
                to_value: None,
            })
        })
        .await?;
    info!(project_id = id, user_id, "member removed");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_activity(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<Vec<Activity>>> {
    require_project_member(&state, id, auth.id).await?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, MAX_ACTIVITY_LIMIT);
    let activities = state
        .db
        .call(move |db| db.list_activities(id, limit))
        .await?;
    Ok(Json(activities))
}

// ── Custom columns ────────────────────────────────────────────────────

async fn list_columns(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<CustomColumn>>> {
    require_project_member(&state, id, auth.id).await?;
    let columns = state.db.call(move |db| db.list_columns(id)).await?;
    Ok(Json(columns))
}

async fn create_column(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<CreateColumnRequest>,
) -> ApiResult<(StatusCode, Json<CustomColumn>)> {
    let project = require_project_owner(&state, id, auth.id).await?;
    if project.workflow != WorkflowType::Custom {
        return Err(ApiError::BadRequest(
            "Columns are only available on custom workflow projects".to_string(),
        ));
    }
    let name = require_non_empty(&req.name, "Column name")?;
    let column = state
        .db
        .call(move |db| db.create_column(id, &name, req.color.as_deref()))
        .await?;
    Ok((StatusCode::CREATED, Json(column)))
}

async fn load_column_as_owner(
    state: &SharedState,
    column_id: i64,
    user_id: i64,
) -> ApiResult<CustomColumn> {
    let column = state
        .db
        .call(move |db| db.get_column(column_id))
        .await?
        .ok_or_else(|| ApiError::not_found("Column", column_id))?;
    require_project_owner(state, column.project_id, user_id).await?;
    Ok(column)
}

async fn update_column(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateColumnRequest>,
) -> ApiResult<Json<CustomColumn>> {
    load_column_as_owner(&state, id, auth.id).await?;
    let name = req
        .name
        .as_deref()
        .map(|n| require_non_empty(n, "Column name"))
        .transpose()?;
    let column = state
        .db
        .call(move |db| db.update_column(id, name.as_deref(), req.position, req.color.as_deref()))
        .await?;
    Ok(Json(column))
}

async fn delete_column(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    load_column_as_owner(&state, id, auth.id).await?;
    state.db.call(move |db| db.delete_column(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::app::api::testing::*;
    use crate::integrations::email::testing::RecordingMailer;

    async fn create(state: &SharedState, owner: i64, workflow: &str) -> i64 {
        let response = app(state)
            .oneshot(request(
                state,
                "POST",
                "/api/v1/projects",
                Some(owner),
                Some(json!({"name": "Apollo", "workflow": workflow})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let project: serde_json::Value = body_json(response.into_body()).await;
        project["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_create_and_list_projects() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let bob = seed_user(&state, "Bob").await;
        create(&state, ada, "AUTOMATED").await;

        let response = app(&state)
            .oneshot(request(&state, "GET", "/api/v1/projects", Some(ada), None))
            .await
            .unwrap();
        let projects: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0]["workflow"], "AUTOMATED");

        let response = app(&state)
            .oneshot(request(&state, "GET", "/api/v1/projects", Some(bob), None))
            .await
            .unwrap();
        let projects: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(projects.is_empty());
    }

    #[tokio::test]
    async fn test_non_member_gets_403_and_missing_gets_404() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let eve = seed_user(&state, "Eve").await;
        let id = create(&state, ada, "AUTOMATED").await;

        let uri = format!("/api/v1/projects/{}", id);
        let response = app(&state)
            .oneshot(request(&state, "GET", &uri, Some(eve), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app(&state)
            .oneshot(request(&state, "GET", "/api/v1/projects/999", Some(ada), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_add_member_notifies_and_emails() {
        let mailer = Arc::new(RecordingMailer::default());
        let state = test_state_with(mailer.clone());
        let ada = seed_user(&state, "Ada").await;
        let bob = seed_user(&state, "Bob").await;
        let id = create(&state, ada, "AUTOMATED").await;
        let (_conn, mut bob_rx) = state.rooms.register(bob).await;

        let uri = format!("/api/v1/projects/{}/members", id);
        let response = app(&state)
            .oneshot(request(&state, "POST", &uri, Some(ada), Some(json!({"email": "BOB@example.com"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let members: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(members.len(), 2);

        let frame: serde_json::Value = serde_json::from_str(&bob_rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["event"], "notification:new");
        assert_eq!(frame["data"]["kind"], "MEMBER_ADDED");

        let in_chat = state
            .db
            .call(move |db| {
                let conv = db.get_project_conversation(id)?.unwrap();
                db.is_conversation_member(conv.id, bob)
            })
            .await
            .unwrap();
        assert!(in_chat);

        for _ in 0..50 {
            if !mailer.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(mailer.sent.lock().unwrap()[0].to, "bob@example.com");

        let response = app(&state)
            .oneshot(request(&state, "POST", &uri, Some(ada), Some(json!({"user_id": bob}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_only_owner_mutates_project() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let bob = seed_user(&state, "Bob").await;
        let id = create(&state, ada, "AUTOMATED").await;
        state.db.call(move |db| db.add_member(id, bob)).await.unwrap();

        let uri = format!("/api/v1/projects/{}", id);
        let response = app(&state)
            .oneshot(request(&state, "PATCH", &uri, Some(bob), Some(json!({"name": "Hijacked"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(bob), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app(&state)
            .oneshot(request(&state, "PATCH", &uri, Some(ada), Some(json!({"name": "Artemis"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let project: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(project["name"], "Artemis");
    }

    #[tokio::test]
    async fn test_remove_member_rules() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let bob = seed_user(&state, "Bob").await;
        let carol = seed_user(&state, "Carol").await;
        let id = create(&state, ada, "AUTOMATED").await;
        state
            .db
            .call(move |db| {
                db.add_member(id, bob)?;
                db.add_member(id, carol)
            })
            .await
            .unwrap();
        let (bob_conn, _bob_rx) = state.rooms.register(bob).await;
        state.rooms.join(bob_conn, Room::Project(id)).await;

        // Members cannot remove each other, and nobody removes the owner.
        let uri = format!("/api/v1/projects/{}/members/{}", id, carol);
        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(bob), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let uri = format!("/api/v1/projects/{}/members/{}", id, ada);
        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(ada), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Self-leave evicts live sockets.
        let uri = format!("/api/v1/projects/{}/members/{}", id, bob);
        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(bob), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!state.rooms.is_in_room(bob_conn, Room::Project(id)).await);
        let role = state.db.call(move |db| db.project_role(id, bob)).await.unwrap();
        assert!(role.is_none());
    }

    #[tokio::test]
    async fn test_columns_require_custom_workflow() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let automated = create(&state, ada, "AUTOMATED").await;
        let custom = create(&state, ada, "CUSTOM").await;

        let uri = format!("/api/v1/projects/{}/columns", automated);
        let response = app(&state)
            .oneshot(request(&state, "POST", &uri, Some(ada), Some(json!({"name": "Ideas"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let uri = format!("/api/v1/projects/{}/columns", custom);
        for name in ["Ideas", "Doing"] {
            let response = app(&state)
                .oneshot(request(&state, "POST", &uri, Some(ada), Some(json!({"name": name}))))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }
        let response = app(&state)
            .oneshot(request(&state, "GET", &uri, Some(ada), None))
            .await
            .unwrap();
        let columns: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[1]["position"], 1);
    }

    #[tokio::test]
    async fn test_activity_lists_project_events() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let id = create(&state, ada, "AUTOMATED").await;
        let uri = format!("/api/v1/projects/{}/activity", id);
        let response = app(&state)
            .oneshot(request(&state, "GET", &uri, Some(ada), None))
            .await
            .unwrap();
        let activity: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(activity[0]["action"], "PROJECT_CREATED");
    }
}
