//! REST API under `/api/v1`.
//!
//! Every resource lives in its own submodule that contributes a
//! `routes()` router; [`api_router`] stitches them together. Handlers share
//! the membership checks and side-effect helpers defined here.

mod auth;
mod calendar;
mod chat;
mod content;
mod meetings;
mod notifications;
mod projects;
mod tasks;
mod users;

use std::sync::Arc;

use anyhow::Result;
use axum::{Router, routing::get};

use crate::app::db::DbHandle;
use crate::app::models::{MemberRole, NewNotification, Project, Task};
use crate::app::realtime::{Room, RoomRegistry, ServerEvent};
use crate::auth::TokenService;
use crate::config::TaskifyConfig;
use crate::errors::{ApiError, ApiResult};
use crate::integrations::{self, CalendarClient, Email, Mailer};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub rooms: Arc<RoomRegistry>,
    pub tokens: TokenService,
    pub mailer: Arc<dyn Mailer>,
    pub calendar: Option<Arc<dyn CalendarClient>>,
    pub config: TaskifyConfig,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        db: DbHandle,
        config: TaskifyConfig,
        mailer: Arc<dyn Mailer>,
        calendar: Option<Arc<dyn CalendarClient>>,
    ) -> Result<Self> {
        Ok(Self {
            db,
            rooms: Arc::new(RoomRegistry::new()),
            tokens: TokenService::from_config(&config)?,
            mailer,
            calendar,
            config,
        })
    }

    /// Absolute front-end URL for a path such as `/projects/3`.
    pub fn link(&self, path: &str) -> String {
        format!("{}{}", self.config.server.frontend_url.trim_end_matches('/'), path)
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    let v1 = Router::new()
        .merge(auth::routes())
        .merge(users::routes())
        .merge(projects::routes())
        .merge(tasks::routes())
        .merge(content::routes())
        .merge(chat::routes())
        .merge(meetings::routes())
        .merge(notifications::routes())
        .merge(calendar::routes());

    Router::new()
        .nest("/api/v1", v1)
        .route("/health", get(health_check))
}

async fn health_check() -> &'static str {
    "ok"
}

// ── Access checks ─────────────────────────────────────────────────────

/// Load a project and the caller's role in it. 404 when the project is
/// missing, 403 when the caller is neither owner nor member.
pub(crate) async fn require_project_member(
    state: &SharedState,
    project_id: i64,
    user_id: i64,
) -> ApiResult<(Project, MemberRole)> {
    let (project, role) = state
        .db
        .call(move |db| Ok((db.get_project(project_id)?, db.project_role(project_id, user_id)?)))
        .await?;
    let project = project.ok_or_else(|| ApiError::not_found("Project", project_id))?;
    let role = role
        .ok_or_else(|| ApiError::Forbidden("Not a member of this project".to_string()))?;
    Ok((project, role))
}

pub(crate) async fn require_project_owner(
    state: &SharedState,
    project_id: i64,
    user_id: i64,
) -> ApiResult<Project> {
    let (project, role) = require_project_member(state, project_id, user_id).await?;
    if role != MemberRole::Owner {
        return Err(ApiError::Forbidden(
            "Only the project owner can do this".to_string(),
        ));
    }
    Ok(project)
}

/// Load a task and check the caller can see its project.
pub(crate) async fn require_task_access(
    state: &SharedState,
    task_id: i64,
    user_id: i64,
) -> ApiResult<(Task, Project, MemberRole)> {
    let task = state
        .db
        .call(move |db| db.get_task(task_id))
        .await?
        .ok_or_else(|| ApiError::not_found("Task", task_id))?;
    let (project, role) = require_project_member(state, task.project_id, user_id).await?;
    Ok((task, project, role))
}

pub(crate) fn require_non_empty(value: &str, field: &str) -> ApiResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

// ── Side effects ──────────────────────────────────────────────────────

/// Persist a notification and push it to the recipient's personal room.
pub(crate) async fn notify(state: &SharedState, new: NewNotification) -> ApiResult<()> {
    let notification = state
        .db
        .call(move |db| db.create_notification(&new))
        .await?;
    state
        .rooms
        .emit_to_user(notification.user_id, &ServerEvent::NotificationNew(notification))
        .await;
    Ok(())
}

pub(crate) fn send_email(state: &SharedState, email: Email) {
    let mailer = state.mailer.clone();
    integrations::spawn_best_effort("email", async move { mailer.send(email).await });
}

/// Mirror the task onto its owner's Google Calendar when configured.
pub(crate) fn sync_calendar(state: &SharedState, task: &Task) {
    if let Some(client) = state.calendar.clone() {
        let db = state.db.clone();
        let task = task.clone();
        integrations::spawn_best_effort("calendar", integrations::calendar::sync_task(db, client, task));
    }
}

pub(crate) fn unsync_calendar(state: &SharedState, task: &Task) {
    if let Some(client) = state.calendar.clone() {
        let db = state.db.clone();
        let task = task.clone();
        integrations::spawn_best_effort(
            "calendar",
            integrations::calendar::remove_task(db, client, task),
        );
    }
}

pub(crate) async fn emit_to_project(state: &SharedState, project_id: i64, event: &ServerEvent) {
    state.rooms.emit(Room::Project(project_id), event, None).await;
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_check() {
        let state = test_state();
        let response = app(&state)
            .oneshot(request(&state, "GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_route_requires_token() {
        let state = test_state();
        let response = app(&state)
            .oneshot(request(&state, "GET", "/api/v1/projects", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["error"], "Authentication required");
    }

    #[tokio::test]
    async fn test_link_joins_frontend_url() {
        let state = test_state();
        assert_eq!(state.link("/projects/3"), "http://localhost:5173/projects/3");
    }
}
