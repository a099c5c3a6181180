use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use tracing::info;

use super::{
    SharedState, emit_to_project, notify, require_non_empty, require_project_member,
    require_task_access, send_email, sync_calendar, unsync_calendar,
};
use crate::app::db::TaskifyDb;
use crate::app::models::{
    Comment, MemberRole, NewActivity, NewNotification, NewTask, NotificationKind, Project,
    Subtask, Task, TaskChanges, TaskPriority, TaskStatus, WorkflowType,
};
use crate::app::realtime::ServerEvent;
use crate::auth::AuthUser;
use crate::errors::{ApiError, ApiResult};
use crate::integrations::email;
use crate::workflow;

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/projects/{id}/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/tasks/{id}/subtasks", post(add_subtask))
        .route("/subtasks/{id}", patch(update_subtask).delete(delete_subtask))
        .route("/tasks/{id}/comments", get(list_comments).post(add_comment))
        .route("/comments/{id}", patch(update_comment).delete(delete_comment))
}

/// Distinguish an absent field (`None`) from an explicit `null` (`Some(None)`).
fn nullable<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub assignee_id: Option<i64>,
    pub custom_column_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    #[serde(default, deserialize_with = "nullable")]
    pub start_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "nullable")]
    pub end_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "nullable")]
    pub assignee_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "nullable")]
    pub custom_column_id: Option<Option<i64>>,
}

#[derive(Deserialize)]
pub struct CreateSubtaskRequest {
    pub title: String,
}

#[derive(Deserialize)]
pub struct UpdateSubtaskRequest {
    pub title: Option<String>,
    pub completed: Option<bool>,
    pub position: Option<i32>,
}

#[derive(Deserialize)]
pub struct CommentRequest {
    pub content: String,
}

// ── Validation ────────────────────────────────────────────────────────

/// Check the assignee, column and date range make sense for the project.
async fn validate_task_fields(
    state: &SharedState,
    project: &Project,
    assignee_id: Option<i64>,
    custom_column_id: Option<i64>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
) -> ApiResult<()> {
    if let (Some(start), Some(end)) = (start_date, end_date) {
        if start.date_naive() > end.date_naive() {
            return Err(ApiError::BadRequest(
                "Start date must not be after end date".to_string(),
            ));
        }
    }
    let project_id = project.id;
    let (assignee_role, column) = state
        .db
        .call(move |db| {
            let role = match assignee_id {
                Some(user_id) => db.project_role(project_id, user_id)?,
                None => None,
            };
            let column = match custom_column_id {
                Some(column_id) => db.get_column(column_id)?,
                None => None,
            };
            Ok((role, column))
        })
        .await?;
    if assignee_id.is_some() && assignee_role.is_none() {
        return Err(ApiError::BadRequest(
            "Assignee must be a member of the project".to_string(),
        ));
    }
    if custom_column_id.is_some() && column.map(|c| c.project_id) != Some(project_id) {
        return Err(ApiError::BadRequest(
            "Column does not belong to this project".to_string(),
        ));
    }
    Ok(())
}

// ── Side effects ──────────────────────────────────────────────────────

/// Notify and email a newly assigned user, unless they assigned themselves.
async fn notify_assignment(
    state: &SharedState,
    task: &Task,
    project: &Project,
    actor_id: i64,
) -> ApiResult<()> {
    let Some(assignee_id) = task.assignee_id else {
        return Ok(());
    };
    if assignee_id == actor_id {
        return Ok(());
    }
    let link = state.link(&format!("/projects/{}/tasks/{}", project.id, task.id));
    notify(
        state,
        NewNotification {
            user_id: assignee_id,
            kind: NotificationKind::TaskAssigned,
            title: format!("Assigned: {}", task.title),
            body: format!("You were assigned \"{}\" in {}", task.title, project.name),
            link: Some(link.clone()),
        },
    )
    .await?;
    if let Some(assignee) = state.db.call(move |db| db.get_user(assignee_id)).await? {
        send_email(
            state,
            email::task_assigned(&assignee.email, &task.title, &project.name, &link),
        );
    }
    Ok(())
}

/// Load tasks and bring automated-workflow statuses up to date. The read,
/// the derivation and the write share one database call.
async fn load_reconciled<F>(state: &SharedState, project: &Project, load: F) -> ApiResult<Vec<Task>>
where
    F: FnOnce(&TaskifyDb) -> anyhow::Result<Vec<Task>> + Send + 'static,
{
    let automated = project.workflow == WorkflowType::Automated;
    let (tasks, applied) = state
        .db
        .call(move |db| {
            let mut tasks = load(db)?;
            if !automated {
                return Ok((tasks, Vec::new()));
            }
            let changes = workflow::reconcile(&tasks, workflow::today());
            let applied = db.apply_status_changes(&changes)?;
            for change in &applied {
                if let Some(task) = tasks.iter_mut().find(|t| t.id == change.task_id) {
                    task.status = change.to;
                }
            }
            Ok((tasks, applied))
        })
        .await?;

    if !applied.is_empty() {
        info!(project_id = project.id, changed = applied.len(), "task statuses reconciled");
    }
    for change in &applied {
        if let Some(task) = tasks.iter().find(|t| t.id == change.task_id) {
            emit_to_project(state, project.id, &ServerEvent::TaskUpdated(task.clone())).await;
        }
    }
    Ok(tasks)
}

// ── Tasks ─────────────────────────────────────────────────────────────

/// List a project's tasks. Automated projects have their statuses
/// reconciled against today's date first.
async fn list_tasks(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Task>>> {
    let (project, _) = require_project_member(&state, id, auth.id).await?;
    let tasks = load_reconciled(&state, &project, move |db| db.list_tasks(id)).await?;
    Ok(Json(tasks))
}

async fn create_task(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let (project, _) = require_project_member(&state, id, auth.id).await?;
    let title = require_non_empty(&req.title, "Title")?;
    validate_task_fields(
        &state,
        &project,
        req.assignee_id,
        req.custom_column_id,
        req.start_date,
        req.end_date,
    )
    .await?;

    let new = NewTask {
        title,
        description: req.description.unwrap_or_default(),
        status: req.status.unwrap_or(TaskStatus::Todo),
        priority: req.priority.unwrap_or(TaskPriority::Medium),
        start_date: req.start_date,
        end_date: req.end_date,
        assignee_id: req.assignee_id,
        custom_column_id: req.custom_column_id,
    };
    let task = state
        .db
        .call(move |db| {
            let task = db.create_task(id, auth.id, &new)?;
            db.record_activity(&NewActivity {
                project_id: id,
                task_id: Some(task.id),
                user_id: Some(auth.id),
                action: "TASK_CREATED",
                from_value: None,
                to_value: Some(task.title.clone()),
            })?;
            Ok(task)
        })
        .await?;

    emit_to_project(&state, id, &ServerEvent::TaskCreated(task.clone())).await;
    notify_assignment(&state, &task, &project, auth.id).await?;
    sync_calendar(&state, &task);
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Task>> {
    let (_, project, _) = require_task_access(&state, id, auth.id).await?;
    let task = load_reconciled(&state, &project, move |db| {
        Ok(db.get_task(id)?.into_iter().collect())
    })
    .await?
    .pop()
    .ok_or_else(|| ApiError::not_found("Task", id))?;
    Ok(Json(task))
}

async fn update_task(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTaskRequest>,
) -> ApiResult<Json<Task>> {
    let (before, project, _) = require_task_access(&state, id, auth.id).await?;
    let title = req
        .title
        .as_deref()
        .map(|t| require_non_empty(t, "Title"))
        .transpose()?;

    let assignee_id = req.assignee_id.unwrap_or(before.assignee_id);
    let custom_column_id = req.custom_column_id.unwrap_or(before.custom_column_id);
    let start_date = req.start_date.unwrap_or(before.start_date);
    let end_date = req.end_date.unwrap_or(before.end_date);
    validate_task_fields(
        &state,
        &project,
        assignee_id,
        custom_column_id,
        start_date,
        end_date,
    )
    .await?;

    let changes = TaskChanges {
        title,
        description: req.description,
        status: req.status,
        priority: req.priority,
        start_date: req.start_date,
        end_date: req.end_date,
        assignee_id: req.assignee_id,
        custom_column_id: req.custom_column_id,
    };
    let (from_status, project_id) = (before.status, before.project_id);
    let task = state
        .db
        .call(move |db| {
            let task = db.update_task(id, &changes)?;
            let activity = if task.status != from_status {
                NewActivity {
                    project_id,
                    task_id: Some(id),
                    user_id: Some(auth.id),
                    action: "STATUS_CHANGED",
                    from_value: Some(from_status.as_str().to_string()),
                    to_value: Some(task.status.as_str().to_string()),
                }
            } else {
                NewActivity {
                    project_id,
                    task_id: Some(id),
                    user_id: Some(auth.id),
                    action: "TASK_UPDATED",
                    from_value: None,
                    to_value: None,
                }
            };
            db.record_activity(&activity)?;
            Ok(task)
        })
        .await?;

    emit_to_project(&state, project_id, &ServerEvent::TaskUpdated(task.clone())).await;
    if task.assignee_id != before.assignee_id {
        notify_assignment(&state, &task, &project, auth.id).await?;
    }
    sync_calendar(&state, &task);
    Ok(Json(task))
}

/// Only the task's creator or the project owner may delete it.
async fn delete_task(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let (task, _, role) = require_task_access(&state, id, auth.id).await?;
    if task.created_by != auth.id && role != MemberRole::Owner {
        return Err(ApiError::Forbidden(
            "Only the creator or project owner can delete this task".to_string(),
        ));
    }
    let (project_id, title) = (task.project_id, task.title.clone());
    state
        .db
        .call(move |db| {
            db.delete_task(id)?;
            db.record_activity(&NewActivity {
                project_id,
                task_id: Some(id),
                user_id: Some(auth.id),
                action: "TASK_DELETED",
                from_value: Some(title),
                to_value: None,
            })
        })
        .await?;

    emit_to_project(
        &state,
        project_id,
        &ServerEvent::TaskDeleted {
            task_id: id,
            project_id,
        },
    )
    .await;
    unsync_calendar(&state, &task);
    Ok(StatusCode::NO_CONTENT)
}

// ── Subtasks ──────────────────────────────────────────────────────────

/// Reload a task and broadcast it after a subtask change.
async fn broadcast_task(state: &SharedState, task_id: i64) -> ApiResult<()> {
    if let Some(task) = state.db.call(move |db| db.get_task(task_id)).await? {
        emit_to_project(state, task.project_id, &ServerEvent::TaskUpdated(task)).await;
    }
    Ok(())
}

async fn require_subtask_access(
    state: &SharedState,
    subtask_id: i64,
    user_id: i64,
) -> ApiResult<Subtask> {
    let subtask = state
        .db
        .call(move |db| db.get_subtask(subtask_id))
        .await?
        .ok_or_else(|| ApiError::not_found("Subtask", subtask_id))?;
    require_task_access(state, subtask.task_id, user_id).await?;
    Ok(subtask)
}

async fn add_subtask(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<CreateSubtaskRequest>,
) -> ApiResult<(StatusCode, Json<Subtask>)> {
    require_task_access(&state, id, auth.id).await?;
    let title = require_non_empty(&req.title, "Title")?;
    let subtask = state
        .db
        .call(move |db| db.add_subtask(id, &title))
        .await?;
    broadcast_task(&state, id).await?;
    Ok((StatusCode::CREATED, Json(subtask)))
}

async fn update_subtask(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateSubtaskRequest>,
) -> ApiResult<Json<Subtask>> {
    let existing = require_subtask_access(&state, id, auth.id).await?;
    let title = req
        .title
        .as_deref()
        .map(|t| require_non_empty(t, "Title"))
        .transpose()?;
    let subtask = state
        .db
        .call(move |db| db.update_subtask(id, title.as_deref(), req.completed, req.position))
        .await?;
    broadcast_task(&state, existing.task_id).await?;
    Ok(Json(subtask))
}

async fn delete_subtask(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let existing = require_subtask_access(&state, id, auth.id).await?;
    state.db.call(move |db| db.delete_subtask(id)).await?;
    broadcast_task(&state, existing.task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Comments ──────────────────────────────────────────────────────────

async fn list_comments(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Comment>>> {
    require_task_access(&state, id, auth.id).await?;
    let comments = state.db.call(move |db| db.list_comments(id)).await?;
    Ok(Json(comments))
}

/// Add a comment and notify the task's assignee and creator, excluding the
/// commenter.
async fn add_comment(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<CommentRequest>,
) -> ApiResult<(StatusCode, Json<Comment>)> {
    let (task, project, _) = require_task_access(&state, id, auth.id).await?;
    let content = require_non_empty(&req.content, "Comment")?;
    let comment = state
        .db
        .call(move |db| db.add_comment(id, auth.id, &content))
        .await?;

    let mut recipients: Vec<i64> = task.assignee_id.into_iter().chain([task.created_by]).collect();
    recipients.sort_unstable();
    recipients.dedup();
    let link = state.link(&format!("/projects/{}/tasks/{}", project.id, task.id));
    for user_id in recipients.into_iter().filter(|&u| u != auth.id) {
        notify(
            &state,
            NewNotification {
                user_id,
                kind: NotificationKind::CommentAdded,
                title: format!("New comment on {}", task.title),
                body: format!("{}: {}", comment.author_name, comment.content),
                link: Some(link.clone()),
            },
        )
        .await?;
    }
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn require_comment_author(
    state: &SharedState,
    comment_id: i64,
    user_id: i64,
) -> ApiResult<Comment> {
    let comment = state
        .db
        .call(move |db| db.get_comment(comment_id))
        .await?
        .ok_or_else(|| ApiError::not_found("Comment", comment_id))?;
    if comment.author_id != user_id {
        return Err(ApiError::Forbidden(
            "Only the author can modify this comment".to_string(),
        ));
    }
    Ok(comment)
}

async fn update_comment(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<CommentRequest>,
) -> ApiResult<Json<Comment>> {
    require_comment_author(&state, id, auth.id).await?;
    let content = require_non_empty(&req.content, "Comment")?;
    let comment = state
        .db
        .call(move |db| db.update_comment(id, &content))
        .await?;
    Ok(Json(comment))
}

async fn delete_comment(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    require_comment_author(&state, id, auth.id).await?;
    state.db.call(move |db| db.delete_comment(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
