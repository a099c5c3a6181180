use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::Redirect,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::SharedState;
use crate::auth::AuthUser;
use crate::errors::{ApiError, ApiResult};
use crate::integrations::{CalendarClient, calendar};

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/calendar/status", get(status))
        .route("/calendar/auth-url", get(auth_url))
        .route("/calendar/callback", get(callback))
        .route("/calendar/sync", post(sync_all))
        .route("/calendar/disconnect", delete(disconnect))
}

#[derive(Serialize)]
pub struct CalendarStatus {
    pub configured: bool,
    pub connected: bool,
}

#[derive(Serialize)]
pub struct AuthUrl {
    pub url: String,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct SyncResult {
    pub synced: usize,
    pub failed: usize,
}

fn client(state: &SharedState) -> ApiResult<Arc<dyn CalendarClient>> {
    state
        .calendar
        .clone()
        .ok_or_else(|| ApiError::BadRequest("Google Calendar is not configured".to_string()))
}

async fn status(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> ApiResult<Json<CalendarStatus>> {
    let connected = state
        .db
        .call(move |db| Ok(db.get_google_tokens(auth.id)?.is_some()))
        .await?;
    Ok(Json(CalendarStatus {
        configured: state.calendar.is_some(),
        connected,
    }))
}

async fn auth_url(State(state): State<SharedState>, auth: AuthUser) -> ApiResult<Json<AuthUrl>> {
    let client = client(&state)?;
    let oauth_state = state.tokens.issue_oauth_state(auth.id)?;
    let url = client.auth_url(&oauth_state)?;
    Ok(Json(AuthUrl { url }))
}

/// Google redirects the browser here after consent. The caller is
/// identified by the signed `state`, not by a session, and always lands
/// back on the settings page.
async fn callback(State(state): State<SharedState>, Query(query): Query<CallbackQuery>) -> Redirect {
    let outcome = match complete_oauth(&state, query).await {
        Ok(user_id) => {
            info!(user_id, "google calendar connected");
            "connected"
        }
        Err(e) => {
            warn!(error = %e, "google calendar connection failed");
            "error"
        }
    };
    Redirect::to(&state.link(&format!("/settings?calendar={}", outcome)))
}

async fn complete_oauth(state: &SharedState, query: CallbackQuery) -> ApiResult<i64> {
    if let Some(error) = query.error {
        return Err(ApiError::BadRequest(format!("Consent denied: {}", error)));
    }
    let client = client(state)?;
    let code = query
        .code
        .ok_or_else(|| ApiError::BadRequest("Missing code".to_string()))?;
    let user_id = query
        .state
        .as_deref()
        .and_then(|s| state.tokens.verify_oauth_state(s))
        .ok_or_else(|| ApiError::BadRequest("Invalid or expired state".to_string()))?;
    let tokens = client.exchange_code(&code).await?;
    state
        .db
        .call(move |db| db.set_google_tokens(user_id, &tokens))
        .await?;
    Ok(user_id)
}

/// Push every task assigned to the caller onto their calendar.
async fn sync_all(State(state): State<SharedState>, auth: AuthUser) -> ApiResult<Json<SyncResult>> {
    let client = client(&state)?;
    let (connected, tasks) = state
        .db
        .call(move |db| {
            Ok((
                db.get_google_tokens(auth.id)?.is_some(),
                db.list_tasks_for_assignee(auth.id)?,
            ))
        })
        .await?;
    if !connected {
        return Err(ApiError::BadRequest(
            "Connect Google Calendar first".to_string(),
        ));
    }

    let mut result = SyncResult { synced: 0, failed: 0 };
    for task in tasks {
        let task_id = task.id;
        match calendar::sync_task(state.db.clone(), client.clone(), task).await {
            Ok(()) => result.synced += 1,
            Err(e) => {
                warn!(task_id, error = %e, "calendar sync failed");
                result.failed += 1;
            }
        }
    }
    info!(user_id = auth.id, synced = result.synced, failed = result.failed, "calendar sync finished");
    Ok(Json(result))
}

async fn disconnect(State(state): State<SharedState>, auth: AuthUser) -> ApiResult<StatusCode> {
    state
        .db
        .call(move |db| db.clear_google_tokens(auth.id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
