use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, patch, post},
};
use serde::{Deserialize, Serialize};

use super::SharedState;
use crate::app::models::Notification;
use crate::auth::AuthUser;
use crate::errors::{ApiError, ApiResult};

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 200;

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/read-all", post(mark_all_read))
        .route("/notifications/{id}/read", patch(mark_read))
        .route("/notifications/{id}", delete(delete_notification))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
    #[serde(default)]
    pub unread_only: bool,
}

#[derive(Serialize)]
pub struct UnreadCount {
    pub count: i64,
}

#[derive(Serialize)]
pub struct Updated {
    pub updated: usize,
}

async fn list_notifications(
    State(state): State<SharedState>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Notification>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let notifications = state
        .db
        .call(move |db| db.list_notifications(auth.id, limit, query.unread_only))
        .await?;
    Ok(Json(notifications))
}

async fn unread_count(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> ApiResult<Json<UnreadCount>> {
    let count = state
        .db
        .call(move |db| db.unread_notification_count(auth.id))
        .await?;
    Ok(Json(UnreadCount { count }))
}

async fn mark_read(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let found = state
        .db
        .call(move |db| db.mark_notification_read(id, auth.id))
        .await?;
    if !found {
        return Err(ApiError::not_found("Notification", id));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_all_read(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> ApiResult<Json<Updated>> {
    let updated = state
        .db
        .call(move |db| db.mark_all_notifications_read(auth.id))
        .await?;
    Ok(Json(Updated { updated }))
}

async fn delete_notification(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let found = state
        .db
        .call(move |db| db.delete_notification(id, auth.id))
        .await?;
    if !found {
        return Err(ApiError::not_found("Notification", id));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::*;
    use crate::app::api::testing::*;
    use crate::app::models::{NewNotification, NotificationKind};

    async fn seed_notifications(state: &SharedState, user_id: i64, n: usize) -> Vec<i64> {
        state
            .db
            .call(move |db| {
                let mut ids = Vec::new();
                for i in 0..n {
                    let created = db.create_notification(&NewNotification {
                        user_id,
                        kind: NotificationKind::TaskAssigned,
                        title: format!("Task {}", i),
                        body: String::new(),
                        link: None,
                    })?;
                    ids.push(created.id);
                }
                Ok(ids)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_and_unread_count() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let ids = seed_notifications(&state, ada, 3).await;

        let response = app(&state)
            .oneshot(request(&state, "GET", "/api/v1/notifications?limit=2", Some(ada), None))
            .await
            .unwrap();
        let listed: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0]["id"], ids[2]);

        let uri = format!("/api/v1/notifications/{}/read", ids[0]);
        let response = app(&state)
            .oneshot(request(&state, "PATCH", &uri, Some(ada), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app(&state)
            .oneshot(request(&state, "GET", "/api/v1/notifications/unread-count", Some(ada), None))
            .await
            .unwrap();
        let count: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(count["count"], 2);

        let response = app(&state)
            .oneshot(request(&state, "GET", "/api/v1/notifications?unread_only=true", Some(ada), None))
            .await
            .unwrap();
        let unread: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(unread.len(), 2);
    }

    #[tokio::test]
    async fn test_read_all_and_ownership() {
        let state = test_state();
        let ada = seed_user(&state, "Ada").await;
        let bob = seed_user(&state, "Bob").await;
        let ids = seed_notifications(&state, ada, 2).await;

        let uri = format!("/api/v1/notifications/{}", ids[0]);
        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(bob), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(&state)
            .oneshot(request(&state, "POST", "/api/v1/notifications/read-all", Some(ada), None))
            .await
            .unwrap();
        let updated: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(updated["updated"], 2);

        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(ada), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
