use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use super::{SharedState, notify, require_non_empty, require_project_member, send_email};
use crate::app::models::{
    InvitationStatus, Meeting, MeetingInvitation, NewMeeting, NewNotification, NotificationKind,
};
use crate::auth::AuthUser;
use crate::errors::{ApiError, ApiResult};
use crate::integrations::email;

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route(
            "/projects/{id}/meetings",
            get(list_meetings).post(create_meeting),
        )
        .route("/meetings/invitations", get(list_invitations))
        .route("/meetings/{id}/respond", post(respond))
        .route("/meetings/{id}", delete(delete_meeting))
}

#[derive(Deserialize)]
pub struct CreateMeetingRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub location: Option<String>,
    #[serde(default)]
    pub invitee_ids: Vec<i64>,
}

#[derive(Deserialize)]
pub struct RespondRequest {
    pub status: InvitationStatus,
}

async fn list_meetings(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Meeting>>> {
    require_project_member(&state, id, auth.id).await?;
    let meetings = state.db.call(move |db| db.list_meetings(id)).await?;
    Ok(Json(meetings))
}

/// Schedule a meeting and invite project members. Each invitee gets a
/// notification and an email.
async fn create_meeting(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<CreateMeetingRequest>,
) -> ApiResult<(StatusCode, Json<Meeting>)> {
    let (project, _) = require_project_member(&state, id, auth.id).await?;
    let title = require_non_empty(&req.title, "Title")?;
    if req.ends_at <= req.starts_at {
        return Err(ApiError::BadRequest(
            "A meeting must end after it starts".to_string(),
        ));
    }
    let project_members = state.db.call(move |db| db.member_ids(id)).await?;
    if req.invitee_ids.iter().any(|u| !project_members.contains(u)) {
        return Err(ApiError::BadRequest(
            "Every invitee must be a member of the project".to_string(),
        ));
    }

    let new = NewMeeting {
        title,
        description: req.description,
        starts_at: req.starts_at,
        ends_at: req.ends_at,
        location: req.location,
        invitee_ids: req.invitee_ids,
    };
    let (meeting, organizer, invitees) = state
        .db
        .call(move |db| {
            let meeting = db.create_meeting(id, auth.id, &new)?;
            let organizer = db.get_user(auth.id)?;
            let mut invitees = Vec::new();
            for invitation in &meeting.invitations {
                if let Some(user) = db.get_user(invitation.user_id)? {
                    invitees.push(user);
                }
            }
            Ok((meeting, organizer, invitees))
        })
        .await?;
    info!(meeting_id = meeting.id, project_id = id, invitees = invitees.len(), "meeting created");

    let organizer_name = organizer.map(|u| u.name).unwrap_or_default();
    let when = meeting.starts_at.format("%Y-%m-%d %H:%M UTC").to_string();
    let link = state.link(&format!("/projects/{}/meetings/{}", id, meeting.id));
    for invitee in invitees {
        notify(
            &state,
            NewNotification {
                user_id: invitee.id,
                kind: NotificationKind::MeetingInvite,
                title: format!("Meeting: {}", meeting.title),
                body: format!("{} invited you ({}) in {}", organizer_name, when, project.name),
                link: Some(link.clone()),
            },
        )
        .await?;
        send_email(
            &state,
            email::meeting_invite(&invitee.email, &meeting.title, &organizer_name, &when, &link),
        );
    }
    Ok((StatusCode::CREATED, Json(meeting)))
}

/// Meetings the caller has been invited to and not yet answered.
async fn list_invitations(
    State(state): State<SharedState>,
    auth: AuthUser,
) -> ApiResult<Json<Vec<Meeting>>> {
    let meetings = state
        .db
        .call(move |db| db.list_pending_invitations(auth.id))
        .await?;
    Ok(Json(meetings))
}

async fn respond(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<RespondRequest>,
) -> ApiResult<Json<MeetingInvitation>> {
    if req.status == InvitationStatus::Pending {
        return Err(ApiError::BadRequest(
            "Respond with ACCEPTED or DECLINED".to_string(),
        ));
    }
    let invitation = state
        .db
        .call(move |db| db.respond_invitation(id, auth.id, req.status))
        .await?
        .ok_or_else(|| ApiError::NotFound("No invitation to this meeting".to_string()))?;
    Ok(Json(invitation))
}

async fn delete_meeting(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    let meeting = state
        .db
        .call(move |db| db.get_meeting(id))
        .await?
        .ok_or_else(|| ApiError::not_found("Meeting", id))?;
    if meeting.organizer_id != auth.id {
        return Err(ApiError::Forbidden(
            "Only the organizer can cancel this meeting".to_string(),
        ));
    }
    state.db.call(move |db| db.delete_meeting(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::app::api::testing::*;
    use crate::app::models::WorkflowType;
    use crate::integrations::email::testing::RecordingMailer;

    async fn setup(state: &SharedState) -> (i64, i64, i64, i64) {
        let ada = seed_user(state, "Ada").await;
        let bob = seed_user(state, "Bob").await;
        let eve = seed_user(state, "Eve").await;
        let p = state
            .db
            .call(move |db| {
                let p = db.create_project(ada, "Apollo", "", WorkflowType::Automated)?;
                db.add_member(p.id, bob)?;
                Ok(p.id)
            })
            .await
            .unwrap();
        (ada, bob, eve, p)
    }

    fn meeting_body(invitees: &[i64]) -> serde_json::Value {
        let start = Utc::now() + Duration::days(1);
        json!({
            "title": "Kickoff",
            "starts_at": start.to_rfc3339(),
            "ends_at": (start + Duration::hours(1)).to_rfc3339(),
            "invitee_ids": invitees,
        })
    }

    #[tokio::test]
    async fn test_create_invites_and_notifies() {
        let mailer = Arc::new(RecordingMailer::default());
        let state = test_state_with(mailer.clone());
        let (ada, bob, _eve, p) = setup(&state).await;

        let uri = format!("/api/v1/projects/{}/meetings", p);
        let response = app(&state)
            .oneshot(request(&state, "POST", &uri, Some(ada), Some(meeting_body(&[ada, bob]))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let meeting: serde_json::Value = body_json(response.into_body()).await;
        let invitations = meeting["invitations"].as_array().unwrap();
        assert_eq!(invitations.len(), 1);
        assert_eq!(invitations[0]["user_id"], bob);
        assert_eq!(invitations[0]["status"], "PENDING");

        let notifications = state
            .db
            .call(move |db| db.list_notifications(bob, 10, false))
            .await
            .unwrap();
        assert_eq!(notifications[0].kind, NotificationKind::MeetingInvite);

        for _ in 0..50 {
            if !mailer.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(mailer.sent.lock().unwrap()[0].to, "bob@example.com");
    }

    #[tokio::test]
    async fn test_rejects_outsiders_and_bad_ranges() {
        let state = test_state();
        let (ada, _bob, eve, p) = setup(&state).await;
        let uri = format!("/api/v1/projects/{}/meetings", p);

        let response = app(&state)
            .oneshot(request(&state, "POST", &uri, Some(ada), Some(meeting_body(&[eve]))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut body = meeting_body(&[]);
        body["ends_at"] = body["starts_at"].clone();
        let response = app(&state)
            .oneshot(request(&state, "POST", &uri, Some(ada), Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_respond_and_pending_list() {
        let state = test_state();
        let (ada, bob, eve, p) = setup(&state).await;
        let uri = format!("/api/v1/projects/{}/meetings", p);
        let response = app(&state)
            .oneshot(request(&state, "POST", &uri, Some(ada), Some(meeting_body(&[bob]))))
            .await
            .unwrap();
        let meeting: serde_json::Value = body_json(response.into_body()).await;

        let response = app(&state)
            .oneshot(request(&state, "GET", "/api/v1/meetings/invitations", Some(bob), None))
            .await
            .unwrap();
        let pending: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(pending.len(), 1);

        let respond_uri = format!("/api/v1/meetings/{}/respond", meeting["id"]);
        let response = app(&state)
            .oneshot(request(&state, "POST", &respond_uri, Some(eve), Some(json!({"status": "ACCEPTED"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(&state)
            .oneshot(request(&state, "POST", &respond_uri, Some(bob), Some(json!({"status": "ACCEPTED"}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let invitation: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(invitation["status"], "ACCEPTED");

        let response = app(&state)
            .oneshot(request(&state, "GET", "/api/v1/meetings/invitations", Some(bob), None))
            .await
            .unwrap();
        let pending: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_only_organizer_deletes() {
        let state = test_state();
        let (ada, bob, _eve, p) = setup(&state).await;
        let uri = format!("/api/v1/projects/{}/meetings", p);
        let response = app(&state)
            .oneshot(request(&state, "POST", &uri, Some(ada), Some(meeting_body(&[bob]))))
            .await
            .unwrap();
        let meeting: serde_json::Value = body_json(response.into_body()).await;

        let uri = format!("/api/v1/meetings/{}", meeting["id"]);
        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(bob), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = app(&state)
            .oneshot(request(&state, "DELETE", &uri, Some(ada), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
