use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::app::db::DbHandle;
use crate::app::models::{GoogleTokens, Task};
use crate::config::GoogleSection;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_EVENTS_URL: &str = "https://www.googleapis.com/calendar/v3/calendars/primary/events";
const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar.events";

/// Refresh this long before the stored expiry to avoid racing it.
const EXPIRY_SKEW_SECS: i64 = 60;

/// An event on the user's primary calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEvent {
    pub summary: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CalendarEvent {
    /// The event for a task, or `None` if it has no schedulable dates.
    /// A task with only one date becomes a one-hour event at that time.
    pub fn for_task(task: &Task) -> Option<Self> {
        let (start, end) = match (task.start_date, task.end_date) {
            (Some(s), Some(e)) if e >= s => (s, e),
            (Some(s), Some(_)) | (Some(s), None) => (s, s + Duration::hours(1)),
            (None, Some(e)) => (e - Duration::hours(1), e),
            (None, None) => return None,
        };
        Some(Self {
            summary: task.title.clone(),
            description: task.description.clone(),
            start,
            end,
        })
    }
}

/// Abstraction over the calendar provider. Real implementation:
/// `GoogleCalendar`.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    /// Consent screen URL carrying the signed `state`.
    fn auth_url(&self, state: &str) -> anyhow::Result<String>;

    async fn exchange_code(&self, code: &str) -> anyhow::Result<GoogleTokens>;

    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<GoogleTokens>;

    /// Create the event, or patch it when `event_id` is given. Returns the id.
    async fn upsert_event(
        &self,
        access_token: &str,
        event_id: Option<&str>,
        event: &CalendarEvent,
    ) -> anyhow::Result<String>;

    async fn delete_event(&self, access_token: &str, event_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

impl From<TokenResponse> for GoogleTokens {
    fn from(resp: TokenResponse) -> Self {
        GoogleTokens {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at: resp.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    id: String,
}

/// Google Calendar over the REST API.
pub struct GoogleCalendar {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
}

impl GoogleCalendar {
    /// Returns `None` unless client id, secret and redirect URI are all set.
    pub fn from_config(google: &GoogleSection) -> Option<Self> {
        Some(Self {
            client: reqwest::Client::new(),
            client_id: google.client_id.clone()?,
            client_secret: google.client_secret.clone()?,
            redirect_uri: google.redirect_uri.clone()?,
        })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> anyhow::Result<GoogleTokens> {
        let resp = self
            .client
            .post(GOOGLE_TOKEN_URL)
            .form(form)
            .send()
            .await
            .context("Failed to send token request to Google")?
            .error_for_status()
            .context("Google token endpoint returned error status")?;
        let tokens: TokenResponse = resp
            .json()
            .await
            .context("Failed to parse token response from Google")?;
        Ok(tokens.into())
    }
}

fn event_body(event: &CalendarEvent) -> serde_json::Value {
    json!({
        "summary": event.summary,
        "description": event.description,
        "start": { "dateTime": event.start.to_rfc3339() },
        "end": { "dateTime": event.end.to_rfc3339() },
    })
}

#[async_trait]
impl CalendarClient for GoogleCalendar {
    fn auth_url(&self, state: &str) -> anyhow::Result<String> {
        let url = reqwest::Url::parse_with_params(
            GOOGLE_AUTH_URL,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", CALENDAR_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .context("Failed to build Google consent URL")?;
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> anyhow::Result<GoogleTokens> {
        self.token_request(&[
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<GoogleTokens> {
        self.token_request(&[
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .await
    }

    async fn upsert_event(
        &self,
        access_token: &str,
        event_id: Option<&str>,
        event: &CalendarEvent,
    ) -> anyhow::Result<String> {
        let request = match event_id {
            Some(id) => self.client.patch(format!("{}/{}", GOOGLE_EVENTS_URL, id)),
            None => self.client.post(GOOGLE_EVENTS_URL),
        };
        let resp = request
            .bearer_auth(access_token)
            .json(&event_body(event))
            .send()
            .await
            .context("Failed to send event request to Google")?
            .error_for_status()
            .context("Google Calendar returned error status")?;
        let created: EventResponse = resp
            .json()
            .await
            .context("Failed to parse event response from Google")?;
        Ok(created.id)
    }

    async fn delete_event(&self, access_token: &str, event_id: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(format!("{}/{}", GOOGLE_EVENTS_URL, event_id))
            .bearer_auth(access_token)
            .send()
            .await
            .context("Failed to send delete request to Google")?;
        // Already gone is fine.
        if resp.status() == reqwest::StatusCode::NOT_FOUND
            || resp.status() == reqwest::StatusCode::GONE
        {
            return Ok(());
        }
        resp.error_for_status()
            .context("Google Calendar returned error status")?;
        Ok(())
    }
}

/// True when the stored access token expires within the skew window.
fn needs_refresh(tokens: &GoogleTokens, now: DateTime<Utc>) -> bool {
    match tokens.expires_at {
        Some(exp) => exp - Duration::seconds(EXPIRY_SKEW_SECS) <= now,
        None => false,
    }
}

/// A usable access token for the user, refreshing and persisting it when
/// expired. `None` when the user has not connected a calendar.
pub async fn access_token_for(
    db: &DbHandle,
    client: &dyn CalendarClient,
    user_id: i64,
) -> anyhow::Result<Option<String>> {
    let Some(tokens) = db.call(move |db| db.get_google_tokens(user_id)).await? else {
        return Ok(None);
    };
    if !needs_refresh(&tokens, Utc::now()) {
        return Ok(Some(tokens.access_token));
    }
    let refresh_token = tokens
        .refresh_token
        .context("Google access token expired and no refresh token is stored")?;
    let fresh = client.refresh(&refresh_token).await?;
    let access = fresh.access_token.clone();
    db.call(move |db| db.set_google_tokens(user_id, &fresh)).await?;
    Ok(Some(access))
}

/// Mirror a task onto its owner's calendar. The owner is the assignee, or
/// the creator when unassigned. A task without dates has its event removed.
pub async fn sync_task(
    db: DbHandle,
    client: std::sync::Arc<dyn CalendarClient>,
    task: Task,
) -> anyhow::Result<()> {
    let owner = task.assignee_id.unwrap_or(task.created_by);
    let Some(access) = access_token_for(&db, client.as_ref(), owner).await? else {
        return Ok(());
    };
    let Some(event) = CalendarEvent::for_task(&task) else {
        // Dates were cleared: the existing event no longer belongs on the calendar.
        if let Some(event_id) = task.calendar_event_id.as_deref() {
            client.delete_event(&access, event_id).await?;
            let task_id = task.id;
            db.call(move |db| db.set_task_calendar_event(task_id, None)).await?;
            tracing::debug!(task_id, user_id = owner, "calendar event removed");
        }
        return Ok(());
    };
    let event_id = client
        .upsert_event(&access, task.calendar_event_id.as_deref(), &event)
        .await?;
    if task.calendar_event_id.as_deref() != Some(event_id.as_str()) {
        let task_id = task.id;
        db.call(move |db| db.set_task_calendar_event(task_id, Some(event_id.as_str())))
            .await?;
    }
    tracing::debug!(task_id = task.id, user_id = owner, "task synced to calendar");
    Ok(())
}

/// Remove a deleted task's event from its owner's calendar.
pub async fn remove_task(
    db: DbHandle,
    client: std::sync::Arc<dyn CalendarClient>,
    task: Task,
) -> anyhow::Result<()> {
    let Some(event_id) = task.calendar_event_id.as_deref() else {
        return Ok(());
    };
    let owner = task.assignee_id.unwrap_or(task.created_by);
    let Some(access) = access_token_for(&db, client.as_ref(), owner).await? else {
        return Ok(());
    };
    client.delete_event(&access, event_id).await
}
