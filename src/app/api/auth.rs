use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{SharedState, require_non_empty, send_email};
use crate::app::models::User;
use crate::auth::{
    AuthUser, REFRESH_COOKIE, hash_password, hash_token, verify_password, with_session_cookies,
    without_session_cookies,
};
use crate::errors::{ApiError, ApiResult};
use crate::integrations::email;

const MIN_PASSWORD_LEN: usize = 8;

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me).patch(update_me))
        .route("/auth/change-password", post(change_password))
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, Default)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateMeRequest {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Session payload. The same tokens are also set as HttpOnly cookies.
#[derive(Serialize)]
pub struct SessionResponse {
    pub user: User,
    pub access_token: String,
    pub refresh_token: String,
}

fn normalize_email(email: &str) -> ApiResult<String> {
    let email = email.trim().to_lowercase();
    if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
        return Err(ApiError::BadRequest("A valid email is required".to_string()));
    }
    Ok(email)
}

fn check_password_strength(password: &str) -> ApiResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

/// Argon2 runs on the blocking pool.
async fn hash_blocking(password: String) -> ApiResult<String> {
    let hash = tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| anyhow::anyhow!("Password hashing task failed: {}", e))??;
    Ok(hash)
}

async fn verify_blocking(password: String, stored: String) -> ApiResult<bool> {
    let ok = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
        .await
        .map_err(|e| anyhow::anyhow!("Password verification task failed: {}", e))?;
    Ok(ok)
}

/// Issue an access/refresh pair, store the refresh hash, and set cookies.
async fn start_session(
    state: &SharedState,
    jar: CookieJar,
    user: User,
) -> ApiResult<(CookieJar, SessionResponse)> {
    let access = state.tokens.issue_access(user.id)?;
    let refresh = state.tokens.issue_refresh(user.id)?;
    let user_id = user.id;
    let token_hash = hash_token(&refresh.token);
    let expires_at = refresh.expires_at;
    state
        .db
        .call(move |db| db.store_refresh_token(user_id, &token_hash, expires_at))
        .await?;
    let jar = with_session_cookies(
        jar,
        access.clone(),
        refresh.token.clone(),
        state.config.auth.secure_cookies,
    );
    Ok((
        jar,
        SessionResponse {
            user,
            access_token: access,
            refresh_token: refresh.token,
        },
    ))
}

async fn register(
    State(state): State<SharedState>,
    jar: CookieJar,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let name = require_non_empty(&req.name, "Name")?;
    let email = normalize_email(&req.email)?;
    check_password_strength(&req.password)?;

    let lookup = email.clone();
    if state
        .db
        .call(move |db| db.find_user_by_email(&lookup))
        .await?
        .is_some()
    {
        return Err(ApiError::Conflict("Email is already registered".to_string()));
    }

    let password_hash = hash_blocking(req.password).await?;
    let (user_name, user_email) = (name.clone(), email.clone());
    let user = state
        .db
        .call(move |db| db.create_user(&user_name, &user_email, &password_hash))
        .await?;
    info!(user_id = user.id, "user registered");

    send_email(
        &state,
        email::welcome(&email, &name, &state.config.server.frontend_url),
    );

    let (jar, session) = start_session(&state, jar, user).await?;
    Ok((StatusCode::CREATED, jar, Json(session)))
}

async fn login(
    State(state): State<SharedState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let invalid = || ApiError::Unauthorized("Invalid email or password".to_string());
    let email = req.email.trim().to_lowercase();

    let credentials = state
        .db
        .call(move |db| db.get_credentials_by_email(&email))
        .await?
        .ok_or_else(invalid)?;
    if !verify_blocking(req.password, credentials.password_hash).await? {
        return Err(invalid());
    }
    let user_id = credentials.user_id;
    let user = state
        .db
        .call(move |db| db.get_user(user_id))
        .await?
        .ok_or_else(invalid)?;

    let (jar, session) = start_session(&state, jar, user).await?;
    Ok((jar, Json(session)))
}

/// Rotate the refresh token. The presented token is consumed whether or not
/// the rotation succeeds.
async fn refresh(
    State(state): State<SharedState>,
    jar: CookieJar,
    body: Option<Json<RefreshRequest>>,
) -> ApiResult<impl IntoResponse> {
    let unauthorized = || ApiError::Unauthorized("Invalid or expired refresh token".to_string());
    let token = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .or_else(|| body.and_then(|Json(b)| b.refresh_token))
        .ok_or_else(unauthorized)?;

    let claimed = state.tokens.verify_refresh(&token).ok_or_else(unauthorized)?;
    let token_hash = hash_token(&token);
    let owner = state
        .db
        .call(move |db| db.consume_refresh_token(&token_hash, Utc::now()))
        .await?;
    if owner != Some(claimed) {
        return Err(unauthorized());
    }

    let user = state
        .db
        .call(move |db| db.get_user(claimed))
        .await?
        .ok_or_else(unauthorized)?;
    let (jar, session) = start_session(&state, jar, user).await?;
    Ok((jar, Json(session)))
}

async fn logout(State(state): State<SharedState>, jar: CookieJar) -> ApiResult<impl IntoResponse> {
    if let Some(cookie) = jar.get(REFRESH_COOKIE) {
        let token_hash = hash_token(cookie.value());
        state
            .db
            .call(move |db| db.revoke_refresh_token(&token_hash))
            .await?;
    }
    Ok((StatusCode::NO_CONTENT, without_session_cookies(jar)))
}

async fn me(State(state): State<SharedState>, auth: AuthUser) -> ApiResult<Json<User>> {
    let user = state
        .db
        .call(move |db| db.get_user(auth.id))
        .await?
        .ok_or_else(|| ApiError::not_found("User", auth.id))?;
    Ok(Json(user))
}

async fn update_me(
    State(state): State<SharedState>,
    auth: AuthUser,
    Json(req): Json<UpdateMeRequest>,
) -> ApiResult<Json<User>> {
    let name = req
        .name
        .as_deref()
        .map(|n| require_non_empty(n, "Name"))
        .transpose()?;
    let user = state
        .db
        .call(move |db| db.update_user_profile(auth.id, name.as_deref(), req.avatar_url.as_deref()))
        .await?;
    Ok(Json(user))
}

/// Change the password and sign out every other session.
async fn change_password(
    State(state): State<SharedState>,
    auth: AuthUser,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<StatusCode> {
    check_password_strength(&req.new_password)?;
    let credentials = state
        .db
        .call(move |db| db.get_credentials(auth.id))
        .await?
        .ok_or_else(|| ApiError::not_found("User", auth.id))?;
    if !verify_blocking(req.current_password, credentials.password_hash).await? {
        return Err(ApiError::Unauthorized(
            "Current password is incorrect".to_string(),
        ));
    }
    let new_hash = hash_blocking(req.new_password).await?;
    state
        .db
        .call(move |db| {
            db.update_password(auth.id, &new_hash)?;
            db.revoke_user_refresh_tokens(auth.id)
        })
        .await?;
    info!(user_id = auth.id, "password changed");
    Ok(StatusCode::NO_CONTENT)
}
