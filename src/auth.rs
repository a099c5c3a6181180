//! Authentication primitives.
//!
//! - Passwords are hashed with Argon2id and stored as PHC strings.
//! - Sessions use two HS256 JWTs carried in HttpOnly cookies: a short-lived
//!   access token and a long-lived refresh token. Only the SHA-256 of each
//!   refresh token is persisted, and refreshing rotates it.
//! - [`AuthUser`] is the axum extractor for authenticated routes. It reads the
//!   `accessToken` cookie and falls back to an `Authorization: Bearer` header.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::app::api::AppState;
use crate::config::TaskifyConfig;
use crate::errors::ApiError;

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

/// Lifetime of the signed OAuth `state` parameter.
const OAUTH_STATE_TTL: Duration = Duration::from_secs(10 * 60);

// ── Passwords ─────────────────────────────────────────────────────────

pub fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt)
        .map_err(|e| anyhow::anyhow!("Failed to encode salt: {}", e))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

/// Constant-time check of a password against a stored PHC string.
/// A malformed stored hash never verifies.
pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

// ── Tokens ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    OauthState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
    /// Unique per token so two refresh tokens issued in the same second
    /// still hash differently.
    pub jti: String,
}

/// A freshly issued refresh token and the moment it stops being valid.
#[derive(Debug, Clone)]
pub struct IssuedRefresh {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies the JWTs used by the API.
#[derive(Clone)]
pub struct TokenService {
    access_secret: String,
    refresh_secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(
        access_secret: impl Into<String>,
        refresh_secret: impl Into<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            access_secret: access_secret.into(),
            refresh_secret: refresh_secret.into(),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn from_config(config: &TaskifyConfig) -> Result<Self> {
        Ok(Self::new(
            config.auth.access_secret.clone(),
            config.auth.refresh_secret.clone(),
            config.access_ttl()?,
            config.refresh_ttl()?,
        ))
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    fn sign(&self, user_id: i64, kind: TokenKind, ttl: Duration) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .context("Token TTL out of range")?;
        let claims = Claims {
            sub: user_id,
            kind,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret_for(kind).as_bytes()),
        )
        .context("Failed to sign token")?;
        Ok((token, expires_at))
    }

    fn secret_for(&self, kind: TokenKind) -> &str {
        match kind {
            TokenKind::Refresh => &self.refresh_secret,
            TokenKind::Access | TokenKind::OauthState => &self.access_secret,
        }
    }

    /// Decode a token and check it is of the expected kind.
    /// Returns the user id on success.
    fn verify(&self, token: &str, kind: TokenKind) -> Option<i64> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret_for(kind).as_bytes()),
            &Validation::default(),
        )
        .ok()?;
        (data.claims.kind == kind).then_some(data.claims.sub)
    }

    pub fn issue_access(&self, user_id: i64) -> Result<String> {
        self.sign(user_id, TokenKind::Access, self.access_ttl)
            .map(|(token, _)| token)
    }

    pub fn issue_refresh(&self, user_id: i64) -> Result<IssuedRefresh> {
        let (token, expires_at) = self.sign(user_id, TokenKind::Refresh, self.refresh_ttl)?;
        Ok(IssuedRefresh { token, expires_at })
    }

    pub fn issue_oauth_state(&self, user_id: i64) -> Result<String> {
        self.sign(user_id, TokenKind::OauthState, OAUTH_STATE_TTL)
            .map(|(token, _)| token)
    }

    pub fn verify_access(&self, token: &str) -> Option<i64> {
        self.verify(token, TokenKind::Access)
    }

    pub fn verify_refresh(&self, token: &str) -> Option<i64> {
        self.verify(token, TokenKind::Refresh)
    }

    pub fn verify_oauth_state(&self, token: &str) -> Option<i64> {
        self.verify(token, TokenKind::OauthState)
    }
}

/// SHA-256 hex digest used to store refresh tokens.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

// ── Cookies ───────────────────────────────────────────────────────────

fn session_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(true)
        .secure(secure)
        .same_site(if secure { SameSite::None } else { SameSite::Lax })
        .path("/")
        .build()
}

/// Attach both session cookies to the jar.
pub fn with_session_cookies(
    jar: CookieJar,
    access: String,
    refresh: String,
    secure: bool,
) -> CookieJar {
    jar.add(session_cookie(ACCESS_COOKIE, access, secure))
        .add(session_cookie(REFRESH_COOKIE, refresh, secure))
}

pub fn without_session_cookies(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(ACCESS_COOKIE).path("/"))
        .remove(Cookie::build(REFRESH_COOKIE).path("/"))
}

/// The access token from the `accessToken` cookie or a Bearer header.
pub fn access_token_from_headers(headers: &HeaderMap) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    if let Some(cookie) = jar.get(ACCESS_COOKIE) {
        return Some(cookie.value().to_string());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ── Extractor ─────────────────────────────────────────────────────────

/// The authenticated caller of a request.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub id: i64,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = access_token_from_headers(&parts.headers)
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".to_string()))?;
        let id = state
            .tokens
            .verify_access(&token)
            .ok_or_else(|| ApiError::Unauthorized("Invalid or expired token".to_string()))?;
        Ok(AuthUser { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn service() -> TokenService {
        TokenService::new(
            "access-secret",
            "refresh-secret",
            Duration::from_secs(900),
            Duration::from_secs(7 * 86400),
        )
    }

    #[test]
    fn password_hash_roundtrip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("battery staple", &hash));
    }

    #[test]
    fn password_hashes_are_salted() {
        let a = hash_password("same").unwrap();
        let b = hash_password("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_hash_never_verifies() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn access_token_roundtrip() {
        let tokens = service();
        let token = tokens.issue_access(42).unwrap();
        assert_eq!(tokens.verify_access(&token), Some(42));
    }

    #[test]
    fn token_kinds_are_not_interchangeable() {
        let tokens = service();
        let refresh = tokens.issue_refresh(7).unwrap();
        assert_eq!(tokens.verify_refresh(&refresh.token), Some(7));
        assert_eq!(tokens.verify_access(&refresh.token), None);

        let state = tokens.issue_oauth_state(7).unwrap();
        assert_eq!(tokens.verify_oauth_state(&state), Some(7));
        assert_eq!(tokens.verify_access(&state), None);
    }

    #[test]
    fn refresh_tokens_are_unique() {
        let tokens = service();
        let a = tokens.issue_refresh(1).unwrap();
        let b = tokens.issue_refresh(1).unwrap();
        assert_ne!(hash_token(&a.token), hash_token(&b.token));
        assert!(a.expires_at > Utc::now());
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let other = TokenService::new("x", "y", Duration::from_secs(60), Duration::from_secs(60));
        let token = other.issue_access(1).unwrap();
        assert_eq!(service().verify_access(&token), None);
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = service();
        let claims = Claims {
            sub: 1,
            kind: TokenKind::Access,
            iat: Utc::now().timestamp() - 3600,
            exp: Utc::now().timestamp() - 1800,
            jti: "old".to_string(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"access-secret"),
        )
        .unwrap();
        assert_eq!(tokens.verify_access(&token), None);
    }

    #[test]
    fn hash_token_is_hex_sha256() {
        let digest = hash_token("abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn token_read_from_cookie_before_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(access_token_from_headers(&headers).as_deref(), Some("from-header"));

        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("theme=dark; accessToken=from-cookie"),
        );
        assert_eq!(access_token_from_headers(&headers).as_deref(), Some("from-cookie"));
    }

    #[test]
    fn missing_token_yields_none() {
        assert!(access_token_from_headers(&HeaderMap::new()).is_none());
    }
}
