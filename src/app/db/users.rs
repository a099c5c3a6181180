use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::TaskifyDb;
use crate::app::models::{GoogleTokens, User, UserCredentials};

const USER_COLUMNS: &str =
    "id, name, email, avatar_url, google_access_token IS NOT NULL, created_at, updated_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        avatar_url: row.get(3)?,
        calendar_connected: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl TaskifyDb {
    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, name: &str, email: &str, password_hash: &str) -> Result<User> {
        self.conn
            .execute(
                "INSERT INTO users (name, email, password_hash) VALUES (?1, ?2, ?3)",
                params![name, email.to_lowercase(), password_hash],
            )
            .context("Failed to insert user")?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id],
                user_from_row,
            )
            .optional()
            .context("Failed to query user")
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
                params![email.to_lowercase()],
                user_from_row,
            )
            .optional()
            .context("Failed to query user by email")
    }

    pub fn get_credentials_by_email(&self, email: &str) -> Result<Option<UserCredentials>> {
        self.conn
            .query_row(
                "SELECT id, password_hash FROM users WHERE email = ?1",
                params![email.to_lowercase()],
                |row| {
                    Ok(UserCredentials {
                        user_id: row.get(0)?,
                        password_hash: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to query credentials")
    }

    pub fn get_credentials(&self, user_id: i64) -> Result<Option<UserCredentials>> {
        self.conn
            .query_row(
                "SELECT id, password_hash FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(UserCredentials {
                        user_id: row.get(0)?,
                        password_hash: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to query credentials")
    }

    pub fn update_user_profile(
        &self,
        id: i64,
        name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<User> {
        if let Some(name) = name {
            self.conn
                .execute(
                    "UPDATE users SET name = ?1, updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now') WHERE id = ?2",
                    params![name, id],
                )
                .context("Failed to update user name")?;
        }
        if let Some(avatar_url) = avatar_url {
            self.conn
                .execute(
                    "UPDATE users SET avatar_url = ?1, updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now') WHERE id = ?2",
                    params![avatar_url, id],
                )
                .context("Failed to update user avatar")?;
        }
        self.get_user(id)?.context("User not found after update")
    }

    pub fn update_password(&self, id: i64, password_hash: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE users SET password_hash = ?1, updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now') WHERE id = ?2",
                params![password_hash, id],
            )
            .context("Failed to update password")?;
        Ok(())
    }

    /// Case-insensitive substring match on name or email.
    pub fn search_users(&self, query: &str, limit: i64) -> Result<Vec<User>> {
        let pattern = format!("%{}%", query.to_lowercase());
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM users WHERE lower(name) LIKE ?1 OR email LIKE ?1 ORDER BY name LIMIT ?2",
                USER_COLUMNS
            ))
            .context("Failed to prepare search_users")?;
        let rows = stmt
            .query_map(params![pattern, limit], user_from_row)
            .context("Failed to search users")?;
        let mut users = Vec::new();
        for row in rows {
            users.push(row.context("Failed to read user row")?);
        }
        Ok(users)
    }

    // ── Refresh tokens ────────────────────────────────────────────────

    pub fn store_refresh_token(
        &self,
        user_id: i64,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.prune_expired_refresh_tokens(Utc::now())?;
        self.conn
            .execute(
                "INSERT INTO refresh_tokens (user_id, token_hash, expires_at) VALUES (?1, ?2, ?3)",
                params![user_id, token_hash, expires_at],
            )
            .context("Failed to store refresh token")?;
        Ok(())
    }

    /// Delete tokens that expired at or before `now`. Returns how many went.
    pub fn prune_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM refresh_tokens WHERE expires_at <= ?1",
                params![now],
            )
            .context("Failed to prune refresh tokens")
    }

    /// Remove a refresh token and return its owner if it was still valid.
    /// Single use: a consumed token can never be presented again.
    pub fn consume_refresh_token(&self, token_hash: &str, now: DateTime<Utc>) -> Result<Option<i64>> {
        let row: Option<(i64, DateTime<Utc>)> = self
            .conn
            .query_row(
                "SELECT user_id, expires_at FROM refresh_tokens WHERE token_hash = ?1",
                params![token_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query refresh token")?;
        self.revoke_refresh_token(token_hash)?;
        Ok(row.and_then(|(user_id, expires_at)| (expires_at > now).then_some(user_id)))
    }

    pub fn revoke_refresh_token(&self, token_hash: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "DELETE FROM refresh_tokens WHERE token_hash = ?1",
                params![token_hash],
            )
            .context("Failed to revoke refresh token")?;
        Ok(n > 0)
    }

    pub fn revoke_user_refresh_tokens(&self, user_id: i64) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM refresh_tokens WHERE user_id = ?1",
                params![user_id],
            )
            .context("Failed to revoke user refresh tokens")
    }

    // ── Google OAuth tokens ───────────────────────────────────────────

    pub fn set_google_tokens(&self, user_id: i64, tokens: &GoogleTokens) -> Result<()> {
        // Google omits the refresh token on re-consent; keep the stored one.
        self.conn
            .execute(
                "UPDATE users SET google_access_token = ?1,
                    google_refresh_token = COALESCE(?2, google_refresh_token),
                    google_token_expires_at = ?3
                 WHERE id = ?4",
                params![
                    tokens.access_token,
                    tokens.refresh_token,
                    tokens.expires_at,
                    user_id
                ],
            )
            .context("Failed to store Google tokens")?;
        Ok(())
    }

    pub fn get_google_tokens(&self, user_id: i64) -> Result<Option<GoogleTokens>> {
        let row: Option<(Option<String>, Option<String>, Option<DateTime<Utc>>)> = self
            .conn
            .query_row(
                "SELECT google_access_token, google_refresh_token, google_token_expires_at
                 FROM users WHERE id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to query Google tokens")?;
        Ok(row.and_then(|(access, refresh, expires_at)| {
            access.map(|access_token| GoogleTokens {
                access_token,
                refresh_token: refresh,
                expires_at,
            })
        }))
    }

    pub fn clear_google_tokens(&self, user_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE users SET google_access_token = NULL, google_refresh_token = NULL,
                    google_token_expires_at = NULL WHERE id = ?1",
                params![user_id],
            )
            .context("Failed to clear Google tokens")?;
        Ok(())
    }
}
