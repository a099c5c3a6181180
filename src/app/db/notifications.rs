use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::{TaskifyDb, parse_enum};
use crate::app::models::{Activity, NewActivity, NewNotification, Notification};

const NOTIFICATION_COLUMNS: &str = "id, user_id, kind, title, body, link, is_read, created_at";

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: parse_enum(2, row.get(2)?)?,
        title: row.get(3)?,
        body: row.get(4)?,
        link: row.get(5)?,
        is_read: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl TaskifyDb {
    // ── Notifications ─────────────────────────────────────────────────

    pub fn create_notification(&self, new: &NewNotification) -> Result<Notification> {
        self.conn
            .execute(
                "INSERT INTO notifications (user_id, kind, title, body, link) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![new.user_id, new.kind.as_str(), new.title, new.body, new.link],
            )
            .context("Failed to insert notification")?;
        let id = self.conn.last_insert_rowid();
        self.get_notification(id)?
            .context("Notification not found after insert")
    }

    pub fn get_notification(&self, id: i64) -> Result<Option<Notification>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLUMNS),
                params![id],
                notification_from_row,
            )
            .optional()
            .context("Failed to query notification")
    }

    /// Newest first.
    pub fn list_notifications(
        &self,
        user_id: i64,
        limit: u32,
        unread_only: bool,
    ) -> Result<Vec<Notification>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM notifications WHERE user_id = ?1 AND (?2 = 0 OR is_read = 0)
                 ORDER BY id DESC LIMIT ?3",
                NOTIFICATION_COLUMNS
            ))
            .context("Failed to prepare list_notifications")?;
        let rows = stmt
            .query_map(params![user_id, unread_only, limit], notification_from_row)
            .context("Failed to query notifications")?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row.context("Failed to read notification row")?);
        }
        Ok(notifications)
    }

    pub fn unread_notification_count(&self, user_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND is_read = 0",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count unread notifications")
    }

    /// Mark one notification read. Scoped to its owner; returns `false` when
    /// the id does not exist or belongs to someone else.
    pub fn mark_notification_read(&self, id: i64, user_id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to mark notification read")?;
        Ok(n > 0)
    }

    pub fn mark_all_notifications_read(&self, user_id: i64) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
                params![user_id],
            )
            .context("Failed to mark notifications read")
    }

    pub fn delete_notification(&self, id: i64, user_id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "DELETE FROM notifications WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .context("Failed to delete notification")?;
        Ok(n > 0)
    }

    // ── Activity log ──────────────────────────────────────────────────

    pub fn record_activity(&self, new: &NewActivity) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO activities (project_id, task_id, user_id, action, from_value, to_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    new.project_id,
                    new.task_id,
                    new.user_id,
                    new.action,
                    new.from_value,
                    new.to_value
                ],
            )
            .context("Failed to insert activity")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent activity in a project, newest first.
    pub fn list_activities(&self, project_id: i64, limit: u32) -> Result<Vec<Activity>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, task_id, user_id, action, from_value, to_value, created_at
                 FROM activities WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .context("Failed to prepare list_activities")?;
        let rows = stmt
            .query_map(params![project_id, limit], |row| {
                Ok(Activity {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    task_id: row.get(2)?,
                    user_id: row.get(3)?,
                    action: row.get(4)?,
                    from_value: row.get(5)?,
                    to_value: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query activities")?;
        let mut activities = Vec::new();
        for row in rows {
            activities.push(row.context("Failed to read activity row")?);
        }
        Ok(activities)
    }
}
