use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::{TaskifyDb, parse_enum};
use crate::app::models::{Comment, NewActivity, NewTask, Subtask, Task, TaskChanges, TaskStatus};
use crate::workflow::StatusChange;

const TASK_COLUMNS: &str = "id, project_id, title, description, status, priority, start_date, \
     end_date, assignee_id, custom_column_id, calendar_event_id, created_by, created_at, updated_at";

const COMMENT_COLUMNS: &str =
    "c.id, c.task_id, c.author_id, u.name, c.content, c.created_at, c.updated_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: parse_enum(4, row.get(4)?)?,
        priority: parse_enum(5, row.get(5)?)?,
        start_date: row.get(6)?,
        end_date: row.get(7)?,
        assignee_id: row.get(8)?,
        custom_column_id: row.get(9)?,
        calendar_event_id: row.get(10)?,
        created_by: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        subtasks: Vec::new(),
    })
}

fn subtask_from_row(row: &Row<'_>) -> rusqlite::Result<Subtask> {
    Ok(Subtask {
        id: row.get(0)?,
        task_id: row.get(1)?,
        title: row.get(2)?,
        completed: row.get(3)?,
        position: row.get(4)?,
    })
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        task_id: row.get(1)?,
        author_id: row.get(2)?,
        author_name: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl TaskifyDb {
    // ── Task CRUD ─────────────────────────────────────────────────────

    pub fn create_task(&self, project_id: i64, created_by: i64, new: &NewTask) -> Result<Task> {
        self.conn
            .execute(
                "INSERT INTO tasks (project_id, title, description, status, priority, start_date,
                    end_date, assignee_id, custom_column_id, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    project_id,
                    new.title,
                    new.description,
                    new.status.as_str(),
                    new.priority.as_str(),
                    new.start_date,
                    new.end_date,
                    new.assignee_id,
                    new.custom_column_id,
                    created_by
                ],
            )
            .context("Failed to insert task")?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?.context("Task not found after insert")
    }

    /// Fetch a task together with its subtasks.
    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let task = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                task_from_row,
            )
            .optional()
            .context("Failed to query task")?;
        match task {
            Some(mut task) => {
                task.subtasks = self.list_subtasks(task.id)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// All tasks in a project, oldest first, with subtasks attached.
    pub fn list_tasks(&self, project_id: i64) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE project_id = ?1 ORDER BY created_at, id",
                TASK_COLUMNS
            ))
            .context("Failed to prepare list_tasks")?;
        let rows = stmt
            .query_map(params![project_id], task_from_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?);
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT s.id, s.task_id, s.title, s.completed, s.position
                 FROM subtasks s JOIN tasks t ON t.id = s.task_id
                 WHERE t.project_id = ?1 ORDER BY s.position, s.id",
            )
            .context("Failed to prepare project subtasks")?;
        let rows = stmt
            .query_map(params![project_id], subtask_from_row)
            .context("Failed to query project subtasks")?;
        let mut by_task: HashMap<i64, Vec<Subtask>> = HashMap::new();
        for row in rows {
            let subtask = row.context("Failed to read subtask row")?;
            by_task.entry(subtask.task_id).or_default().push(subtask);
        }
        for task in &mut tasks {
            task.subtasks = by_task.remove(&task.id).unwrap_or_default();
        }
        Ok(tasks)
    }

    /// Tasks assigned to a user across every project, used for calendar sync.
    pub fn list_tasks_for_assignee(&self, user_id: i64) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM tasks WHERE assignee_id = ?1 ORDER BY id",
                TASK_COLUMNS
            ))
            .context("Failed to prepare list_tasks_for_assignee")?;
        let rows = stmt
            .query_map(params![user_id], task_from_row)
            .context("Failed to query assigned tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?);
        }
        Ok(tasks)
    }

    pub fn update_task(&self, id: i64, changes: &TaskChanges) -> Result<Task> {
        let mut task = self
            .get_task(id)?
            .with_context(|| format!("Task {} not found", id))?;
        if let Some(title) = &changes.title {
            task.title = title.clone();
        }
        if let Some(description) = &changes.description {
            task.description = description.clone();
        }
        if let Some(status) = changes.status {
            task.status = status;
        }
        if let Some(priority) = changes.priority {
            task.priority = priority;
        }
        if let Some(start) = changes.start_date {
            task.start_date = start;
        }
        if let Some(end) = changes.end_date {
            task.end_date = end;
        }
        if let Some(assignee) = changes.assignee_id {
            task.assignee_id = assignee;
        }
        if let Some(column) = changes.custom_column_id {
            task.custom_column_id = column;
        }

        self.conn
            .execute(
                "UPDATE tasks SET title = ?1, description = ?2, status = ?3, priority = ?4,
                    start_date = ?5, end_date = ?6, assignee_id = ?7, custom_column_id = ?8,
                    updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                 WHERE id = ?9",
                params![
                    task.title,
                    task.description,
                    task.status.as_str(),
                    task.priority.as_str(),
                    task.start_date,
                    task.end_date,
                    task.assignee_id,
                    task.custom_column_id,
                    id
                ],
            )
            .context("Failed to update task")?;
        self.get_task(id)?.context("Task not found after update")
    }

    /// Move a task from `from` to `to`. Returns false when the stored status
    /// no longer equals `from`, leaving the row untouched.
    pub fn set_task_status_if(&self, id: i64, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                 WHERE id = ?2 AND status = ?3",
                params![to.as_str(), id, from.as_str()],
            )
            .context("Failed to update task status")?;
        Ok(n > 0)
    }

    pub fn set_task_calendar_event(&self, id: i64, event_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE tasks SET calendar_event_id = ?1 WHERE id = ?2",
                params![event_id, id],
            )
            .context("Failed to update calendar event id")?;
        Ok(())
    }

    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .context("Failed to delete task")?;
        Ok(n > 0)
    }

    /// Persist reconciled statuses, logging each transition as a system activity.
    /// A change whose task has moved on since it was read is skipped; the
    /// changes actually written are returned.
    pub fn apply_status_changes(&self, changes: &[StatusChange]) -> Result<Vec<StatusChange>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let mut applied = Vec::with_capacity(changes.len());
        for change in changes {
            if !self.set_task_status_if(change.task_id, change.from, change.to)? {
                continue;
            }
            self.record_activity(&NewActivity {
                project_id: change.project_id,
                task_id: Some(change.task_id),
                user_id: None,
                action: "STATUS_CHANGED",
                from_value: Some(change.from.as_str().to_string()),
                to_value: Some(change.to.as_str().to_string()),
            })?;
            applied.push(change.clone());
        }
        tx.commit().context("Failed to commit status changes")?;
        Ok(applied)
    }

    // ── Subtasks ──────────────────────────────────────────────────────

    pub fn list_subtasks(&self, task_id: i64) -> Result<Vec<Subtask>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, title, completed, position FROM subtasks
                 WHERE task_id = ?1 ORDER BY position, id",
            )
            .context("Failed to prepare list_subtasks")?;
        let rows = stmt
            .query_map(params![task_id], subtask_from_row)
            .context("Failed to query subtasks")?;
        let mut subtasks = Vec::new();
        for row in rows {
            subtasks.push(row.context("Failed to read subtask row")?);
        }
        Ok(subtasks)
    }

    pub fn add_subtask(&self, task_id: i64, title: &str) -> Result<Subtask> {
        let max_pos: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM subtasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .context("Failed to get max subtask position")?;
        self.conn
            .execute(
                "INSERT INTO subtasks (task_id, title, position) VALUES (?1, ?2, ?3)",
                params![task_id, title, max_pos + 1],
            )
            .context("Failed to insert subtask")?;
        let id = self.conn.last_insert_rowid();
        self.get_subtask(id)?.context("Subtask not found after insert")
    }

    pub fn get_subtask(&self, id: i64) -> Result<Option<Subtask>> {
        self.conn
            .query_row(
                "SELECT id, task_id, title, completed, position FROM subtasks WHERE id = ?1",
                params![id],
                subtask_from_row,
            )
            .optional()
            .context("Failed to query subtask")
    }

    pub fn update_subtask(
        &self,
        id: i64,
        title: Option<&str>,
        completed: Option<bool>,
        position: Option<i32>,
    ) -> Result<Subtask> {
        let current = self
            .get_subtask(id)?
            .with_context(|| format!("Subtask {} not found", id))?;
        self.conn
            .execute(
                "UPDATE subtasks SET title = ?1, completed = ?2, position = ?3 WHERE id = ?4",
                params![
                    title.unwrap_or(&current.title),
                    completed.unwrap_or(current.completed),
                    position.unwrap_or(current.position),
                    id
                ],
            )
            .context("Failed to update subtask")?;
        self.get_subtask(id)?.context("Subtask not found after update")
    }

    pub fn delete_subtask(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM subtasks WHERE id = ?1", params![id])
            .context("Failed to delete subtask")?;
        Ok(n > 0)
    }

    // ── Comments ──────────────────────────────────────────────────────

    pub fn add_comment(&self, task_id: i64, author_id: i64, content: &str) -> Result<Comment> {
        self.conn
            .execute(
                "INSERT INTO comments (task_id, author_id, content) VALUES (?1, ?2, ?3)",
                params![task_id, author_id, content],
            )
            .context("Failed to insert comment")?;
        let id = self.conn.last_insert_rowid();
        self.get_comment(id)?.context("Comment not found after insert")
    }

    pub fn get_comment(&self, id: i64) -> Result<Option<Comment>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM comments c JOIN users u ON u.id = c.author_id WHERE c.id = ?1",
                    COMMENT_COLUMNS
                ),
                params![id],
                comment_from_row,
            )
            .optional()
            .context("Failed to query comment")
    }

    pub fn list_comments(&self, task_id: i64) -> Result<Vec<Comment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM comments c JOIN users u ON u.id = c.author_id
                 WHERE c.task_id = ?1 ORDER BY c.created_at, c.id",
                COMMENT_COLUMNS
            ))
            .context("Failed to prepare list_comments")?;
        let rows = stmt
            .query_map(params![task_id], comment_from_row)
            .context("Failed to query comments")?;
        let mut comments = Vec::new();
        for row in rows {
            comments.push(row.context("Failed to read comment row")?);
        }
        Ok(comments)
    }

    pub fn update_comment(&self, id: i64, content: &str) -> Result<Comment> {
        self.conn
            .execute(
                "UPDATE comments SET content = ?1, updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                 WHERE id = ?2",
                params![content, id],
            )
            .context("Failed to update comment")?;
        self.get_comment(id)?
            .with_context(|| format!("Comment {} not found", id))
    }

    pub fn delete_comment(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM comments WHERE id = ?1", params![id])
            .context("Failed to delete comment")?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::db::test_support::{project, user};
    use crate::app::models::{TaskPriority, WorkflowType};
    use chrono::{Duration, TimeZone, Utc};

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            start_date: None,
            end_date: None,
            assignee_id: None,
            custom_column_id: None,
        }
    }

    #[test]
    fn test_create_and_get_task_with_dates() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p = project(&db, &ada, WorkflowType::Automated);
        let start = Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap();
        let mut new = new_task("Launch");
        new.start_date = Some(start);
        new.end_date = Some(start + Duration::days(5));
        new.assignee_id = Some(ada.id);

        let task = db.create_task(p.id, ada.id, &new)?;
        assert_eq!(task.title, "Launch");
        assert_eq!(task.start_date, Some(start));
        assert_eq!(task.end_date, Some(start + Duration::days(5)));
        assert_eq!(task.assignee_id, Some(ada.id));
        assert_eq!(task.created_by, ada.id);
        assert!(task.subtasks.is_empty());
        Ok(())
    }

    #[test]
    fn test_list_tasks_groups_subtasks() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p = project(&db, &ada, WorkflowType::Automated);
        let a = db.create_task(p.id, ada.id, &new_task("A"))?;
        let b = db.create_task(p.id, ada.id, &new_task("B"))?;
        db.add_subtask(a.id, "a1")?;
        db.add_subtask(a.id, "a2")?;
        db.add_subtask(b.id, "b1")?;

        let tasks = db.list_tasks(p.id)?;
        assert_eq!(tasks.len(), 2);
        let titles: Vec<&str> = tasks[0].subtasks.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["a1", "a2"]);
        assert_eq!(tasks[1].subtasks.len(), 1);
        Ok(())
    }

    #[test]
    fn test_update_task_partial_and_clear() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p = project(&db, &ada, WorkflowType::Custom);
        let mut new = new_task("Draft");
        new.assignee_id = Some(ada.id);
        let task = db.create_task(p.id, ada.id, &new)?;

        let updated = db.update_task(
            task.id,
            &TaskChanges {
                title: Some("Final".to_string()),
                priority: Some(TaskPriority::Urgent),
                assignee_id: Some(None),
                ..Default::default()
            },
        )?;
        assert_eq!(updated.title, "Final");
        assert_eq!(updated.priority, TaskPriority::Urgent);
        assert_eq!(updated.assignee_id, None);
        assert_eq!(updated.status, TaskStatus::Todo);
        Ok(())
    }

    #[test]
    fn test_delete_task_cascades() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p = project(&db, &ada, WorkflowType::Automated);
        let task = db.create_task(p.id, ada.id, &new_task("Gone"))?;
        let sub = db.add_subtask(task.id, "s")?;
        let comment = db.add_comment(task.id, ada.id, "hi")?;

        assert!(db.delete_task(task.id)?);
        assert!(db.get_task(task.id)?.is_none());
        assert!(db.get_subtask(sub.id)?.is_none());
        assert!(db.get_comment(comment.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_apply_status_changes_logs_activity() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p = project(&db, &ada, WorkflowType::Automated);
        let task = db.create_task(
            p.id,
            ada.id,
            &NewTask {
                status: TaskStatus::InProgress,
                ..new_task("Overdue")
            },
        )?;

        let applied = db.apply_status_changes(&[StatusChange {
            task_id: task.id,
            project_id: p.id,
            from: TaskStatus::InProgress,
            to: TaskStatus::Blocked,
        }])?;
        assert_eq!(applied.len(), 1);

        assert_eq!(db.get_task(task.id)?.unwrap().status, TaskStatus::Blocked);
        let activity = db.list_activities(p.id, 10)?;
        assert_eq!(activity.len(), 1);
        assert_eq!(activity[0].action, "STATUS_CHANGED");
        assert_eq!(activity[0].user_id, None);
        assert_eq!(activity[0].from_value.as_deref(), Some("IN_PROGRESS"));
        assert_eq!(activity[0].to_value.as_deref(), Some("BLOCKED"));
        Ok(())
    }

    #[test]
    fn test_stale_status_change_does_not_overwrite_user_edit() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p = project(&db, &ada, WorkflowType::Automated);
        let task = db.create_task(
            p.id,
            ada.id,
            &NewTask {
                start_date: Some(Utc::now() - Duration::days(3)),
                end_date: Some(Utc::now() + Duration::days(3)),
                ..new_task("Running")
            },
        )?;

        // A reader computes TODO -> IN_PROGRESS from its snapshot...
        let snapshot = db.list_tasks(p.id)?;
        let changes = crate::workflow::reconcile(&snapshot, crate::workflow::today());
        assert_eq!(changes.len(), 1);

        // ...while the user completes the task before the write lands.
        db.update_task(
            task.id,
            &TaskChanges {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
        )?;

        let applied = db.apply_status_changes(&changes)?;
        assert!(applied.is_empty());
        assert_eq!(db.get_task(task.id)?.unwrap().status, TaskStatus::Completed);
        assert!(
            db.list_activities(p.id, 10)?
                .iter()
                .all(|a| a.action != "STATUS_CHANGED")
        );
        Ok(())
    }

    #[test]
    fn test_subtask_update_toggles_completion() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p = project(&db, &ada, WorkflowType::Automated);
        let task = db.create_task(p.id, ada.id, &new_task("T"))?;
        let sub = db.add_subtask(task.id, "check")?;
        assert!(!sub.completed);

        let done = db.update_subtask(sub.id, None, Some(true), None)?;
        assert!(done.completed);
        assert_eq!(done.title, "check");
        Ok(())
    }

    #[test]
    fn test_comments_carry_author_name() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p = project(&db, &ada, WorkflowType::Automated);
        let task = db.create_task(p.id, ada.id, &new_task("T"))?;
        let c = db.add_comment(task.id, ada.id, "first")?;
        assert_eq!(c.author_name, "Ada");

        db.update_comment(c.id, "edited")?;
        let comments = db.list_comments(task.id)?;
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].content, "edited");
        Ok(())
    }
}
