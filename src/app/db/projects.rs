use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::{TaskifyDb, parse_enum};
use crate::app::models::{
    ConversationKind, CustomColumn, MemberRole, Project, ProjectMember, WorkflowType,
};

const PROJECT_COLUMNS: &str =
    "p.id, p.name, p.description, p.owner_id, p.workflow, p.created_at, p.updated_at";

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner_id: row.get(3)?,
        workflow: parse_enum(4, row.get(4)?)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn column_from_row(row: &Row<'_>) -> rusqlite::Result<CustomColumn> {
    Ok(CustomColumn {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        position: row.get(3)?,
        color: row.get(4)?,
    })
}

impl TaskifyDb {
    // ── Project CRUD ──────────────────────────────────────────────────

    /// Create a project, its owner membership and its project-wide conversation.
    pub fn create_project(
        &self,
        owner_id: i64,
        name: &str,
        description: &str,
        workflow: WorkflowType,
    ) -> Result<Project> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO projects (name, description, owner_id, workflow) VALUES (?1, ?2, ?3, ?4)",
            params![name, description, owner_id, workflow.as_str()],
        )
        .context("Failed to insert project")?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO project_members (project_id, user_id, role) VALUES (?1, ?2, ?3)",
            params![id, owner_id, MemberRole::Owner.as_str()],
        )
        .context("Failed to insert owner membership")?;
        tx.execute(
            "INSERT INTO conversations (project_id, kind, name, created_by) VALUES (?1, ?2, ?3, ?4)",
            params![id, ConversationKind::Project.as_str(), name, owner_id],
        )
        .context("Failed to insert project conversation")?;
        let conversation_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO conversation_members (conversation_id, user_id) VALUES (?1, ?2)",
            params![conversation_id, owner_id],
        )
        .context("Failed to insert conversation member")?;
        tx.commit().context("Failed to commit project")?;
        self.get_project(id)?.context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM projects p WHERE p.id = ?1", PROJECT_COLUMNS),
                params![id],
                project_from_row,
            )
            .optional()
            .context("Failed to query project")
    }

    /// Projects the user owns or belongs to.
    pub fn list_projects_for_user(&self, user_id: i64) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM projects p
                 JOIN project_members m ON m.project_id = p.id
                 WHERE m.user_id = ?1 ORDER BY p.updated_at DESC, p.id DESC",
                PROJECT_COLUMNS
            ))
            .context("Failed to prepare list_projects_for_user")?;
        let rows = stmt
            .query_map(params![user_id], project_from_row)
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn update_project(
        &self,
        id: i64,
        name: Option<&str>,
        description: Option<&str>,
        workflow: Option<WorkflowType>,
    ) -> Result<Project> {
        let current = self
            .get_project(id)?
            .with_context(|| format!("Project {} not found", id))?;
        self.conn
            .execute(
                "UPDATE projects SET name = ?1, description = ?2, workflow = ?3,
                    updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                 WHERE id = ?4",
                params![
                    name.unwrap_or(&current.name),
                    description.unwrap_or(&current.description),
                    workflow.unwrap_or(current.workflow).as_str(),
                    id
                ],
            )
            .context("Failed to update project")?;
        self.get_project(id)?.context("Project not found after update")
    }

    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(n > 0)
    }

    // ── Membership ────────────────────────────────────────────────────

    /// The user's role in the project, or `None` if they have no access.
    pub fn project_role(&self, project_id: i64, user_id: i64) -> Result<Option<MemberRole>> {
        let role: Option<String> = self
            .conn
            .query_row(
                "SELECT role FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query project role")?;
        role.map(|r| r.parse().map_err(|e: String| anyhow::anyhow!(e)))
            .transpose()
    }

    pub fn list_members(&self, project_id: i64) -> Result<Vec<ProjectMember>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT m.project_id, m.user_id, u.name, u.email, m.role, m.joined_at
                 FROM project_members m JOIN users u ON u.id = m.user_id
                 WHERE m.project_id = ?1 ORDER BY m.joined_at, m.user_id",
            )
            .context("Failed to prepare list_members")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(ProjectMember {
                    project_id: row.get(0)?,
                    user_id: row.get(1)?,
                    name: row.get(2)?,
                    email: row.get(3)?,
                    role: parse_enum(4, row.get(4)?)?,
                    joined_at: row.get(5)?,
                })
            })
            .context("Failed to query members")?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row.context("Failed to read member row")?);
        }
        Ok(members)
    }

    pub fn member_ids(&self, project_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM project_members WHERE project_id = ?1")
            .context("Failed to prepare member_ids")?;
        let rows = stmt
            .query_map(params![project_id], |row| row.get(0))
            .context("Failed to query member ids")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read member id")?);
        }
        Ok(ids)
    }

    /// Add a member and enrol them in the project conversation.
    /// Returns `false` if the user was already a member.
    pub fn add_member(&self, project_id: i64, user_id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO project_members (project_id, user_id, role) VALUES (?1, ?2, ?3)",
                params![project_id, user_id, MemberRole::Member.as_str()],
            )
            .context("Failed to insert member")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id)
                 SELECT id, ?2 FROM conversations WHERE project_id = ?1 AND kind = ?3",
                params![project_id, user_id, ConversationKind::Project.as_str()],
            )
            .context("Failed to add member to project conversation")?;
        Ok(n > 0)
    }

    /// Remove a member from the project and every conversation in it.
    pub fn remove_member(&self, project_id: i64, user_id: i64) -> Result<bool> {
        self.conn
            .execute(
                "DELETE FROM conversation_members WHERE user_id = ?1
                 AND conversation_id IN (SELECT id FROM conversations WHERE project_id = ?2)",
                params![user_id, project_id],
            )
            .context("Failed to remove member from conversations")?;
        let n = self
            .conn
            .execute(
                "DELETE FROM project_members WHERE project_id = ?1 AND user_id = ?2",
                params![project_id, user_id],
            )
            .context("Failed to delete member")?;
        Ok(n > 0)
    }

    // ── Custom columns ────────────────────────────────────────────────

    pub fn list_columns(&self, project_id: i64) -> Result<Vec<CustomColumn>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, name, position, color FROM custom_columns
                 WHERE project_id = ?1 ORDER BY position, id",
            )
            .context("Failed to prepare list_columns")?;
        let rows = stmt
            .query_map(params![project_id], column_from_row)
            .context("Failed to query columns")?;
        let mut columns = Vec::new();
        for row in rows {
            columns.push(row.context("Failed to read column row")?);
        }
        Ok(columns)
    }

    pub fn create_column(
        &self,
        project_id: i64,
        name: &str,
        color: Option<&str>,
    ) -> Result<CustomColumn> {
        let max_pos: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM custom_columns WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to get max column position")?;
        self.conn
            .execute(
                "INSERT INTO custom_columns (project_id, name, position, color) VALUES (?1, ?2, ?3, ?4)",
                params![project_id, name, max_pos + 1, color],
            )
            .context("Failed to insert column")?;
        let id = self.conn.last_insert_rowid();
        self.get_column(id)?.context("Column not found after insert")
    }

    pub fn get_column(&self, id: i64) -> Result<Option<CustomColumn>> {
        self.conn
            .query_row(
                "SELECT id, project_id, name, position, color FROM custom_columns WHERE id = ?1",
                params![id],
                column_from_row,
            )
            .optional()
            .context("Failed to query column")
    }

    pub fn update_column(
        &self,
        id: i64,
        name: Option<&str>,
        position: Option<i32>,
        color: Option<&str>,
    ) -> Result<CustomColumn> {
        let current = self
            .get_column(id)?
            .with_context(|| format!("Column {} not found", id))?;
        self.conn
            .execute(
                "UPDATE custom_columns SET name = ?1, position = ?2, color = ?3 WHERE id = ?4",
                params![
                    name.unwrap_or(&current.name),
                    position.unwrap_or(current.position),
                    color.or(current.color.as_deref()),
                    id
                ],
            )
            .context("Failed to update column")?;
        self.get_column(id)?.context("Column not found after update")
    }

    pub fn delete_column(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM custom_columns WHERE id = ?1", params![id])
            .context("Failed to delete column")?;
        Ok(n > 0)
    }
}
