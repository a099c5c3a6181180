use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::TaskifyDb;
use crate::app::models::{Document, Note};

const NOTE_COLUMNS: &str = "id, project_id, author_id, title, content, created_at, updated_at";
const DOCUMENT_COLUMNS: &str =
    "id, project_id, uploaded_by, name, url, mime_type, size_bytes, created_at";

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        project_id: row.get(1)?,
        author_id: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        project_id: row.get(1)?,
        uploaded_by: row.get(2)?,
        name: row.get(3)?,
        url: row.get(4)?,
        mime_type: row.get(5)?,
        size_bytes: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl TaskifyDb {
    // ── Notes ─────────────────────────────────────────────────────────

    pub fn create_note(
        &self,
        project_id: i64,
        author_id: i64,
        title: &str,
        content: &str,
    ) -> Result<Note> {
        self.conn
            .execute(
                "INSERT INTO notes (project_id, author_id, title, content) VALUES (?1, ?2, ?3, ?4)",
                params![project_id, author_id, title, content],
            )
            .context("Failed to insert note")?;
        let id = self.conn.last_insert_rowid();
        self.get_note(id)?.context("Note not found after insert")
    }

    pub fn get_note(&self, id: i64) -> Result<Option<Note>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM notes WHERE id = ?1", NOTE_COLUMNS),
                params![id],
                note_from_row,
            )
            .optional()
            .context("Failed to query note")
    }

    /// Notes in a project, most recently edited first.
    pub fn list_notes(&self, project_id: i64) -> Result<Vec<Note>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM notes WHERE project_id = ?1 ORDER BY updated_at DESC, id DESC",
                NOTE_COLUMNS
            ))
            .context("Failed to prepare list_notes")?;
        let rows = stmt
            .query_map(params![project_id], note_from_row)
            .context("Failed to query notes")?;
        let mut notes = Vec::new();
        for row in rows {
            notes.push(row.context("Failed to read note row")?);
        }
        Ok(notes)
    }

    pub fn update_note(&self, id: i64, title: Option<&str>, content: Option<&str>) -> Result<Note> {
        let current = self
            .get_note(id)?
            .with_context(|| format!("Note {} not found", id))?;
        self.conn
            .execute(
                "UPDATE notes SET title = ?1, content = ?2,
                    updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                 WHERE id = ?3",
                params![
                    title.unwrap_or(&current.title),
                    content.unwrap_or(&current.content),
                    id
                ],
            )
            .context("Failed to update note")?;
        self.get_note(id)?.context("Note not found after update")
    }

    pub fn delete_note(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM notes WHERE id = ?1", params![id])
            .context("Failed to delete note")?;
        Ok(n > 0)
    }

    // ── Documents ─────────────────────────────────────────────────────

    pub fn create_document(
        &self,
        project_id: i64,
        uploaded_by: i64,
        name: &str,
        url: &str,
        mime_type: Option<&str>,
        size_bytes: Option<i64>,
    ) -> Result<Document> {
        self.conn
            .execute(
                "INSERT INTO documents (project_id, uploaded_by, name, url, mime_type, size_bytes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![project_id, uploaded_by, name, url, mime_type, size_bytes],
            )
            .context("Failed to insert document")?;
        let id = self.conn.last_insert_rowid();
        self.get_document(id)?
            .context("Document not found after insert")
    }

    pub fn get_document(&self, id: i64) -> Result<Option<Document>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM documents WHERE id = ?1", DOCUMENT_COLUMNS),
                params![id],
                document_from_row,
            )
            .optional()
            .context("Failed to query document")
    }

    pub fn list_documents(&self, project_id: i64) -> Result<Vec<Document>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM documents WHERE project_id = ?1 ORDER BY created_at DESC, id DESC",
                DOCUMENT_COLUMNS
            ))
            .context("Failed to prepare list_documents")?;
        let rows = stmt
            .query_map(params![project_id], document_from_row)
            .context("Failed to query documents")?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row.context("Failed to read document row")?);
        }
        Ok(documents)
    }

    pub fn delete_document(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id])
            .context("Failed to delete document")?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::db::test_support::{project, user};
    use crate::app::models::WorkflowType;

    #[test]
    fn test_note_lifecycle() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p = project(&db, &ada, WorkflowType::Automated);

        let note = db.create_note(p.id, ada.id, "Agenda", "- item")?;
        assert_eq!(note.author_id, ada.id);

        let updated = db.update_note(note.id, None, Some("- item\n- another"))?;
        assert_eq!(updated.title, "Agenda");
        assert_eq!(updated.content, "- item\n- another");
        assert_eq!(db.list_notes(p.id)?.len(), 1);

        assert!(db.delete_note(note.id)?);
        assert!(db.get_note(note.id)?.is_none());
        Ok(())
    }

    #[test]
    fn test_documents_are_scoped_to_project() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p1 = project(&db, &ada, WorkflowType::Automated);
        let p2 = project(&db, &ada, WorkflowType::Automated);

        let doc = db.create_document(
            p1.id,
            ada.id,
            "spec.pdf",
            "https://files.example.com/spec.pdf",
            Some("application/pdf"),
            Some(2048),
        )?;
        assert_eq!(doc.size_bytes, Some(2048));
        assert_eq!(db.list_documents(p1.id)?.len(), 1);
        assert!(db.list_documents(p2.id)?.is_empty());

        assert!(db.delete_document(doc.id)?);
        assert!(!db.delete_document(doc.id)?);
        Ok(())
    }

    #[test]
    fn test_deleting_project_removes_content() -> Result<()> {
        let db = TaskifyDb::new_in_memory()?;
        let ada = user(&db, "Ada");
        let p = project(&db, &ada, WorkflowType::Automated);
        let note = db.create_note(p.id, ada.id, "n", "")?;
        db.delete_project(p.id)?;
        assert!(db.get_note(note.id)?.is_none());
        Ok(())
    }
}
