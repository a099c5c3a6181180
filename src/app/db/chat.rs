use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::{TaskifyDb, parse_enum};
use crate::app::models::{
    Conversation, ConversationKind, ConversationMember, ConversationSummary, Message,
};

const CONVERSATION_COLUMNS: &str =
    "c.id, c.project_id, c.kind, c.name, c.created_by, c.created_at, c.updated_at";

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, u.name, m.content, \
     m.is_edited, m.created_at, m.updated_at";

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        project_id: row.get(1)?,
        kind: parse_enum(2, row.get(2)?)?,
        name: row.get(3)?,
        created_by: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        members: Vec::new(),
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        is_edited: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl TaskifyDb {
    // ── Conversations ─────────────────────────────────────────────────

    fn conversation_members(&self, conversation_id: i64) -> Result<Vec<ConversationMember>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT cm.user_id, u.name, cm.last_read_at, cm.joined_at
                 FROM conversation_members cm JOIN users u ON u.id = cm.user_id
                 WHERE cm.conversation_id = ?1 ORDER BY cm.joined_at, cm.user_id",
            )
            .context("Failed to prepare conversation_members")?;
        let rows = stmt
            .query_map(params![conversation_id], |row| {
                Ok(ConversationMember {
                    user_id: row.get(0)?,
                    name: row.get(1)?,
                    last_read_at: row.get(2)?,
                    joined_at: row.get(3)?,
                })
            })
            .context("Failed to query conversation members")?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row.context("Failed to read conversation member row")?);
        }
        Ok(members)
    }

    fn with_members(&self, conversation: Option<Conversation>) -> Result<Option<Conversation>> {
        match conversation {
            Some(mut c) => {
                c.members = self.conversation_members(c.id)?;
                Ok(Some(c))
            }
            None => Ok(None),
        }
    }

    pub fn get_conversation(&self, id: i64) -> Result<Option<Conversation>> {
        let conversation = self
            .conn
            .query_row(
                &format!("SELECT {} FROM conversations c WHERE c.id = ?1", CONVERSATION_COLUMNS),
                params![id],
                conversation_from_row,
            )
            .optional()
            .context("Failed to query conversation")?;
        self.with_members(conversation)
    }

    pub fn get_project_conversation(&self, project_id: i64) -> Result<Option<Conversation>> {
        let conversation = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM conversations c WHERE c.project_id = ?1 AND c.kind = ?2",
                    CONVERSATION_COLUMNS
                ),
                params![project_id, ConversationKind::Project.as_str()],
                conversation_from_row,
            )
            .optional()
            .context("Failed to query project conversation")?;
        self.with_members(conversation)
    }

    /// The DIRECT conversation between two users in a project, if one exists.
    pub fn find_direct_conversation(
        &self,
        project_id: i64,
        a: i64,
        b: i64,
    ) -> Result<Option<Conversation>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT c.id FROM conversations c
                 WHERE c.project_id = ?1 AND c.kind = ?2
                   AND EXISTS (SELECT 1 FROM conversation_members WHERE conversation_id = c.id AND user_id = ?3)
                   AND EXISTS (SELECT 1 FROM conversation_members WHERE conversation_id = c.id AND user_id = ?4)
                 ORDER BY c.id LIMIT 1",
                params![project_id, ConversationKind::Direct.as_str(), a, b],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query direct conversation")?;
        match id {
            Some(id) => self.get_conversation(id),
            None => Ok(None),
        }
    }

    /// Create a conversation. The creator is always a member; duplicate ids
    /// in `member_ids` are ignored.
    pub fn create_conversation(
        &self,
        project_id: i64,
        kind: ConversationKind,
        name: Option<&str>,
        created_by: i64,
        member_ids: &[i64],
    ) -> Result<Conversation> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO conversations (project_id, kind, name, created_by) VALUES (?1, ?2, ?3, ?4)",
            params![project_id, kind.as_str(), name, created_by],
        )
        .context("Failed to insert conversation")?;
        let id = tx.last_insert_rowid();
        for user_id in std::iter::once(&created_by).chain(member_ids) {
            tx.execute(
                "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id) VALUES (?1, ?2)",
                params![id, user_id],
            )
            .context("Failed to insert conversation member")?;
        }
        tx.commit().context("Failed to commit conversation")?;
        self.get_conversation(id)?
            .context("Conversation not found after insert")
    }

    pub fn is_conversation_member(&self, conversation_id: i64, user_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query conversation membership")?;
        Ok(found.is_some())
    }

    /// Conversations in a project the user belongs to, most recently active first.
    pub fn list_conversations_for_user(
        &self,
        project_id: i64,
        user_id: i64,
    ) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM conversations c
                 JOIN conversation_members cm ON cm.conversation_id = c.id
                 WHERE c.project_id = ?1 AND cm.user_id = ?2
                 ORDER BY c.updated_at DESC, c.id DESC",
                CONVERSATION_COLUMNS
            ))
            .context("Failed to prepare list_conversations_for_user")?;
        let rows = stmt
            .query_map(params![project_id, user_id], conversation_from_row)
            .context("Failed to query conversations")?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row.context("Failed to read conversation row")?);
        }

        let mut summaries = Vec::with_capacity(conversations.len());
        for mut conversation in conversations {
            conversation.members = self.conversation_members(conversation.id)?;
            let unread_count = self.unread_count(conversation.id, user_id)?;
            let last_message = self.last_message(conversation.id)?;
            summaries.push(ConversationSummary {
                conversation,
                unread_count,
                last_message,
            });
        }
        Ok(summaries)
    }

    /// Messages from other members newer than the user's read marker.
    /// A member who has never read the conversation has everything unread.
    pub fn unread_count(&self, conversation_id: i64, user_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM messages m
                 JOIN conversation_members cm
                   ON cm.conversation_id = m.conversation_id AND cm.user_id = ?2
                 WHERE m.conversation_id = ?1 AND m.sender_id != ?2
                   AND (cm.last_read_at IS NULL OR m.created_at > cm.last_read_at)",
                params![conversation_id, user_id],
                |row| row.get(0),
            )
            .context("Failed to count unread messages")
    }

    pub fn mark_conversation_read(&self, conversation_id: i64, user_id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE conversation_members SET last_read_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                 WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id, user_id],
            )
            .context("Failed to mark conversation read")?;
        Ok(n > 0)
    }

    pub fn touch_conversation(&self, conversation_id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE conversations SET updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                 WHERE id = ?1",
                params![conversation_id],
            )
            .context("Failed to touch conversation")?;
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────────

    pub fn create_message(
        &self,
        conversation_id: i64,
        sender_id: i64,
        content: &str,
    ) -> Result<Message> {
        self.conn
            .execute(
                "INSERT INTO messages (conversation_id, sender_id, content) VALUES (?1, ?2, ?3)",
                params![conversation_id, sender_id, content],
            )
            .context("Failed to insert message")?;
        let id = self.conn.last_insert_rowid();
        self.get_message(id)?.context("Message not found after insert")
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM messages m JOIN users u ON u.id = m.sender_id WHERE m.id = ?1",
                    MESSAGE_COLUMNS
                ),
                params![id],
                message_from_row,
            )
            .optional()
            .context("Failed to query message")
    }

    fn last_message(&self, conversation_id: i64) -> Result<Option<Message>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM messages m JOIN users u ON u.id = m.sender_id
                     WHERE m.conversation_id = ?1 ORDER BY m.id DESC LIMIT 1",
                    MESSAGE_COLUMNS
                ),
                params![conversation_id],
                message_from_row,
            )
            .optional()
            .context("Failed to query last message")
    }

    /// A page of messages in chronological order: the newest `limit` messages
    /// with an id below `before` (or overall when `before` is `None`).
    pub fn list_messages(
        &self,
        conversation_id: i64,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM messages m JOIN users u ON u.id = m.sender_id
                 WHERE m.conversation_id = ?1 AND (?2 IS NULL OR m.id < ?2)
                 ORDER BY m.id DESC LIMIT ?3",
                MESSAGE_COLUMNS
            ))
            .context("Failed to prepare list_messages")?;
        let rows = stmt
            .query_map(params![conversation_id, before, limit], message_from_row)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.context("Failed to read message row")?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn update_message_content(&self, id: i64, content: &str) -> Result<Message> {
        self.conn
            .execute(
                "UPDATE messages SET content = ?1, is_edited = 1,
                    updated_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                 WHERE id = ?2",
                params![content, id],
            )
            .context("Failed to update message")?;
        self.get_message(id)?
            .with_context(|| format!("Message {} not found", id))
    }

    pub fn delete_message(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM messages WHERE id = ?1", params![id])
            .context("Failed to delete message")?;
        Ok(n > 0)
    }
}
