use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Row, params};

use super::{TaskifyDb, parse_enum};
use crate::app::models::{InvitationStatus, Meeting, MeetingInvitation, NewMeeting};

const MEETING_COLUMNS: &str =
    "id, project_id, organizer_id, title, description, starts_at, ends_at, location, created_at";

fn meeting_from_row(row: &Row<'_>) -> rusqlite::Result<Meeting> {
    Ok(Meeting {
        id: row.get(0)?,
        project_id: row.get(1)?,
        organizer_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        starts_at: row.get(5)?,
        ends_at: row.get(6)?,
        location: row.get(7)?,
        created_at: row.get(8)?,
        invitations: Vec::new(),
    })
}

fn invitation_from_row(row: &Row<'_>) -> rusqlite::Result<MeetingInvitation> {
    Ok(MeetingInvitation {
        meeting_id: row.get(0)?,
        user_id: row.get(1)?,
        user_name: row.get(2)?,
        status: parse_enum(3, row.get(3)?)?,
        responded_at: row.get(4)?,
    })
}

impl TaskifyDb {
    /// Insert a meeting and a PENDING invitation for each invitee.
    /// The organizer is never invited to their own meeting.
    pub fn create_meeting(
        &self,
        project_id: i64,
        organizer_id: i64,
        new: &NewMeeting,
    ) -> Result<Meeting> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO meetings (project_id, organizer_id, title, description, starts_at, ends_at, location)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                project_id,
                organizer_id,
                new.title,
                new.description,
                new.starts_at,
                new.ends_at,
                new.location
            ],
        )
        .context("Failed to insert meeting")?;
        let id = tx.last_insert_rowid();
        for user_id in new.invitee_ids.iter().filter(|&&u| u != organizer_id) {
            tx.execute(
                "INSERT OR IGNORE INTO meeting_invitations (meeting_id, user_id) VALUES (?1, ?2)",
                params![id, user_id],
            )
            .context("Failed to insert invitation")?;
        }
        tx.commit().context("Failed to commit meeting")?;
        self.get_meeting(id)?.context("Meeting not found after insert")
    }

    fn invitations(&self, meeting_id: i64) -> Result<Vec<MeetingInvitation>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT i.meeting_id, i.user_id, u.name, i.status, i.responded_at
                 FROM meeting_invitations i JOIN users u ON u.id = i.user_id
                 WHERE i.meeting_id = ?1 ORDER BY i.user_id",
            )
            .context("Failed to prepare invitations")?;
        let rows = stmt
            .query_map(params![meeting_id], invitation_from_row)
            .context("Failed to query invitations")?;
        let mut invitations = Vec::new();
        for row in rows {
            invitations.push(row.context("Failed to read invitation row")?);
        }
        Ok(invitations)
    }

    pub fn get_meeting(&self, id: i64) -> Result<Option<Meeting>> {
        let meeting = self
            .conn
            .query_row(
                &format!("SELECT {} FROM meetings WHERE id = ?1", MEETING_COLUMNS),
                params![id],
                meeting_from_row,
            )
            .optional()
            .context("Failed to query meeting")?;
        match meeting {
            Some(mut m) => {
                m.invitations = self.invitations(m.id)?;
                Ok(Some(m))
            }
            None => Ok(None),
        }
    }

    /// Meetings in a project ordered by start time.
    pub fn list_meetings(&self, project_id: i64) -> Result<Vec<Meeting>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM meetings WHERE project_id = ?1 ORDER BY starts_at, id",
                MEETING_COLUMNS
            ))
            .context("Failed to prepare list_meetings")?;
        let rows = stmt
            .query_map(params![project_id], meeting_from_row)
            .context("Failed to query meetings")?;
        let mut meetings = Vec::new();
        for row in rows {
            meetings.push(row.context("Failed to read meeting row")?);
        }
        for meeting in &mut meetings {
            meeting.invitations = self.invitations(meeting.id)?;
        }
        Ok(meetings)
    }

    /// Meetings the user has been invited to and not yet answered.
    pub fn list_pending_invitations(&self, user_id: i64) -> Result<Vec<Meeting>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT m.id, m.project_id, m.organizer_id, m.title, m.description, m.starts_at,
                    m.ends_at, m.location, m.created_at
                 FROM meetings m JOIN meeting_invitations i ON i.meeting_id = m.id
                 WHERE i.user_id = ?1 AND i.status = ?2 ORDER BY m.starts_at, m.id",
            )
            .context("Failed to prepare list_pending_invitations")?;
        let rows = stmt
            .query_map(
                params![user_id, InvitationStatus::Pending.as_str()],
                meeting_from_row,
            )
            .context("Failed to query pending invitations")?;
        let mut meetings = Vec::new();
        for row in rows {
            meetings.push(row.context("Failed to read meeting row")?);
        }
        for meeting in &mut meetings {
            meeting.invitations = self.invitations(meeting.id)?;
        }
        Ok(meetings)
    }

    /// Record an invitee's answer. Returns `None` if the user was not invited.
    pub fn respond_invitation(
        &self,
        meeting_id: i64,
        user_id: i64,
        status: InvitationStatus,
    ) -> Result<Option<MeetingInvitation>> {
        let n = self
            .conn
            .execute(
                "UPDATE meeting_invitations SET status = ?1,
                    responded_at = strftime('%Y-%m-%d %H:%M:%f', 'now')
                 WHERE meeting_id = ?2 AND user_id = ?3",
                params![status.as_str(), meeting_id, user_id],
            )
            .context("Failed to update invitation")?;
        if n == 0 {
            return Ok(None);
        }
        self.conn
            .query_row(
                "SELECT i.meeting_id, i.user_id, u.name, i.status, i.responded_at
                 FROM meeting_invitations i JOIN users u ON u.id = i.user_id
                 WHERE i.meeting_id = ?1 AND i.user_id = ?2",
                params![meeting_id, user_id],
                invitation_from_row,
            )
            .optional()
            .context("Failed to query invitation")
    }

    pub fn delete_meeting(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM meetings WHERE id = ?1", params![id])
            .context("Failed to delete meeting")?;
        Ok(n > 0)
    }
}
