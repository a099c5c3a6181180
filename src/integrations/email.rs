use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;

const SENDGRID_SEND_URL: &str = "https://api.sendgrid.com/v3/mail/send";

/// A rendered email ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Abstraction over email delivery so handlers can be tested without a
/// network. Real implementation: `SendGridMailer`. Disabled: `NoopMailer`.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: Email) -> anyhow::Result<()>;
}

/// Sends through the SendGrid v3 API.
pub struct SendGridMailer {
    client: reqwest::Client,
    api_key: String,
    from: String,
}

impl SendGridMailer {
    pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl Mailer for SendGridMailer {
    async fn send(&self, email: Email) -> anyhow::Result<()> {
        let body = json!({
            "personalizations": [{ "to": [{ "email": email.to }] }],
            "from": { "email": self.from },
            "subject": email.subject,
            "content": [{ "type": "text/html", "value": email.html }],
        });
        self.client
            .post(SENDGRID_SEND_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send request to SendGrid")?
            .error_for_status()
            .context("SendGrid returned error status")?;
        tracing::debug!(to = %email.to, subject = %email.subject, "email sent");
        Ok(())
    }
}

/// Used when no SendGrid key is configured.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, email: Email) -> anyhow::Result<()> {
        tracing::debug!(to = %email.to, subject = %email.subject, "email disabled, skipping");
        Ok(())
    }
}

// ── Templates ─────────────────────────────────────────────────────────

fn layout(heading: &str, body: &str, link: Option<&str>) -> String {
    let button = link
        .map(|href| format!(r#"<p><a href="{}">Open in Taskify</a></p>"#, href))
        .unwrap_or_default();
    format!(
        "<div style=\"font-family:sans-serif\"><h2>{}</h2><p>{}</p>{}</div>",
        heading, body, button
    )
}

pub fn welcome(to: &str, name: &str, frontend_url: &str) -> Email {
    Email {
        to: to.to_string(),
        subject: "Welcome to Taskify".to_string(),
        html: layout(
            &format!("Welcome, {}!", name),
            "Your account is ready. Create a project and invite your team to get started.",
            Some(frontend_url),
        ),
    }
}

pub fn task_assigned(to: &str, task_title: &str, project_name: &str, link: &str) -> Email {
    Email {
        to: to.to_string(),
        subject: format!("New task assigned: {}", task_title),
        html: layout(
            "You have a new task",
            &format!("<b>{}</b> in project <b>{}</b> is now assigned to you.", task_title, project_name),
            Some(link),
        ),
    }
}

pub fn member_added(to: &str, project_name: &str, inviter: &str, link: &str) -> Email {
    Email {
        to: to.to_string(),
        subject: format!("You were added to {}", project_name),
        html: layout(
            "New project",
            &format!("{} added you to <b>{}</b>.", inviter, project_name),
            Some(link),
        ),
    }
}

pub fn meeting_invite(to: &str, title: &str, organizer: &str, when: &str, link: &str) -> Email {
    Email {
        to: to.to_string(),
        subject: format!("Meeting invitation: {}", title),
        html: layout(
            "You're invited",
            &format!("{} invited you to <b>{}</b> on {}.", organizer, title, when),
            Some(link),
        ),
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Captures emails instead of sending them.
    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<Email>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: Email) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(email);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_assigned_mentions_task_and_project() {
        let email = task_assigned("bob@example.com", "Ship it", "Apollo", "http://x/projects/1");
        assert_eq!(email.to, "bob@example.com");
        assert!(email.subject.contains("Ship it"));
        assert!(email.html.contains("Apollo"));
        assert!(email.html.contains("http://x/projects/1"));
    }

    #[test]
    fn welcome_greets_by_name() {
        let email = welcome("ada@example.com", "Ada", "http://localhost:5173");
        assert!(email.html.contains("Welcome, Ada!"));
    }

    #[tokio::test]
    async fn noop_mailer_succeeds() {
        let email = welcome("a@example.com", "A", "http://localhost");
        assert!(NoopMailer.send(email).await.is_ok());
    }

    #[tokio::test]
    async fn recording_mailer_captures() {
        let mailer = testing::RecordingMailer::default();
        mailer
            .send(member_added("b@example.com", "Apollo", "Ada", "http://x"))
            .await
            .unwrap();
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("Apollo"));
    }
}
