//! Outbound integrations: transactional email and Google Calendar.
//!
//! Both are best effort. A failed email or calendar call is logged and never
//! rolls back the write that triggered it.

pub mod calendar;
pub mod email;

use std::future::Future;

pub use calendar::{CalendarClient, CalendarEvent, GoogleCalendar};
pub use email::{Email, Mailer, NoopMailer, SendGridMailer};

/// Run an integration call on its own task, logging failures at `warn`.
pub fn spawn_best_effort<F>(what: &'static str, fut: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            tracing::warn!(integration = what, error = %format!("{:#}", e), "integration call failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn spawn_best_effort_runs_future() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        spawn_best_effort("test", async move {
            flag.store(true, Ordering::SeqCst);
            let _ = tx.send(());
            Ok(())
        });
        rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawn_best_effort_swallows_errors() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        spawn_best_effort("test", async move {
            let _ = tx.send(());
            anyhow::bail!("smtp down")
        });
        rx.await.unwrap();
    }
}
