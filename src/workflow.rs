//! Automated workflow status engine.
//!
//! Projects using the automated workflow never store a hand-picked status for
//! in-flight tasks; the status shown on the board is derived from the task's
//! dates every time the task list is read. [`derive_status`] is the pure
//! date rule, [`effective_status`] layers the backlog rule on top, and
//! [`reconcile`] turns a task list into the set of status changes to persist.
//!
//! | Stored status | Dates                        | Result       |
//! |---------------|------------------------------|--------------|
//! | COMPLETED     | any                          | COMPLETED    |
//! | BLOCKED       | any                          | BLOCKED      |
//! | other         | start or end missing         | TODO         |
//! | other         | start > today                | TODO         |
//! | other         | end < today                  | IN_REVIEW    |
//! | other         | start <= today <= end        | IN_PROGRESS  |
//!
//! Backlog rule: once the end date has passed, a task with at least one
//! subtask where not every subtask is complete is BLOCKED, whatever the
//! table above says. This applies to COMPLETED tasks as well.

use chrono::{DateTime, NaiveDate, Utc};

use crate::app::models::{Subtask, Task, TaskStatus};

/// The current date in UTC, time of day discarded.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Derive the display status from the stored status and the task's dates.
pub fn derive_status(
    current: TaskStatus,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    today: NaiveDate,
) -> TaskStatus {
    if current.is_sticky() {
        return current;
    }
    let (Some(start), Some(end)) = (start_date, end_date) else {
        return TaskStatus::Todo;
    };
    let start = start.date_naive();
    let end = end.date_naive();

    if start > today {
        TaskStatus::Todo
    } else if end < today {
        TaskStatus::InReview
    } else {
        TaskStatus::InProgress
    }
}

/// True when there is at least one subtask and not all of them are done.
pub fn has_incomplete_subtasks(subtasks: &[Subtask]) -> bool {
    !subtasks.is_empty() && subtasks.iter().any(|s| !s.completed)
}

/// Status after applying both the date rule and the backlog rule.
pub fn effective_status(task: &Task, today: NaiveDate) -> TaskStatus {
    let overdue = task
        .end_date
        .map(|end| end.date_naive() < today)
        .unwrap_or(false);
    if overdue && has_incomplete_subtasks(&task.subtasks) {
        return TaskStatus::Blocked;
    }
    derive_status(task.status, task.start_date, task.end_date, today)
}

/// A status transition produced by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub task_id: i64,
    pub project_id: i64,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Compute the status changes needed to bring `tasks` up to date.
pub fn reconcile(tasks: &[Task], today: NaiveDate) -> Vec<StatusChange> {
    tasks
        .iter()
        .filter_map(|task| {
            let next = effective_status(task, today);
            (next != task.status).then(|| StatusChange {
                task_id: task.id,
                project_id: task.project_id,
                from: task.status,
                to: next,
            })
        })
        .collect()
}
