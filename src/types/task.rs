//! Notification task types and the task state machine.
//!
//! A task moves `pending → processing → {success, failed}`. The
//! `processing` state is a lease: the claiming worker owns the task until
//! `lease_until`, after which another worker may reclaim it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{TaskCode, UserId};
use super::ledger::Channel;

/// What a task notifies the user about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    /// Daily check-in reminders and missed check-in notices.
    CheckInReminder,
    /// Overdue journey notices.
    JourneyReminder,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::CheckInReminder => "check_in_reminder",
            TaskCategory::JourneyReminder => "journey_reminder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "check_in_reminder" => Some(TaskCategory::CheckInReminder),
            "journey_reminder" => Some(TaskCategory::JourneyReminder),
            _ => None,
        }
    }
}

/// Persisted task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the last attempt at a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Machine-readable code (a provider status code or an internal code
    /// such as `quota_insufficient`).
    pub code: String,
    pub message: String,
    /// Whether another attempt could succeed.
    pub retryable: bool,
}

impl TaskFailure {
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        TaskFailure {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        TaskFailure {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }
}

/// A task as submitted by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_code: TaskCode,
    pub user_id: UserId,
    pub category: TaskCategory,
    pub channel: Channel,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
}

/// A persisted notification task.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationTask {
    pub id: i64,
    pub task_code: TaskCode,
    pub user_id: UserId,
    pub category: TaskCategory,
    pub channel: Channel,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub cost_cents: i64,
    /// True while the task holds a ledger reservation, and after settlement.
    pub deducted: bool,
    pub lease_until: Option<DateTime<Utc>>,
    pub last_failure: Option<TaskFailure>,
}

/// What the idempotency guard decides for an incoming delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The caller may claim the task. `reclaim` is true when this is not the
    /// first attempt (expired lease or retryable failure).
    Claim { reclaim: bool },
    /// The task already succeeded; delivery is a no-op.
    AlreadySucceeded,
    /// Another worker holds a live lease.
    Busy { lease_until: DateTime<Utc> },
    /// The task failed and must not be attempted again.
    Terminal { reason: String },
    /// The message names a different user than the task row.
    WrongUser { owner: UserId },
}

impl NotificationTask {
    /// Decides whether a delivery of this task for `user` may proceed at `now`.
    ///
    /// `max_attempts` bounds the total number of claims a task receives.
    pub fn admission(&self, user: UserId, now: DateTime<Utc>, max_attempts: u32) -> Admission {
        if self.user_id != user {
            return Admission::WrongUser {
                owner: self.user_id,
            };
        }

        match self.status {
            TaskStatus::Success => Admission::AlreadySucceeded,
            TaskStatus::Pending => Admission::Claim { reclaim: false },
            TaskStatus::Processing => match self.lease_until {
                Some(lease_until) if lease_until > now => Admission::Busy { lease_until },
                // A processing row without a live lease was abandoned.
                _ => self.retry_admission("lease expired", max_attempts),
            },
            TaskStatus::Failed => match &self.last_failure {
                Some(failure) if failure.retryable => {
                    self.retry_admission(&failure.code, max_attempts)
                }
                Some(failure) => Admission::Terminal {
                    reason: format!("{}: {}", failure.code, failure.message),
                },
                None => Admission::Terminal {
                    reason: "failed without a recorded cause".to_string(),
                },
            },
        }
    }

    fn retry_admission(&self, cause: &str, max_attempts: u32) -> Admission {
        // retry_count counts re-claims, so the first attempt is attempt 1.
        if self.retry_count + 1 >= max_attempts {
            Admission::Terminal {
                reason: format!(
                    "attempt budget of {} exhausted (last cause: {})",
                    max_attempts, cause
                ),
            }
        } else {
            Admission::Claim { reclaim: true }
        }
    }

    /// Returns true once the task can no longer change.
    pub fn is_terminal(&self, max_attempts: u32) -> bool {
        match self.status {
            TaskStatus::Success => true,
            TaskStatus::Failed => !matches!(
                self.admission(self.user_id, Utc::now(), max_attempts),
                Admission::Claim { .. }
            ),
            TaskStatus::Pending | TaskStatus::Processing => false,
        }
    }
}
