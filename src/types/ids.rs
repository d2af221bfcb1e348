//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different ID types (e.g., using a
//! journey ID where a user ID is expected) and make the code more
//! self-documenting.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// An end user's account ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(n: i64) -> Self {
        UserId(n)
    }
}

/// A journey ID (a user-declared trip with an expected return time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JourneyId(pub i64);

impl fmt::Display for JourneyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JourneyId {
    fn from(n: i64) -> Self {
        JourneyId(n)
    }
}

/// The idempotency key of a notification task.
///
/// Supplied by the producer. Re-delivering a message for the same task code
/// never sends or charges twice once the task is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskCode(pub String);

impl TaskCode {
    pub fn new(s: impl Into<String>) -> Self {
        TaskCode(s.into())
    }

    /// Task code for a user's daily check-in reminder.
    pub fn check_in_reminder(date: chrono::NaiveDate, user: UserId) -> Self {
        TaskCode(format!("check_in_reminder:{}:{}", date, user))
    }

    /// Task code for a user's missed check-in notification.
    pub fn check_in_timeout(date: chrono::NaiveDate, user: UserId) -> Self {
        TaskCode(format!("check_in_timeout:{}:{}", date, user))
    }

    /// Task code for an overdue journey notification.
    pub fn journey_timeout(journey: JourneyId) -> Self {
        TaskCode(format!("journey_timeout:{}", journey))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskCode {
    fn from(s: String) -> Self {
        TaskCode(s)
    }
}

impl From<&str> for TaskCode {
    fn from(s: &str) -> Self {
        TaskCode(s.to_string())
    }
}

/// A queue message ID, the admission idempotency key.
///
/// Independent from [`TaskCode`]: one message may fan out to many tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(s: impl Into<String>) -> Self {
        MessageId(s.into())
    }

    /// A message ID derived from `parent` and `parts`.
    ///
    /// The same inputs always give the same ID, so a message produced while
    /// handling `parent` keeps its ID when `parent` is redelivered and the
    /// duplicate is caught at admission.
    pub fn derived(parent: &MessageId, parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(parent.as_str().as_bytes());
        for part in parts {
            hasher.update([0u8]);
            hasher.update(part.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        MessageId(format!("{}:{}", parent, &digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

/// The scan batch a scheduler message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub String);

impl BatchId {
    pub fn new(s: impl Into<String>) -> Self {
        BatchId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
