//! Contact attempt records for escalation to emergency contacts.
//!
//! Only the persisted shape exists; nothing drives a priority 1→2→3 cascade
//! yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ledger::Channel;

/// Outcome of one attempt to reach an emergency contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Sent,
    Answered,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Sent => "sent",
            AttemptStatus::Answered => "answered",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptStatus::Pending),
            "sent" => Some(AttemptStatus::Sent),
            "answered" => Some(AttemptStatus::Answered),
            "failed" => Some(AttemptStatus::Failed),
            _ => None,
        }
    }
}

/// Escalation priority of an emergency contact (1 is tried first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ContactPriority(u8);

impl ContactPriority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 3;

    /// The primary contact.
    pub const FIRST: ContactPriority = ContactPriority(Self::MIN);

    pub fn new(priority: u8) -> Option<Self> {
        (Self::MIN..=Self::MAX)
            .contains(&priority)
            .then_some(ContactPriority(priority))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for ContactPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ContactPriority::new(value).ok_or_else(|| {
            format!(
                "contact priority must be between {} and {}, got {}",
                Self::MIN,
                Self::MAX,
                value
            )
        })
    }
}

impl From<ContactPriority> for u8 {
    fn from(p: ContactPriority) -> Self {
        p.0
    }
}

/// One row of `contact_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactAttempt {
    pub task_id: i64,
    pub contact_priority: ContactPriority,
    pub contact_phone_hash: String,
    pub channel: Channel,
    pub status: AttemptStatus,
    pub response_code: Option<String>,
    pub response_message: Option<String>,
    pub cost_cents: i64,
    pub deducted: bool,
    pub attempted_at: DateTime<Utc>,
}
