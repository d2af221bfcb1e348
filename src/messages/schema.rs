//! Queue message shapes.
//!
//! Every message is a JSON object whose `type` field selects the variant.
//! `scheduled_at` stays as text so that a malformed timestamp reaches
//! reconciliation (which skips the batch) instead of failing the parse.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    BatchId, Channel, ContactPriority, JourneyId, MessageId, SettingsSnapshot, TaskCategory,
    TaskCode, UserId,
};

/// A message on the notification queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMessage {
    CheckInReminder(CheckInReminderMessage),
    CheckInTimeout(CheckInTimeoutMessage),
    JourneyTimeout(JourneyTimeoutMessage),
    Notification(NotificationMessage),
}

impl QueueMessage {
    pub fn message_id(&self) -> &MessageId {
        match self {
            QueueMessage::CheckInReminder(m) => &m.message_id,
            QueueMessage::CheckInTimeout(m) => &m.message_id,
            QueueMessage::JourneyTimeout(m) => &m.message_id,
            QueueMessage::Notification(m) => &m.message_id,
        }
    }

    /// The `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueMessage::CheckInReminder(_) => "check_in_reminder",
            QueueMessage::CheckInTimeout(_) => "check_in_timeout",
            QueueMessage::JourneyTimeout(_) => "journey_timeout",
            QueueMessage::Notification(_) => "notification",
        }
    }

    /// Seconds the queue should hold the message before delivering it.
    pub fn delay_seconds(&self) -> u64 {
        match self {
            QueueMessage::CheckInReminder(m) => m.delay_seconds,
            QueueMessage::CheckInTimeout(m) => m.delay_seconds,
            QueueMessage::JourneyTimeout(m) => m.delay_seconds,
            QueueMessage::Notification(_) => 0,
        }
    }
}

/// A batch of users due a check-in reminder, scanned ahead of time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInReminderMessage {
    pub message_id: MessageId,
    pub batch_id: BatchId,
    pub check_in_date: NaiveDate,
    /// When the scheduler created the message (RFC 3339).
    pub scheduled_at: String,
    pub user_ids: Vec<UserId>,
    /// The settings each user had at scan time.
    #[serde(default)]
    pub user_settings: BTreeMap<UserId, SettingsSnapshot>,
    #[serde(default)]
    pub delay_seconds: u64,
}

/// A batch of users who missed the check-in deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInTimeoutMessage {
    pub message_id: MessageId,
    pub batch_id: BatchId,
    pub check_in_date: NaiveDate,
    pub scheduled_at: String,
    pub user_ids: Vec<UserId>,
    #[serde(default)]
    pub delay_seconds: u64,
}

/// One journey that passed its expected return time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyTimeoutMessage {
    pub message_id: MessageId,
    pub scheduled_at: String,
    pub journey_id: JourneyId,
    pub user_id: UserId,
    #[serde(default)]
    pub delay_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journey_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_return: Option<String>,
}

/// A single prepared notification task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub message_id: MessageId,
    pub task_id: i64,
    pub task_code: TaskCode,
    pub user_id: UserId,
    pub category: TaskCategory,
    pub channel: Channel,
    #[serde(default)]
    pub phone_hash: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "first_priority")]
    pub contact_priority: ContactPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in_date: Option<NaiveDate>,
}

fn first_priority() -> ContactPriority {
    ContactPriority::FIRST
}
