//! Queue message schemas and parsing.
//!
//! Producers (the scheduler and the settings-update flow) put four kinds of
//! message on the queue:
//!
//! - `check_in_reminder`: a scanned batch of users due a reminder
//! - `check_in_timeout`: a batch of users who missed their deadline
//! - `journey_timeout`: one overdue journey
//! - `notification`: one prepared task

mod parser;
mod schema;

pub use parser::{ParseError, parse_queue_message};
pub use schema::{
    CheckInReminderMessage, CheckInTimeoutMessage, JourneyTimeoutMessage, NotificationMessage,
    QueueMessage,
};
