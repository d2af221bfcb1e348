//! Queue message parser.
//!
//! # Parsing Strategy
//!
//! 1. The body is decoded as JSON and matched on its `type` tag
//! 2. Typed fields are checked by deserialization (dates, channels,
//!    contact priority range)
//! 3. Identity fields that serde accepts but the pipeline cannot use
//!    (empty `message_id`, empty `task_code`) are rejected afterwards

use thiserror::Error;

use super::schema::QueueMessage;

/// Error type for queue message parsing failures.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON deserialization failed (includes unknown `type` tags, missing
    /// fields and out-of-range values).
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Field has an unusable value.
    #[error("invalid field value for {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// Parses a queue message body.
///
/// # Examples
///
/// ```
/// use notification_settlement::messages::{QueueMessage, parse_queue_message};
///
/// let body = br#"{
///     "type": "journey_timeout",
///     "message_id": "m-1",
///     "scheduled_at": "2026-10-19T08:00:00Z",
///     "journey_id": 17,
///     "user_id": 42
/// }"#;
///
/// let message = parse_queue_message(body).unwrap();
/// assert!(matches!(message, QueueMessage::JourneyTimeout(_)));
/// ```
pub fn parse_queue_message(body: &[u8]) -> Result<QueueMessage, ParseError> {
    let message: QueueMessage = serde_json::from_slice(body)?;
    validate(&message)?;
    Ok(message)
}

fn validate(message: &QueueMessage) -> Result<(), ParseError> {
    if message.message_id().as_str().trim().is_empty() {
        return Err(ParseError::InvalidField {
            field: "message_id",
            value: message.message_id().to_string(),
        });
    }
    if let QueueMessage::Notification(notification) = message
        && notification.task_code.as_str().trim().is_empty()
    {
        return Err(ParseError::InvalidField {
            field: "task_code",
            value: notification.task_code.to_string(),
        });
    }
    Ok(())
}
