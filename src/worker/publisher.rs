//! Handing messages back to the queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::messages::QueueMessage;

/// Errors from publishing a message.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot encode message: {0}")]
    Encode(#[from] serde_json::Error),

    /// The queue refused the message.
    #[error("queue rejected message: {0}")]
    Rejected(String),
}

/// Puts messages on the notification queue.
///
/// Implementations honor [`QueueMessage::delay_seconds`] as the message's
/// visibility delay.
pub trait Publisher: Send + Sync {
    fn publish(
        &self,
        message: &QueueMessage,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

impl<T: Publisher> Publisher for Arc<T> {
    fn publish(
        &self,
        message: &QueueMessage,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        (**self).publish(message)
    }
}

/// Logs each message as JSON instead of publishing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPublisher;

impl Publisher for LoggingPublisher {
    fn publish(
        &self,
        message: &QueueMessage,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        let encoded = serde_json::to_string(message);
        let message_id = message.message_id().clone();
        let delay = Duration::from_secs(message.delay_seconds());
        async move {
            let body = encoded?;
            info!(%message_id, delay_secs = delay.as_secs(), %body, "published message");
            Ok(())
        }
    }
}
