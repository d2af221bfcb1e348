//! Queue-message admission by `message_id`.
//!
//! The queue delivers at least once, so the same message may reach several
//! workers. Before doing any work a worker claims `idempotency:<message_id>`
//! with SET NX; the marker holds `processing` while the claim is live and
//! `completed` once the message has been fully handled.
//!
//! ```text
//! absent ──begin──▶ processing ──complete──▶ completed
//!                        │
//!                        └──release──▶ absent   (handler asked for a retry)
//! ```
//!
//! Both states are TTL-bound. A `processing` marker left behind by a crashed
//! worker expires, after which redelivery is admitted again.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::types::MessageId;

use super::{KvCache, Result};

const PROCESSING: &str = "processing";
const COMPLETED: &str = "completed";

/// Default lifetime of a `processing` marker.
pub const DEFAULT_PROCESSING_TTL: Duration = Duration::from_secs(600);

/// Default lifetime of a `completed` marker.
pub const DEFAULT_COMPLETED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The outcome of trying to admit a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageAdmission {
    /// This worker owns the message and must finish with
    /// [`IdempotencyGuard::complete`] or [`IdempotencyGuard::release`].
    Acquired,
    /// Another worker is handling the message right now.
    InProgress,
    /// The message was already handled.
    Completed,
}

fn key(message_id: &MessageId) -> String {
    format!("idempotency:{}", message_id)
}

/// Claims and settles idempotency markers.
#[derive(Debug)]
pub struct IdempotencyGuard<C> {
    cache: Arc<C>,
    processing_ttl: Duration,
    completed_ttl: Duration,
}

impl<C> Clone for IdempotencyGuard<C> {
    fn clone(&self) -> Self {
        IdempotencyGuard {
            cache: Arc::clone(&self.cache),
            processing_ttl: self.processing_ttl,
            completed_ttl: self.completed_ttl,
        }
    }
}

impl<C: KvCache> IdempotencyGuard<C> {
    pub fn new(cache: Arc<C>, processing_ttl: Duration, completed_ttl: Duration) -> Self {
        IdempotencyGuard {
            cache,
            processing_ttl,
            completed_ttl,
        }
    }

    /// Tries to claim `message_id`.
    pub async fn begin(&self, message_id: &MessageId) -> Result<MessageAdmission> {
        let key = key(message_id);
        // Two rounds: the marker may expire between a failed SET NX and the GET.
        for _ in 0..2 {
            if self
                .cache
                .set_if_absent(&key, PROCESSING, self.processing_ttl)
                .await?
            {
                debug!(message_id = %message_id, "admitted message");
                return Ok(MessageAdmission::Acquired);
            }
            match self.cache.get(&key).await?.as_deref() {
                Some(COMPLETED) => return Ok(MessageAdmission::Completed),
                Some(_) => return Ok(MessageAdmission::InProgress),
                None => continue,
            }
        }
        Ok(MessageAdmission::InProgress)
    }

    /// Marks a claimed message as fully handled.
    pub async fn complete(&self, message_id: &MessageId) -> Result<()> {
        self.cache
            .set(&key(message_id), COMPLETED, self.completed_ttl)
            .await
    }

    /// Gives up a claim so that redelivery is admitted.
    ///
    /// Leaves a `completed` marker untouched.
    pub async fn release(&self, message_id: &MessageId) -> Result<()> {
        self.cache
            .delete_if_equals(&key(message_id), PROCESSING)
            .await?;
        Ok(())
    }
}
