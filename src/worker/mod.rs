//! Queue consumer for the notification pipeline.
//!
//! Many workers consume the queue concurrently. Each worker handles one
//! message at a time, suspending only at I/O; cross-worker safety comes from
//! the idempotency marker on each `message_id`, the scheduling lock on each
//! task's resource key, and the task engine's persisted state machine.
//!
//! # Module Structure
//!
//! - [`backoff`]: redelivery delays for `Retry` verdicts
//! - `message`: worker message types for async communication
//! - `publisher`: handing messages back to the queue

pub mod backoff;
mod message;
mod publisher;
mod worker;

#[cfg(test)]
mod tests;

pub use backoff::RetryConfig;
pub use message::{Inbound, WorkerMessage};
pub use publisher::{LoggingPublisher, PublishError, Publisher};
pub use worker::{NotificationWorker, Verdict, WorkerConfig};
