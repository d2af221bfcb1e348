//! Queue consumer: admission, fan-out and verdicts.
//!
//! # Message Handling Flow
//!
//! 1. Parse the body; an unparseable message is skipped (acknowledged)
//! 2. Claim the message's idempotency marker; a completed duplicate is
//!    acknowledged, an in-flight duplicate is retried
//! 3. Handle the message by type, producing one [`Disposition`] per task
//! 4. Aggregate: any `Fatal` wins, then any `Retry`, else the message is
//!    acknowledged
//! 5. Mark the marker `completed` if the message was acknowledged, release
//!    it if it will be redelivered
//!
//! Batch messages fan out to one task per user. Each task is guarded by a
//! scheduling lock on its resource key so that two workers holding
//! different messages for the same user never deliver concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{
    CacheError, DEFAULT_COMPLETED_TTL, DEFAULT_LOCK_TTL, DEFAULT_PROCESSING_TTL, IdempotencyGuard,
    KvCache, MessageAdmission, SchedulingLock,
};
use crate::delivery::{Disposition, TaskEngine};
use crate::dispatch::Dispatcher;
use crate::messages::{
    CheckInReminderMessage, CheckInTimeoutMessage, JourneyTimeoutMessage, NotificationMessage,
    QueueMessage, parse_queue_message,
};
use crate::reconcile::{ReminderReconciler, distinct_users, republish_messages};
use crate::templates::{MessageKind, TemplateError};
use crate::types::{Channel, NewTask, TaskCategory, TaskCode, UserId};

use super::backoff::RetryConfig;
use super::message::{Inbound, WorkerMessage};
use super::publisher::Publisher;

/// Default interval between lease sweeps.
const DEFAULT_RECLAIM_INTERVAL_SECS: u64 = 60;

/// Errors that stop a single task from being created.
#[derive(Debug, Error)]
enum FanOutError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("cannot build payload: {0}")]
    Payload(#[from] TemplateError),

    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// What the queue should do with a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Handled; acknowledge.
    Ack,
    /// Cannot succeed; acknowledge without retrying.
    Skip,
    /// Redeliver after `delay`.
    Retry { delay: Duration },
    /// Acknowledge; an operator alert was raised.
    Fatal,
}

impl Verdict {
    /// Returns true if the message should be removed from the queue.
    pub fn acknowledges(&self) -> bool {
        !matches!(self, Verdict::Retry { .. })
    }
}

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long an in-flight idempotency marker lives.
    pub idempotency_processing_ttl: Duration,

    /// How long a completed marker suppresses duplicates.
    pub idempotency_completed_ttl: Duration,

    /// Lifetime of a per-task scheduling lock.
    pub lock_ttl: Duration,

    /// Redelivery backoff for `Retry` verdicts.
    pub retry: RetryConfig,

    /// Interval between lease sweeps in [`NotificationWorker::run`].
    pub reclaim_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            idempotency_processing_ttl: DEFAULT_PROCESSING_TTL,
            idempotency_completed_ttl: DEFAULT_COMPLETED_TTL,
            lock_ttl: DEFAULT_LOCK_TTL,
            retry: RetryConfig::DEFAULT,
            reclaim_interval: Duration::from_secs(DEFAULT_RECLAIM_INTERVAL_SECS),
        }
    }
}

/// A task to create and deliver on behalf of a batch message.
struct FanOut {
    /// Scheduling lock resource key.
    resource: String,
    task_code: TaskCode,
    user_id: UserId,
    category: TaskCategory,
    kind: MessageKind,
}

/// Consumes queue messages and drives them through the task engine.
pub struct NotificationWorker<C, D, P> {
    engine: TaskEngine<D>,
    idempotency: IdempotencyGuard<C>,
    lock: SchedulingLock<C>,
    reconciler: ReminderReconciler<C>,
    publisher: P,
    config: WorkerConfig,
}

impl<C, D, P> NotificationWorker<C, D, P>
where
    C: KvCache,
    D: Dispatcher,
    P: Publisher,
{
    pub fn new(engine: TaskEngine<D>, cache: Arc<C>, publisher: P, config: WorkerConfig) -> Self {
        NotificationWorker {
            engine,
            idempotency: IdempotencyGuard::new(
                Arc::clone(&cache),
                config.idempotency_processing_ttl,
                config.idempotency_completed_ttl,
            ),
            lock: SchedulingLock::new(Arc::clone(&cache), config.lock_ttl),
            reconciler: ReminderReconciler::new(cache),
            publisher,
            config,
        }
    }

    pub fn engine(&self) -> &TaskEngine<D> {
        &self.engine
    }

    /// Handles one delivery of a queue message.
    ///
    /// `attempt` is the queue's delivery count for this message, starting
    /// at 1; it sets the redelivery delay of a `Retry` verdict.
    #[instrument(skip(self, body))]
    pub async fn handle(&self, body: &[u8], attempt: u32) -> Verdict {
        let message = match parse_queue_message(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping unparseable message");
                return Verdict::Skip;
            }
        };
        let message_id = message.message_id().clone();

        match self.idempotency.begin(&message_id).await {
            Ok(MessageAdmission::Acquired) => {}
            Ok(MessageAdmission::Completed) => {
                debug!(%message_id, "duplicate of a completed message");
                return Verdict::Ack;
            }
            Ok(MessageAdmission::InProgress) => {
                debug!(%message_id, "message is being handled elsewhere");
                return self.retry(attempt);
            }
            Err(e) => {
                warn!(%message_id, error = %e, "idempotency check failed");
                return self.retry(attempt);
            }
        }

        let disposition = self.process(&message).await;
        let verdict = match disposition {
            Disposition::Ack => Verdict::Ack,
            Disposition::Skip => Verdict::Skip,
            Disposition::Retry => self.retry(attempt),
            Disposition::Fatal => Verdict::Fatal,
        };

        let marker = if verdict.acknowledges() {
            self.idempotency.complete(&message_id).await
        } else {
            self.idempotency.release(&message_id).await
        };
        if let Err(e) = marker {
            warn!(%message_id, error = %e, "could not update idempotency marker");
        }

        info!(%message_id, kind = message.kind(), ?verdict, "message handled");
        verdict
    }

    fn retry(&self, attempt: u32) -> Verdict {
        Verdict::Retry {
            delay: self.config.retry.delay_for_attempt(attempt),
        }
    }

    async fn process(&self, message: &QueueMessage) -> Disposition {
        match message {
            QueueMessage::CheckInReminder(m) => self.process_reminders(m).await,
            QueueMessage::CheckInTimeout(m) => self.process_timeouts(m).await,
            QueueMessage::JourneyTimeout(m) => self.process_journey(m).await,
            QueueMessage::Notification(m) => self.process_notification(m).await,
        }
    }

    async fn process_reminders(&self, message: &CheckInReminderMessage) -> Disposition {
        let reconciliation = match self.reconciler.reconcile(message).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "cannot load live settings");
                return Disposition::Retry;
            }
        };
        let outcome = &reconciliation.outcome;
        if !outcome.skip.is_empty() {
            debug!(users = ?outcome.skip, "skipping users with newer settings");
        }

        let mut dispositions = Vec::with_capacity(outcome.len());
        for user_id in &outcome.process_now {
            let snapshot = message.user_settings.get(user_id);
            let live = reconciliation.live.get(user_id);
            let deadline = live
                .map(|e| e.deadline.clone())
                .or_else(|| snapshot.map(|s| s.deadline.clone()))
                .unwrap_or_default();
            let remind_at = live
                .map(|e| e.remind_at.clone())
                .or_else(|| snapshot.map(|s| s.remind_at.clone()));
            let fan_out = FanOut {
                resource: format!("check_in_reminder:{}:{}", message.check_in_date, user_id),
                task_code: TaskCode::check_in_reminder(message.check_in_date, *user_id),
                user_id: *user_id,
                category: TaskCategory::CheckInReminder,
                kind: MessageKind::CheckInReminder {
                    check_in_date: message.check_in_date,
                    remind_at,
                    deadline,
                },
            };
            dispositions.push(self.fan_out(fan_out).await);
        }

        let republish = republish_messages(message, outcome, &reconciliation.live, Utc::now());
        for fresh in republish {
            let users = fresh.user_ids.len();
            let delay_seconds = fresh.delay_seconds;
            match self
                .publisher
                .publish(&QueueMessage::CheckInReminder(fresh))
                .await
            {
                Ok(()) => {
                    info!(users, delay_seconds, "republished users with moved reminders");
                    dispositions.push(Disposition::Ack);
                }
                Err(e) => {
                    warn!(error = %e, users, "republish failed");
                    dispositions.push(Disposition::Retry);
                }
            }
        }

        aggregate(dispositions)
    }

    async fn process_timeouts(&self, message: &CheckInTimeoutMessage) -> Disposition {
        let mut dispositions = Vec::with_capacity(message.user_ids.len());
        for user_id in distinct_users(&message.user_ids) {
            let fan_out = FanOut {
                resource: format!("check_in_timeout:{}:{}", message.check_in_date, user_id),
                task_code: TaskCode::check_in_timeout(message.check_in_date, user_id),
                user_id,
                category: TaskCategory::CheckInReminder,
                kind: MessageKind::CheckInTimeout {
                    check_in_date: message.check_in_date,
                    deadline: None,
                },
            };
            dispositions.push(self.fan_out(fan_out).await);
        }
        aggregate(dispositions)
    }

    async fn process_journey(&self, message: &JourneyTimeoutMessage) -> Disposition {
        self.fan_out(FanOut {
            resource: format!("journey_timeout:{}", message.journey_id),
            task_code: TaskCode::journey_timeout(message.journey_id),
            user_id: message.user_id,
            category: TaskCategory::JourneyReminder,
            kind: MessageKind::JourneyTimeout {
                journey_id: message.journey_id,
                journey_title: message.journey_title.clone(),
                expected_return: message.expected_return.clone(),
            },
        })
        .await
    }

    async fn process_notification(&self, message: &NotificationMessage) -> Disposition {
        let payload = match &message.payload {
            Value::Null => None,
            payload => Some(payload),
        };
        self.engine
            .deliver(&message.task_code, message.user_id, payload)
            .await
            .disposition()
    }

    /// Creates (or finds) one task and delivers it under its scheduling lock.
    async fn fan_out(&self, fan_out: FanOut) -> Disposition {
        match self.try_fan_out(&fan_out).await {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!(task = %fan_out.task_code, error = %e, "cannot start task");
                match e {
                    FanOutError::Payload(_) => Disposition::Skip,
                    FanOutError::Cache(_) | FanOutError::Store(_) => Disposition::Retry,
                }
            }
        }
    }

    async fn try_fan_out(&self, fan_out: &FanOut) -> Result<Disposition, FanOutError> {
        let Some(guard) = self.lock.try_acquire(&fan_out.resource).await? else {
            debug!(resource = %fan_out.resource, "task is locked by another worker");
            return Ok(Disposition::Retry);
        };

        let result = self.deliver_locked(fan_out).await;

        if let Err(e) = self.lock.release(guard).await {
            warn!(resource = %fan_out.resource, error = %e, "could not release lock");
        }
        result
    }

    async fn deliver_locked(&self, fan_out: &FanOut) -> Result<Disposition, FanOutError> {
        let payload = fan_out
            .kind
            .to_payload()
            .map_err(TemplateError::InvalidPayload)?;
        let task = self.engine.enqueue(&NewTask {
            task_code: fan_out.task_code.clone(),
            user_id: fan_out.user_id,
            category: fan_out.category,
            channel: Channel::Sms,
            payload,
            scheduled_at: Utc::now(),
        })?;
        Ok(self
            .engine
            .deliver(&task.task_code, task.user_id, None)
            .await
            .disposition())
    }

    fn reclaim(&self) {
        match self.engine.reclaim_expired() {
            Ok(0) => {}
            Ok(count) => info!(count, "reclaimed expired leases"),
            Err(e) => error!(error = %e, "lease sweep failed"),
        }
    }

    /// Runs the worker event loop.
    ///
    /// Handles deliveries one at a time and sweeps expired leases every
    /// `reclaim_interval`, until shutdown is requested or every sender is
    /// dropped.
    #[instrument(skip_all)]
    pub async fn run(self, mut rx: mpsc::Receiver<WorkerMessage>, shutdown: CancellationToken) {
        info!("Worker event loop started");
        let mut sweep = tokio::time::interval(self.config.reclaim_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping worker");
                    break;
                }

                msg = rx.recv() => {
                    match msg {
                        Some(WorkerMessage::Delivery(inbound)) => self.handle_inbound(inbound).await,
                        Some(WorkerMessage::ReclaimLeases) => self.reclaim(),
                        Some(WorkerMessage::Shutdown) => {
                            info!("Shutdown message received");
                            break;
                        }
                        None => {
                            info!("Message channel closed");
                            break;
                        }
                    }
                }

                _ = sweep.tick() => self.reclaim(),
            }
        }

        info!("Worker event loop stopped");
    }

    async fn handle_inbound(&self, inbound: Inbound) {
        let verdict = self.handle(&inbound.body, inbound.attempt).await;
        if let Some(reply) = inbound.reply
            && reply.send(verdict).is_err()
        {
            debug!("verdict receiver dropped");
        }
    }
}

/// Folds per-task dispositions into one: `Fatal` over `Retry` over
/// acknowledgement.
fn aggregate(dispositions: Vec<Disposition>) -> Disposition {
    match dispositions.into_iter().max() {
        Some(Disposition::Skip) | Some(Disposition::Ack) | None => Disposition::Ack,
        Some(other) => other,
    }
}
