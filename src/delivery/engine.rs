//! The task engine itself.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::contacts::PhoneCipher;
use crate::dispatch::{DispatchError, Dispatcher, OutboundSms, ProviderResponse};
use crate::ledger::{QuotaError, quota};
use crate::store::{SqliteStore, StoreError, attempts, tasks, users};
use crate::templates::{self, ResolvedMessage};
use crate::types::{
    Admission, Channel, ContactAttempt, NewTask, NotificationTask, TaskCode, TaskFailure,
    TaskStatus, UserContact, UserId,
};

use super::{
    DeliveryError, DeliveryObserver, DeliveryOutcome, DeliveryReport, Disposition, EngineConfig,
    SettlementAlert, SettlementStage,
};

type Result<T> = std::result::Result<T, DeliveryError>;

/// A claimed task and the claim this delivery holds on it.
///
/// Every write after the claim is fenced by `claim_id`, so a delivery whose
/// lease expired cannot overwrite the work of whoever took the task over.
struct Claimed {
    task: NotificationTask,
    claim_id: String,
    started: Instant,
}

enum ClaimResult {
    Claimed(Claimed),
    AlreadySucceeded,
}

fn from_quota(err: QuotaError, channel: Channel) -> DeliveryError {
    match err {
        QuotaError::Insufficient {
            user_id,
            channel,
            balance,
            requested,
        } => DeliveryError::QuotaInsufficient {
            user_id,
            channel,
            balance,
            requested,
        },
        QuotaError::InvalidAmount(amount) => DeliveryError::InvalidPrice { channel, amount },
        QuotaError::Store(e) => DeliveryError::Store(e),
    }
}

fn lease_until(now: DateTime<Utc>, lease: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Delivers notification tasks and settles their cost.
///
/// The engine holds no per-task state; every decision is made from the task
/// row inside a write transaction, so any number of engines (in any number
/// of processes) may share one database.
pub struct TaskEngine<D> {
    store: SqliteStore,
    dispatcher: D,
    cipher: PhoneCipher,
    config: EngineConfig,
    observer: Arc<dyn DeliveryObserver>,
}

impl<D> std::fmt::Debug for TaskEngine<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<D: Dispatcher> TaskEngine<D> {
    pub fn new(
        store: SqliteStore,
        dispatcher: D,
        cipher: PhoneCipher,
        config: EngineConfig,
        observer: Arc<dyn DeliveryObserver>,
    ) -> Self {
        TaskEngine {
            store,
            dispatcher,
            cipher,
            config,
            observer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates a task in `pending`, or returns the existing task with the
    /// same code unchanged.
    #[instrument(skip_all, fields(task = %task.task_code, user = %task.user_id))]
    pub fn enqueue(&self, task: &NewTask) -> std::result::Result<NotificationTask, StoreError> {
        let now = Utc::now();
        self.store.write(|tx| {
            if tasks::insert_if_absent(tx, task, now)? {
                debug!("task created");
            } else {
                debug!("task already exists");
            }
            tasks::find_by_code(tx, &task.task_code)?
                .ok_or(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
        })
    }

    /// Reads a task.
    pub fn task(&self, code: &TaskCode) -> std::result::Result<Option<NotificationTask>, StoreError> {
        self.store.read(|conn| tasks::find_by_code(conn, code))
    }

    /// Records an escalation attempt against one of a task's contacts.
    pub fn record_contact_attempt(
        &self,
        attempt: &ContactAttempt,
    ) -> std::result::Result<i64, StoreError> {
        self.store.write(|tx| attempts::insert(tx, attempt))
    }

    /// Returns every `processing` task whose lease has expired to `pending`,
    /// refunding held reservations. Returns how many tasks were reclaimed.
    #[instrument(skip(self))]
    pub fn reclaim_expired(&self) -> std::result::Result<usize, QuotaError> {
        let now = Utc::now();
        let reclaimed = self.store.write(|tx| -> std::result::Result<usize, QuotaError> {
            let expired = tasks::expired_leases(tx, now)?;
            for task in &expired {
                if task.deducted && task.cost_cents > 0 {
                    quota::refund_in(
                        tx,
                        task.user_id,
                        task.channel,
                        task.cost_cents,
                        Some(&task.task_code),
                    )?;
                    tasks::drop_reservation(tx, &task.task_code, now)?;
                }
                tasks::release(tx, &task.task_code, now)?;
                warn!(task = %task.task_code, refunded = task.deducted, "reclaimed expired lease");
            }
            Ok(expired.len())
        })?;
        if reclaimed > 0 {
            info!(reclaimed, "lease sweep finished");
        }
        Ok(reclaimed)
    }

    /// Delivers a task.
    ///
    /// `payload` is the message's copy of the task payload; when `None`, the
    /// payload stored with the task is used.
    #[instrument(skip_all, fields(task = %task_code, user = %user_id))]
    pub async fn deliver(
        &self,
        task_code: &TaskCode,
        user_id: UserId,
        payload: Option<&Value>,
    ) -> DeliveryOutcome {
        let outcome = match self.try_deliver(task_code, user_id, payload).await {
            Ok(Some(report)) => {
                self.observer.report(&report);
                DeliveryOutcome::Delivered(report)
            }
            Ok(None) => {
                debug!("task already succeeded; nothing to do");
                DeliveryOutcome::AlreadyProcessed
            }
            Err(err) => DeliveryOutcome::Failed(err),
        };

        if let DeliveryOutcome::Failed(err) = &outcome {
            match err.disposition() {
                Disposition::Skip => info!(error = %err, "delivery skipped"),
                Disposition::Retry => warn!(error = %err, "delivery will be retried"),
                Disposition::Fatal => error!(error = %err, "delivery failed fatally"),
                Disposition::Ack => {}
            }
        }
        outcome
    }

    async fn try_deliver(
        &self,
        task_code: &TaskCode,
        user_id: UserId,
        payload: Option<&Value>,
    ) -> Result<Option<DeliveryReport>> {
        let claimed = match self.claim(task_code, user_id)? {
            ClaimResult::Claimed(claimed) => claimed,
            ClaimResult::AlreadySucceeded => return Ok(None),
        };
        let task = &claimed.task;

        let contact = self.resolve_contact(&claimed)?;
        let phone = match self.cipher.decrypt(&contact.phone_cipher) {
            Ok(phone) => phone,
            Err(source) => {
                let err = DeliveryError::ContactUnavailable { user_id, source };
                let failure = TaskFailure::permanent("contact_unavailable", err.to_string());
                self.fail(&claimed, failure, None)?;
                return Err(err);
            }
        };

        let price = self.reserve(&claimed)?;

        let payload = payload.unwrap_or(&task.payload);
        let message = match templates::resolve(payload, &contact.nickname, &self.config.templates)
        {
            Ok(message) => message,
            Err(err) => {
                let failure = TaskFailure::permanent("template_error", err.to_string());
                self.fail(&claimed, failure, Some(price))?;
                return Err(err.into());
            }
        };

        let response = self.dispatch(task, phone, &message).await;
        match response {
            Ok(response) => self.settle(&claimed, price, &message, response).map(Some),
            Err(err) => Err(self.settle_failed_send(&claimed, price, err)),
        }
    }

    /// Runs the idempotency guard and claims the task.
    fn claim(&self, task_code: &TaskCode, user_id: UserId) -> Result<ClaimResult> {
        let now = Utc::now();
        let lease_until = lease_until(now, self.config.lease);
        let claim_id = Uuid::new_v4().to_string();
        let max_attempts = self.config.max_attempts;

        self.store.write(|tx| -> Result<ClaimResult> {
            let task = tasks::find_by_code(tx, task_code)?
                .ok_or_else(|| DeliveryError::UnknownTask(task_code.clone()))?;

            match task.admission(user_id, now, max_attempts) {
                Admission::AlreadySucceeded => Ok(ClaimResult::AlreadySucceeded),
                Admission::Busy { lease_until } => Err(DeliveryError::TaskBeingProcessed {
                    task_code: task_code.clone(),
                    lease_until,
                }),
                Admission::Terminal { reason } => Err(DeliveryError::TaskTerminal {
                    task_code: task_code.clone(),
                    reason,
                }),
                Admission::WrongUser { owner } => Err(DeliveryError::TaskUserMismatch {
                    task_code: task_code.clone(),
                    owner,
                    requested: user_id,
                }),
                Admission::Claim { reclaim } => {
                    // An expired lease may still hold the previous owner's reservation.
                    if task.status == TaskStatus::Processing && task.deducted && task.cost_cents > 0 {
                        quota::refund_in(
                            tx,
                            task.user_id,
                            task.channel,
                            task.cost_cents,
                            Some(task_code),
                        )
                        .map_err(|e| from_quota(e, task.channel))?;
                        tasks::drop_reservation(tx, task_code, now)?;
                        warn!(refunded = task.cost_cents, "took over expired lease");
                    }
                    tasks::claim(tx, task_code, &claim_id, lease_until, reclaim, now)?;
                    debug!(reclaim, %lease_until, %claim_id, "claimed task");

                    let mut task = task;
                    task.status = TaskStatus::Processing;
                    task.deducted = false;
                    task.lease_until = Some(lease_until);
                    Ok(ClaimResult::Claimed(Claimed {
                        task,
                        claim_id: claim_id.clone(),
                        started: Instant::now(),
                    }))
                }
            }
        })
    }

    fn resolve_contact(&self, claimed: &Claimed) -> Result<UserContact> {
        let task = &claimed.task;
        match self.store.read(|conn| users::find(conn, task.user_id))? {
            Some(contact) => Ok(contact),
            None => {
                self.fail(
                    claimed,
                    TaskFailure::permanent("user_not_found", format!("user {} not found", task.user_id)),
                    None,
                )?;
                Err(DeliveryError::UserNotFound(task.user_id))
            }
        }
    }

    /// Reserves the channel price and records the reservation on the task.
    fn reserve(&self, claimed: &Claimed) -> Result<i64> {
        let task = &claimed.task;
        let price = self.config.pricing.for_channel(task.channel);
        let now = Utc::now();
        let reserved = self.store.write(|tx| -> Result<()> {
            quota::pre_deduct_in(tx, task.user_id, task.channel, price, Some(&task.task_code))
                .map_err(|e| from_quota(e, task.channel))?;
            tasks::set_reservation(tx, &task.task_code, &claimed.claim_id, Some(price), now)?;
            Ok(())
        });

        match reserved {
            Ok(()) => {
                debug!(price, "reserved quota");
                Ok(price)
            }
            Err(err @ DeliveryError::QuotaInsufficient { .. }) => {
                let failure = TaskFailure::permanent("quota_insufficient", err.to_string());
                self.fail(claimed, failure, None)?;
                Err(err)
            }
            Err(err @ DeliveryError::InvalidPrice { .. }) => {
                let failure = TaskFailure::permanent("invalid_price", err.to_string());
                self.fail(claimed, failure, None)?;
                Err(err)
            }
            // The reservation rolled back (or the claim was lost); a
            // redelivery retries.
            Err(err) => Err(err),
        }
    }

    async fn dispatch(
        &self,
        task: &NotificationTask,
        phone: String,
        message: &ResolvedMessage,
    ) -> std::result::Result<ProviderResponse, DispatchError> {
        let sms = OutboundSms {
            channel: task.channel,
            phone,
            signature: message.signature.clone(),
            template_id: message.template_id.clone(),
            template_params: message.params.clone(),
        };
        self.dispatcher
            .send(&sms)
            .await
            .map_err(DispatchError::from_transport)
            .and_then(ProviderResponse::into_result)
    }

    /// Confirms the charge and marks the task `success`.
    fn settle(
        &self,
        claimed: &Claimed,
        price: i64,
        message: &ResolvedMessage,
        response: ProviderResponse,
    ) -> Result<DeliveryReport> {
        let task = &claimed.task;
        let now = Utc::now();
        let settled = self.store.write(|tx| -> Result<()> {
            quota::confirm_in(tx, task.user_id, task.channel, price, Some(&task.task_code))
                .map_err(|e| from_quota(e, task.channel))?;
            tasks::mark_success(tx, &task.task_code, &claimed.claim_id, price, now)?;
            Ok(())
        });

        if let Err(err) = settled {
            return Err(self.settlement_inconsistency(claimed, SettlementStage::Confirm, err));
        }

        Ok(DeliveryReport {
            task_code: task.task_code.clone(),
            user_id: task.user_id,
            channel: task.channel,
            kind: message.kind.name(),
            template_id: message.template_id.clone(),
            provider: self.dispatcher.provider().to_string(),
            provider_message_id: response.message_id,
            cost_cents: price,
            duration: claimed.started.elapsed(),
        })
    }

    /// Refunds after a failed send and classifies the failure.
    fn settle_failed_send(
        &self,
        claimed: &Claimed,
        price: i64,
        err: DispatchError,
    ) -> DeliveryError {
        let failure = TaskFailure {
            code: err.failure_code().to_string(),
            message: err.message.clone(),
            retryable: err.is_retriable(),
        };
        if let Err(cause) = self.fail(claimed, failure, Some(price)) {
            return self.settlement_inconsistency(claimed, SettlementStage::Refund, cause);
        }
        if err.is_retriable() {
            DeliveryError::ProviderTransient(err)
        } else {
            DeliveryError::ProviderRejected(err)
        }
    }

    /// Marks a task `failed`, refunding `reserved` in the same transaction.
    ///
    /// If the claim was lost nothing is written: whoever took the task over
    /// already refunded this claim's reservation.
    fn fail(&self, claimed: &Claimed, failure: TaskFailure, reserved: Option<i64>) -> Result<()> {
        let task = &claimed.task;
        let claim_id = claimed.claim_id.as_str();
        let now = Utc::now();
        let code = &task.task_code;
        self.store.write(|tx| -> Result<()> {
            if let Some(amount) = reserved {
                quota::refund_in(tx, task.user_id, task.channel, amount, Some(code))
                    .map_err(|e| from_quota(e, task.channel))?;
                tasks::set_reservation(tx, code, claim_id, None, now)?;
            }
            tasks::mark_failed(tx, code, claim_id, &failure, now)?;
            Ok(())
        })?;
        debug!(code = %failure.code, retryable = failure.retryable, "task failed");
        Ok(())
    }

    /// Raises an alert and quarantines the task so redelivery cannot send again.
    ///
    /// A lost claim is not quarantined; the task belongs to its new owner.
    fn settlement_inconsistency(
        &self,
        claimed: &Claimed,
        stage: SettlementStage,
        cause: DeliveryError,
    ) -> DeliveryError {
        let task = &claimed.task;
        let detail = cause.to_string();
        self.observer.alert(&SettlementAlert {
            task_code: task.task_code.clone(),
            user_id: task.user_id,
            channel: task.channel,
            stage,
            detail: detail.clone(),
        });

        let quarantine = TaskFailure::permanent("settlement_inconsistency", detail.clone());
        let now = Utc::now();
        match self.store.write(|tx| {
            tasks::mark_failed(tx, &task.task_code, &claimed.claim_id, &quarantine, now)
        }) {
            Ok(()) => {}
            Err(StoreError::ClaimLost(_)) => {
                warn!(task = %task.task_code, "claim lost before settlement; left to its new owner");
            }
            Err(err) => {
                error!(
                    task = %task.task_code,
                    error = %err,
                    "could not quarantine task; it may be sent again once its lease expires"
                );
            }
        }

        DeliveryError::SettlementInconsistency {
            task_code: task.task_code.clone(),
            stage,
            detail,
        }
    }
}
