//! Notification task engine.
//!
//! Turns a queued notification into exactly one charged send, no matter how
//! many times the queue delivers it.
//!
//! # Task lifecycle
//!
//! ```text
//! pending ──claim──▶ processing ──settle──▶ success
//!    ▲                   │  │
//!    │   lease expired   │  └──fail──▶ failed ──(retryable, budget left)──▶ processing
//!    └───(reclaim sweep)─┘
//! ```
//!
//! `processing` is a lease: the claiming worker owns the task until
//! `lease_until`. A delivery that finds a live lease backs off; one that
//! finds an expired lease takes the task over, refunding any reservation
//! the previous owner left behind.
//!
//! # Dispositions
//!
//! Every delivery ends in a [`DeliveryOutcome`], which maps to exactly one
//! [`Disposition`] telling the queue consumer what to do with the message:
//!
//! | Outcome | Disposition |
//! |---|---|
//! | delivered, already processed | `Ack` |
//! | business or configuration failure | `Skip` |
//! | contention, transient provider or store failure | `Retry` |
//! | sent but not settled | `Fatal` |
//!
//! `Skip` and `Fatal` both acknowledge the message; `Fatal` also raises a
//! [`SettlementAlert`].

mod engine;
mod observer;


use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::contacts::CipherError;
use crate::dispatch::DispatchError;
use crate::store::StoreError;
use crate::templates::{TemplateConfig, TemplateError};
use crate::types::{Channel, TaskCode, UserId};

pub use engine::TaskEngine;
pub use observer::{DeliveryObserver, DeliveryReport, SettlementAlert, TracingObserver};

/// Default lease on a claimed task.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// Default number of claims a task may receive.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What the queue consumer should do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Disposition {
    /// Handled; acknowledge.
    Ack,
    /// Cannot ever succeed; acknowledge without retrying.
    Skip,
    /// May succeed later; let the queue redeliver.
    Retry,
    /// Sent but not settled; acknowledge and alert.
    Fatal,
}

impl Disposition {
    /// Returns true if the queue message should be acknowledged.
    pub fn acknowledges(&self) -> bool {
        !matches!(self, Disposition::Retry)
    }
}

/// Which settlement step failed after a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStage {
    /// Confirming the charge after a successful send.
    Confirm,
    /// Refunding the reservation after a failed send.
    Refund,
}

/// Why a delivery did not complete.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("unknown task {0}")]
    UnknownTask(TaskCode),

    #[error("task {task_code} is terminal: {reason}")]
    TaskTerminal { task_code: TaskCode, reason: String },

    #[error("task {task_code} is being processed (lease until {lease_until})")]
    TaskBeingProcessed {
        task_code: TaskCode,
        lease_until: DateTime<Utc>,
    },

    #[error("task {task_code} belongs to user {owner}, not {requested}")]
    TaskUserMismatch {
        task_code: TaskCode,
        owner: UserId,
        requested: UserId,
    },

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("contact number for user {user_id} is unavailable: {source}")]
    ContactUnavailable {
        user_id: UserId,
        #[source]
        source: CipherError,
    },

    #[error("insufficient {channel} quota for user {user_id}: balance {balance}, requested {requested}")]
    QuotaInsufficient {
        user_id: UserId,
        channel: Channel,
        balance: i64,
        requested: i64,
    },

    #[error("invalid {channel} price: {amount}")]
    InvalidPrice { channel: Channel, amount: i64 },

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("transient provider failure: {0}")]
    ProviderTransient(DispatchError),

    #[error("provider rejected message: {0}")]
    ProviderRejected(DispatchError),

    #[error("settlement inconsistency for task {task_code} at {stage:?}: {detail}")]
    SettlementInconsistency {
        task_code: TaskCode,
        stage: SettlementStage,
        detail: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DeliveryError {
    /// The disposition this error maps to.
    pub fn disposition(&self) -> Disposition {
        match self {
            DeliveryError::TaskBeingProcessed { .. }
            | DeliveryError::ProviderTransient(_)
            | DeliveryError::Store(_) => Disposition::Retry,

            DeliveryError::SettlementInconsistency { .. } => Disposition::Fatal,

            DeliveryError::UnknownTask(_)
            | DeliveryError::TaskTerminal { .. }
            | DeliveryError::TaskUserMismatch { .. }
            | DeliveryError::UserNotFound(_)
            | DeliveryError::ContactUnavailable { .. }
            | DeliveryError::QuotaInsufficient { .. }
            | DeliveryError::InvalidPrice { .. }
            | DeliveryError::Template(_)
            | DeliveryError::ProviderRejected(_) => Disposition::Skip,
        }
    }
}

/// The result of one [`TaskEngine::deliver`] call.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Sent and settled.
    Delivered(DeliveryReport),
    /// The task had already succeeded; nothing was done.
    AlreadyProcessed,
    /// The delivery stopped; see the error for why.
    Failed(DeliveryError),
}

impl DeliveryOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            DeliveryOutcome::Delivered(_) | DeliveryOutcome::AlreadyProcessed => Disposition::Ack,
            DeliveryOutcome::Failed(err) => err.disposition(),
        }
    }

    /// The error, if the delivery failed.
    pub fn error(&self) -> Option<&DeliveryError> {
        match self {
            DeliveryOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Unit prices per channel, in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pricing {
    pub sms_cents: i64,
    pub voice_cents: i64,
}

impl Pricing {
    pub const DEFAULT: Pricing = Pricing {
        sms_cents: 5,
        voice_cents: 20,
    };

    pub fn for_channel(&self, channel: Channel) -> i64 {
        match channel {
            Channel::Sms => self.sms_cents,
            Channel::Voice => self.voice_cents,
        }
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Task engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub pricing: Pricing,
    pub templates: TemplateConfig,
    /// How long a claim is held before another worker may take over.
    pub lease: Duration,
    /// Total claims a task may receive, including the first.
    pub max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            pricing: Pricing::DEFAULT,
            templates: TemplateConfig::default(),
            lease: DEFAULT_LEASE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}
