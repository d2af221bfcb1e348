//! Core domain types for the notification settlement pipeline.
//!
//! This module contains the fundamental types shared by the ledger, the task
//! engine and the reconciliation step, designed to encode invariants via the
//! type system.

pub mod attempt;
pub mod ids;
pub mod ledger;
pub mod settings;
pub mod task;
pub mod user;

// Re-export commonly used types at the module level
pub use attempt::{AttemptStatus, ContactAttempt, ContactPriority};
pub use ids::{BatchId, JourneyId, MessageId, TaskCode, UserId};
pub use ledger::{Channel, GrantReason, LedgerEntry, LedgerReason, TransactionType};
pub use settings::{SettingsSnapshot, UserSettingsCacheEntry};
pub use task::{Admission, NewTask, NotificationTask, TaskCategory, TaskFailure, TaskStatus};
pub use user::UserContact;
