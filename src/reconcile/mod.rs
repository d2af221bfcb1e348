//! Reminder scheduling reconciliation.
//!
//! The scheduler scans users ahead of time and enqueues a delayed batch
//! message carrying each user's settings as they were at scan time. By the
//! time the batch is consumed some users may have changed their settings.
//! Reconciliation compares every listed user's scan-time snapshot with the
//! live settings cache and sorts the users into three classes:
//!
//! - **process now**: settings are unchanged (or unknown); send the reminder
//! - **skip**: the user changed settings after the scan or turned reminders
//!   off; a newer schedule owns this user
//! - **republish**: the reminder time moved; hand the user back to the queue
//!   with a freshly-timed message (see [`republish_messages`])
//!
//! # Rules
//!
//! Applied in order, first match wins:
//!
//! 1. An empty batch yields an empty outcome.
//! 2. If the batch's `scheduled_at` cannot be parsed, every user is skipped.
//! 3. No live entry → process now.
//! 4. Live `updated_at` strictly after `scheduled_at` → skip.
//! 5. Reminders disabled → skip.
//! 6. `remind_at` differs from the snapshot, or there is no snapshot →
//!    republish.
//! 7. Otherwise → process now.
//!
//! A user listed more than once is classified once, in first-occurrence
//! order.

mod republish;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveTime};
use tracing::{debug, instrument, warn};

use crate::cache::{CacheError, KvCache, SettingsCache};
use crate::messages::CheckInReminderMessage;
use crate::types::{SettingsSnapshot, UserId, UserSettingsCacheEntry};

pub use republish::{parse_utc_offset, republish_messages};

/// How reconciliation classified a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub process_now: Vec<UserId>,
    pub skip: Vec<UserId>,
    pub republish: Vec<UserId>,
}

impl ReconcileOutcome {
    /// Total number of distinct users classified.
    pub fn len(&self) -> usize {
        self.process_now.len() + self.skip.len() + self.republish.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The classification of one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    ProcessNow,
    Skip,
    Republish,
}

/// Parses a settings clock time (`HH:MM:SS` or `HH:MM`).
pub(crate) fn parse_clock_time(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

fn same_clock_time(a: &str, b: &str) -> bool {
    match (parse_clock_time(a), parse_clock_time(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

fn classify(
    scheduled_at: i64,
    snapshot: Option<&SettingsSnapshot>,
    live: Option<&UserSettingsCacheEntry>,
) -> Class {
    let Some(live) = live else {
        return Class::ProcessNow;
    };
    if live.updated_at > scheduled_at || !live.daily_check_in_enabled {
        return Class::Skip;
    }
    match snapshot {
        Some(snapshot) if same_clock_time(&snapshot.remind_at, &live.remind_at) => {
            Class::ProcessNow
        }
        _ => Class::Republish,
    }
}

/// The distinct users of a batch in first-occurrence order.
pub fn distinct_users(user_ids: &[UserId]) -> Vec<UserId> {
    let mut seen = HashSet::with_capacity(user_ids.len());
    user_ids
        .iter()
        .copied()
        .filter(|user| seen.insert(*user))
        .collect()
}

/// Classifies every user of `message` against the live settings.
pub fn reconcile(
    message: &CheckInReminderMessage,
    live: &HashMap<UserId, UserSettingsCacheEntry>,
) -> ReconcileOutcome {
    let users = distinct_users(&message.user_ids);
    let mut outcome = ReconcileOutcome::default();
    if users.is_empty() {
        return outcome;
    }

    let scheduled_at = match DateTime::parse_from_rfc3339(message.scheduled_at.trim()) {
        Ok(at) => at.timestamp(),
        Err(err) => {
            warn!(
                message_id = %message.message_id,
                scheduled_at = %message.scheduled_at,
                error = %err,
                "unparseable scheduled_at; skipping whole batch"
            );
            outcome.skip = users;
            return outcome;
        }
    };

    for user in users {
        let class = classify(
            scheduled_at,
            message.user_settings.get(&user),
            live.get(&user),
        );
        match class {
            Class::ProcessNow => outcome.process_now.push(user),
            Class::Skip => outcome.skip.push(user),
            Class::Republish => outcome.republish.push(user),
        }
    }
    outcome
}

/// A reconciled batch plus the live settings it was decided on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub outcome: ReconcileOutcome,
    pub live: HashMap<UserId, UserSettingsCacheEntry>,
}

/// Reconciles reminder batches against the settings cache.
#[derive(Debug)]
pub struct ReminderReconciler<C> {
    settings: SettingsCache<C>,
}

impl<C> Clone for ReminderReconciler<C> {
    fn clone(&self) -> Self {
        ReminderReconciler {
            settings: self.settings.clone(),
        }
    }
}

impl<C: KvCache> ReminderReconciler<C> {
    pub fn new(cache: Arc<C>) -> Self {
        ReminderReconciler {
            settings: SettingsCache::new(cache),
        }
    }

    /// Loads live settings for the batch and classifies its users.
    ///
    /// Batches that rule 1 or 2 decide are classified without touching the
    /// cache.
    #[instrument(skip_all, fields(message_id = %message.message_id, users = message.user_ids.len()))]
    pub async fn reconcile(
        &self,
        message: &CheckInReminderMessage,
    ) -> Result<Reconciliation, CacheError> {
        let users = distinct_users(&message.user_ids);
        let scheduled_ok = DateTime::parse_from_rfc3339(message.scheduled_at.trim()).is_ok();
        let live = if users.is_empty() || !scheduled_ok {
            HashMap::new()
        } else {
            self.settings.load_many(&users).await?
        };

        let outcome = reconcile(message, &live);
        debug!(
            process_now = outcome.process_now.len(),
            skip = outcome.skip.len(),
            republish = outcome.republish.len(),
            "reconciled batch"
        );
        Ok(Reconciliation { outcome, live })
    }
}
