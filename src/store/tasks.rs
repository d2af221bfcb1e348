//! `notification_tasks` queries.
//!
//! The task engine decides which transition is legal (see
//! [`NotificationTask::admission`]) and runs each one inside a write
//! transaction. Every write a delivery makes after claiming a task is
//! fenced by the claim's `claim_id`: it only applies while the row is still
//! `processing` under that claim, and fails with
//! [`StoreError::ClaimLost`] otherwise.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::types::{
    Channel, NewTask, NotificationTask, TaskCategory, TaskCode, TaskFailure, TaskStatus, UserId,
};

use super::{Result, StoreError, parse_column};

const TABLE: &str = "notification_tasks";

const SELECT_COLUMNS: &str = "id, task_code, user_id, category, channel, payload, status, \
                              retry_count, scheduled_at, processed_at, cost_cents, deducted, \
                              lease_until, error_code, error_message, retryable";

struct RawTask {
    id: i64,
    task_code: String,
    user_id: i64,
    category: String,
    channel: String,
    payload: String,
    status: String,
    retry_count: u32,
    scheduled_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    cost_cents: i64,
    deducted: bool,
    lease_until: Option<DateTime<Utc>>,
    error_code: Option<String>,
    error_message: Option<String>,
    retryable: Option<bool>,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawTask {
            id: row.get("id")?,
            task_code: row.get("task_code")?,
            user_id: row.get("user_id")?,
            category: row.get("category")?,
            channel: row.get("channel")?,
            payload: row.get("payload")?,
            status: row.get("status")?,
            retry_count: row.get("retry_count")?,
            scheduled_at: row.get("scheduled_at")?,
            processed_at: row.get("processed_at")?,
            cost_cents: row.get("cost_cents")?,
            deducted: row.get("deducted")?,
            lease_until: row.get("lease_until")?,
            error_code: row.get("error_code")?,
            error_message: row.get("error_message")?,
            retryable: row.get("retryable")?,
        })
    }

    fn into_task(self) -> Result<NotificationTask> {
        let last_failure = self.error_code.map(|code| TaskFailure {
            code,
            message: self.error_message.unwrap_or_default(),
            retryable: self.retryable.unwrap_or(false),
        });

        Ok(NotificationTask {
            id: self.id,
            task_code: TaskCode(self.task_code),
            user_id: UserId(self.user_id),
            category: parse_column(TABLE, "category", &self.category, TaskCategory::parse)?,
            channel: parse_column(TABLE, "channel", &self.channel, Channel::parse)?,
            payload: serde_json::from_str(&self.payload)?,
            status: parse_column(TABLE, "status", &self.status, TaskStatus::parse)?,
            retry_count: self.retry_count,
            scheduled_at: self.scheduled_at,
            processed_at: self.processed_at,
            cost_cents: self.cost_cents,
            deducted: self.deducted,
            lease_until: self.lease_until,
            last_failure,
        })
    }
}

fn collect(rows: impl Iterator<Item = rusqlite::Result<RawTask>>) -> Result<Vec<NotificationTask>> {
    rows.map(|raw| raw.map_err(StoreError::from)?.into_task())
        .collect()
}

/// Inserts `task` in `pending` unless its code already exists.
///
/// Returns true if a row was inserted.
pub fn insert_if_absent(conn: &Connection, task: &NewTask, now: DateTime<Utc>) -> Result<bool> {
    let payload = serde_json::to_string(&task.payload)?;
    let inserted = conn.execute(
        &format!(
            "INSERT INTO {TABLE}
             (task_code, user_id, category, channel, payload, status, scheduled_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?7)
             ON CONFLICT(task_code) DO NOTHING"
        ),
        params![
            task.task_code.as_str(),
            task.user_id.0,
            task.category.as_str(),
            task.channel.as_str(),
            payload,
            task.scheduled_at,
            now,
        ],
    )?;
    Ok(inserted == 1)
}

/// Looks up a task by its code.
pub fn find_by_code(conn: &Connection, code: &TaskCode) -> Result<Option<NotificationTask>> {
    let raw = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM {TABLE} WHERE task_code = ?1"),
            params![code.as_str()],
            RawTask::from_row,
        )
        .optional()?;
    raw.map(RawTask::into_task).transpose()
}

/// Fails with [`StoreError::ClaimLost`] unless a fenced update hit the row.
fn fenced(updated: usize, code: &TaskCode) -> Result<()> {
    if updated == 0 {
        return Err(StoreError::ClaimLost(code.clone()));
    }
    Ok(())
}

/// Moves a task to `processing` under a new claim with a lease.
///
/// `reclaim` increments `retry_count`. The previous failure is kept until
/// the new attempt settles.
pub fn claim(
    conn: &Connection,
    code: &TaskCode,
    claim_id: &str,
    lease_until: DateTime<Utc>,
    reclaim: bool,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {TABLE}
             SET status = 'processing',
                 claim_id = ?2,
                 lease_until = ?3,
                 retry_count = retry_count + ?4,
                 updated_at = ?5
             WHERE task_code = ?1"
        ),
        params![code.as_str(), claim_id, lease_until, i64::from(reclaim), now],
    )?;
    Ok(())
}

/// Records the ledger reservation a claim holds (`None` after a refund).
pub fn set_reservation(
    conn: &Connection,
    code: &TaskCode,
    claim_id: &str,
    amount: Option<i64>,
    now: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        &format!(
            "UPDATE {TABLE} SET deducted = ?3, cost_cents = ?4, updated_at = ?5
             WHERE task_code = ?1 AND status = 'processing' AND claim_id = ?2"
        ),
        params![code.as_str(), claim_id, amount.is_some(), amount.unwrap_or(0), now],
    )?;
    fenced(updated, code)
}

/// Clears the reservation of an abandoned claim.
///
/// Only for takeovers and the lease sweep, which refund it in the same
/// transaction.
pub fn drop_reservation(conn: &Connection, code: &TaskCode, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {TABLE} SET deducted = 0, cost_cents = 0, updated_at = ?2 WHERE task_code = ?1"
        ),
        params![code.as_str(), now],
    )?;
    Ok(())
}

/// Marks a claimed task `failed`, dropping its lease.
///
/// Does not touch the reservation; callers refund first and clear it in
/// the same transaction.
pub fn mark_failed(
    conn: &Connection,
    code: &TaskCode,
    claim_id: &str,
    failure: &TaskFailure,
    now: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        &format!(
            "UPDATE {TABLE}
             SET status = 'failed',
                 lease_until = NULL,
                 claim_id = NULL,
                 error_code = ?3,
                 error_message = ?4,
                 retryable = ?5,
                 updated_at = ?6
             WHERE task_code = ?1 AND status = 'processing' AND claim_id = ?2"
        ),
        params![
            code.as_str(),
            claim_id,
            failure.code,
            failure.message,
            failure.retryable,
            now
        ],
    )?;
    fenced(updated, code)
}

/// Marks a claimed task `success` after its charge was confirmed.
pub fn mark_success(
    conn: &Connection,
    code: &TaskCode,
    claim_id: &str,
    cost_cents: i64,
    processed_at: DateTime<Utc>,
) -> Result<()> {
    let updated = conn.execute(
        &format!(
            "UPDATE {TABLE}
             SET status = 'success',
                 processed_at = ?3,
                 cost_cents = ?4,
                 deducted = 1,
                 lease_until = NULL,
                 claim_id = NULL,
                 error_code = NULL,
                 error_message = NULL,
                 retryable = NULL,
                 updated_at = ?3
             WHERE task_code = ?1 AND status = 'processing' AND claim_id = ?2"
        ),
        params![code.as_str(), claim_id, processed_at, cost_cents],
    )?;
    fenced(updated, code)
}

/// Returns an abandoned task to `pending`, voiding its claim.
pub fn release(conn: &Connection, code: &TaskCode, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE {TABLE}
             SET status = 'pending', lease_until = NULL, claim_id = NULL, updated_at = ?2
             WHERE task_code = ?1"
        ),
        params![code.as_str(), now],
    )?;
    Ok(())
}

/// Returns every `processing` task whose lease ended at or before `now`.
pub fn expired_leases(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<NotificationTask>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM {TABLE} WHERE status = 'processing' ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map([], RawTask::from_row)?;
    // Timestamps are stored as text; compare them as values, not strings.
    Ok(collect(rows)?
        .into_iter()
        .filter(|t| t.lease_until.is_none_or(|lease| lease <= now))
        .collect())
}

/// Returns every task owned by `user_id`, oldest first.
pub fn for_user(conn: &Connection, user_id: UserId) -> Result<Vec<NotificationTask>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM {TABLE} WHERE user_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map(params![user_id.0], RawTask::from_row)?;
    collect(rows)
}
