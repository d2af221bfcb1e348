//! `quota_transactions` queries.
//!
//! Rows are only ever inserted. [`append`] derives `seq` and
//! `balance_after` from the previous entry, so every chain written through
//! this module satisfies the balance invariant by construction.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::types::{Channel, LedgerEntry, LedgerReason, TaskCode, TransactionType, UserId};

use super::{Result, StoreError, parse_column};

const TABLE: &str = "quota_transactions";

/// A ledger entry before it is appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDraft {
    pub user_id: UserId,
    pub channel: Channel,
    pub reason: LedgerReason,
    pub amount: i64,
    pub reference: Option<TaskCode>,
}

struct RawEntry {
    user_id: i64,
    channel: String,
    seq: i64,
    transaction_type: String,
    reason: String,
    amount: i64,
    balance_after: i64,
    reference: Option<String>,
    created_at: DateTime<Utc>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawEntry {
            user_id: row.get("user_id")?,
            channel: row.get("channel")?,
            seq: row.get("seq")?,
            transaction_type: row.get("transaction_type")?,
            reason: row.get("reason")?,
            amount: row.get("amount")?,
            balance_after: row.get("balance_after")?,
            reference: row.get("reference")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_entry(self) -> Result<LedgerEntry> {
        Ok(LedgerEntry {
            user_id: UserId(self.user_id),
            channel: parse_column(TABLE, "channel", &self.channel, Channel::parse)?,
            seq: self.seq,
            transaction_type: parse_column(
                TABLE,
                "transaction_type",
                &self.transaction_type,
                TransactionType::parse,
            )?,
            reason: parse_column(TABLE, "reason", &self.reason, LedgerReason::parse)?,
            amount: self.amount,
            balance_after: self.balance_after,
            reference: self.reference.map(TaskCode),
            created_at: self.created_at,
        })
    }
}

const SELECT_COLUMNS: &str = "user_id, channel, seq, transaction_type, reason, amount, \
                              balance_after, reference, created_at";

/// Returns the most recent entry of an account, if it has any.
pub fn latest(conn: &Connection, user_id: UserId, channel: Channel) -> Result<Option<LedgerEntry>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM {TABLE}
         WHERE user_id = ?1 AND channel = ?2
         ORDER BY seq DESC LIMIT 1"
    );
    let raw = conn
        .query_row(&sql, params![user_id.0, channel.as_str()], RawEntry::from_row)
        .optional()?;
    raw.map(RawEntry::into_entry).transpose()
}

/// Returns the current balance of an account (0 when it has no entries).
pub fn balance(conn: &Connection, user_id: UserId, channel: Channel) -> Result<i64> {
    Ok(latest(conn, user_id, channel)?.map_or(0, |e| e.balance_after))
}

/// Returns every entry of an account in chain order.
pub fn entries(conn: &Connection, user_id: UserId, channel: Channel) -> Result<Vec<LedgerEntry>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM {TABLE}
         WHERE user_id = ?1 AND channel = ?2
         ORDER BY seq ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![user_id.0, channel.as_str()], RawEntry::from_row)?;
    rows.map(|raw| raw.map_err(StoreError::from)?.into_entry())
        .collect()
}

/// Returns every entry that references a task, across accounts.
pub fn entries_for_reference(conn: &Connection, reference: &TaskCode) -> Result<Vec<LedgerEntry>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM {TABLE}
         WHERE reference = ?1
         ORDER BY id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![reference.as_str()], RawEntry::from_row)?;
    rows.map(|raw| raw.map_err(StoreError::from)?.into_entry())
        .collect()
}

/// Appends `draft` after `previous` (the account's current latest entry).
///
/// The caller must have read `previous` inside the same transaction. If
/// another writer appended in between, the `(user_id, channel, seq)`
/// uniqueness constraint rejects the insert with [`StoreError::ChainConflict`].
pub fn append(
    conn: &Connection,
    previous: Option<&LedgerEntry>,
    draft: &EntryDraft,
) -> Result<LedgerEntry> {
    let (prev_seq, prev_balance) = previous.map_or((0, 0), |e| (e.seq, e.balance_after));
    let entry = LedgerEntry {
        user_id: draft.user_id,
        channel: draft.channel,
        seq: prev_seq + 1,
        transaction_type: draft.reason.transaction_type(),
        reason: draft.reason,
        amount: draft.amount,
        balance_after: prev_balance + draft.reason.signed_delta(draft.amount),
        reference: draft.reference.clone(),
        created_at: Utc::now(),
    };

    let inserted = conn.execute(
        &format!(
            "INSERT INTO {TABLE}
             (user_id, channel, seq, transaction_type, reason, amount, balance_after, reference, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            entry.user_id.0,
            entry.channel.as_str(),
            entry.seq,
            entry.transaction_type.as_str(),
            entry.reason.as_str(),
            entry.amount,
            entry.balance_after,
            entry.reference.as_ref().map(TaskCode::as_str),
            entry.created_at,
        ],
    );

    match inserted {
        Ok(_) => Ok(entry),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::ChainConflict {
                user_id: entry.user_id,
                channel: entry.channel,
                seq: entry.seq,
            })
        }
        Err(e) => Err(e.into()),
    }
}
