//! Transactional SQLite store for ledger entries, tasks and contact data.
//!
//! The store is the only shared mutable state in the pipeline. Every mutation
//! runs inside one `BEGIN IMMEDIATE` transaction, which takes the database
//! write lock *before* the first read. "Read latest, then append" is
//! therefore serialized across threads and across processes sharing the
//! database file.
//!
//! # Layout
//!
//! - [`schema`]: table definitions, applied on open
//! - [`ledger`]: `quota_transactions` queries
//! - [`tasks`]: `notification_tasks` queries
//! - [`attempts`]: `contact_attempts` queries
//! - [`users`]: `users` queries
//!
//! Query functions take a `&Connection` so they compose inside a caller's
//! transaction (a [`rusqlite::Transaction`] derefs to a connection).

pub mod attempts;
pub mod ledger;
pub mod schema;
pub mod tasks;
pub mod users;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::debug;

use crate::types::{Channel, TaskCode, UserId};

/// How long a writer waits for another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error for a payload column.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("store connection lock poisoned")]
    Poisoned,

    /// A row holds a value no current type can represent.
    #[error("corrupt {table}.{column} value: {value}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        value: String,
    },

    /// An append raced another writer for the same chain position.
    #[error("ledger chain conflict for user {user_id} on {channel} at seq {seq}")]
    ChainConflict {
        user_id: UserId,
        channel: Channel,
        seq: i64,
    },

    /// The task's claim moved to another delivery (or was swept) before
    /// this write.
    #[error("task {0} is no longer held by this claim")]
    ClaimLost(TaskCode),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A handle to the SQLite database.
///
/// Cloning the handle shares the underlying connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        debug!(path = %path.as_ref().display(), "opened store");
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::apply(&conn)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Runs `f` inside one IMMEDIATE transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error rolls
    /// back everything `f` wrote.
    pub fn write<T, E>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(value)
    }

    /// Runs a read-only closure against the connection.
    pub fn read<T, E>(
        &self,
        f: impl FnOnce(&Connection) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<StoreError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Executes raw SQL. Tests use this to install failure triggers.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }
}

/// Parses an enum column, reporting the offending value on failure.
pub(crate) fn parse_column<T>(
    table: &'static str,
    column: &'static str,
    value: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T> {
    parse(value).ok_or_else(|| StoreError::CorruptRow {
        table,
        column,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_rolls_back_on_error() {
        let store = SqliteStore::open_in_memory().unwrap();

        let result: Result<()> = store.write(|tx| {
            tx.execute(
                "INSERT INTO users (user_id, nickname, phone_cipher) VALUES (1, 'a', 'x')",
                [],
            )?;
            Err(StoreError::Poisoned)
        });
        assert!(result.is_err());

        let count: i64 = store
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                    .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn on_disk_store_persists_across_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notifications.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .write(|tx| {
                    tx.execute(
                        "INSERT INTO users (user_id, nickname, phone_cipher) VALUES (9, 'n', 'c')",
                        [],
                    )
                    .map_err(StoreError::from)
                })
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let nickname: String = store
            .read(|conn| {
                conn.query_row("SELECT nickname FROM users WHERE user_id = 9", [], |row| {
                    row.get(0)
                })
                .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(nickname, "n");
    }

    #[test]
    fn parse_column_reports_value() {
        let err = parse_column("t", "c", "bogus", |_| None::<u8>).unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
