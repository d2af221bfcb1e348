//! Table definitions.

use rusqlite::Connection;

const SCHEMA: &str = r#"
-- Append-only quota ledger. The latest row per (user_id, channel) is the balance.
CREATE TABLE IF NOT EXISTS quota_transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    channel TEXT NOT NULL,
    seq INTEGER NOT NULL,
    transaction_type TEXT NOT NULL,
    reason TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount >= 0),
    balance_after INTEGER NOT NULL,
    reference TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, channel, seq)
);
CREATE INDEX IF NOT EXISTS idx_quota_transactions_reference ON quota_transactions(reference);

-- Notification tasks, keyed by the producer's idempotency code.
CREATE TABLE IF NOT EXISTS notification_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_code TEXT NOT NULL UNIQUE,
    user_id INTEGER NOT NULL,
    category TEXT NOT NULL,
    channel TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    scheduled_at TEXT NOT NULL,
    processed_at TEXT,
    cost_cents INTEGER NOT NULL DEFAULT 0,
    deducted INTEGER NOT NULL DEFAULT 0,
    lease_until TEXT,
    claim_id TEXT,
    error_code TEXT,
    error_message TEXT,
    retryable INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notification_tasks_status ON notification_tasks(status);
CREATE INDEX IF NOT EXISTS idx_notification_tasks_user ON notification_tasks(user_id);

-- Escalation attempts against emergency contacts.
CREATE TABLE IF NOT EXISTS contact_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES notification_tasks(id),
    contact_priority INTEGER NOT NULL CHECK (contact_priority BETWEEN 1 AND 3),
    contact_phone_hash TEXT NOT NULL,
    channel TEXT NOT NULL,
    status TEXT NOT NULL,
    response_code TEXT,
    response_message TEXT,
    cost_cents INTEGER NOT NULL DEFAULT 0,
    deducted INTEGER NOT NULL DEFAULT 0,
    attempted_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_contact_attempts_task ON contact_attempts(task_id);

-- Read-only projection of user profiles.
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    nickname TEXT NOT NULL,
    phone_cipher TEXT NOT NULL,
    deleted_at TEXT
);
"#;

/// Creates any missing tables and indexes.
pub fn apply(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        apply(&conn).unwrap();
    }

    #[test]
    fn task_code_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        apply(&conn).unwrap();
        let insert = "INSERT INTO notification_tasks
            (task_code, user_id, category, channel, payload, scheduled_at, created_at, updated_at)
            VALUES ('dup', 1, 'check_in_reminder', 'sms', '{}', 'x', 'x', 'x')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
