//! `contact_attempts` queries.

use rusqlite::{Connection, params};

use crate::types::{AttemptStatus, Channel, ContactAttempt, ContactPriority};

use super::{Result, StoreError, parse_column};

const TABLE: &str = "contact_attempts";

/// Records one attempt and returns its row id.
pub fn insert(conn: &Connection, attempt: &ContactAttempt) -> Result<i64> {
    conn.execute(
        &format!(
            "INSERT INTO {TABLE}
             (task_id, contact_priority, contact_phone_hash, channel, status,
              response_code, response_message, cost_cents, deducted, attempted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ),
        params![
            attempt.task_id,
            attempt.contact_priority.get(),
            attempt.contact_phone_hash,
            attempt.channel.as_str(),
            attempt.status.as_str(),
            attempt.response_code,
            attempt.response_message,
            attempt.cost_cents,
            attempt.deducted,
            attempt.attempted_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Returns the attempts made for a task in priority order.
pub fn for_task(conn: &Connection, task_id: i64) -> Result<Vec<ContactAttempt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT task_id, contact_priority, contact_phone_hash, channel, status,
                response_code, response_message, cost_cents, deducted, attempted_at
         FROM {TABLE}
         WHERE task_id = ?1
         ORDER BY contact_priority ASC, id ASC"
    ))?;

    let rows = stmt.query_map(params![task_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, u8>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, i64>(7)?,
            row.get::<_, bool>(8)?,
            row.get::<_, chrono::DateTime<chrono::Utc>>(9)?,
        ))
    })?;

    let mut attempts = Vec::new();
    for row in rows {
        let (
            task_id,
            priority,
            contact_phone_hash,
            channel,
            status,
            response_code,
            response_message,
            cost_cents,
            deducted,
            attempted_at,
        ) = row?;
        attempts.push(ContactAttempt {
            task_id,
            contact_priority: ContactPriority::new(priority).ok_or_else(|| {
                StoreError::CorruptRow {
                    table: TABLE,
                    column: "contact_priority",
                    value: priority.to_string(),
                }
            })?,
            contact_phone_hash,
            channel: parse_column(TABLE, "channel", &channel, Channel::parse)?,
            status: parse_column(TABLE, "status", &status, AttemptStatus::parse)?,
            response_code,
            response_message,
            cost_cents,
            deducted,
            attempted_at,
        });
    }
    Ok(attempts)
}
