//! `users` queries.
//!
//! Profiles are owned elsewhere; the pipeline only reads them. [`upsert`] and
//! [`mark_deleted`] exist for seeding and for the profile sync job.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::types::{UserContact, UserId};

use super::Result;

/// Inserts or replaces a user's contact projection.
pub fn upsert(conn: &Connection, user: &UserContact) -> Result<()> {
    conn.execute(
        "INSERT INTO users (user_id, nickname, phone_cipher, deleted_at)
         VALUES (?1, ?2, ?3, NULL)
         ON CONFLICT(user_id) DO UPDATE SET
             nickname = excluded.nickname,
             phone_cipher = excluded.phone_cipher,
             deleted_at = NULL",
        params![user.user_id.0, user.nickname, user.phone_cipher],
    )?;
    Ok(())
}

/// Soft-deletes a user. Deleted users are invisible to [`find`].
pub fn mark_deleted(conn: &Connection, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE users SET deleted_at = ?2 WHERE user_id = ?1",
        params![user_id.0, at],
    )?;
    Ok(())
}

/// Looks up a live user.
pub fn find(conn: &Connection, user_id: UserId) -> Result<Option<UserContact>> {
    let user = conn
        .query_row(
            "SELECT user_id, nickname, phone_cipher FROM users
             WHERE user_id = ?1 AND deleted_at IS NULL",
            params![user_id.0],
            |row| {
                Ok(UserContact {
                    user_id: UserId(row.get(0)?),
                    nickname: row.get(1)?,
                    phone_cipher: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn contact(nickname: &str) -> UserContact {
        UserContact {
            user_id: UserId(3),
            nickname: nickname.to_string(),
            phone_cipher: "nonce:cipher".to_string(),
        }
    }

    #[test]
    fn upsert_replaces_and_undeletes() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.write(|tx| upsert(tx, &contact("old"))).unwrap();
        store
            .write(|tx| mark_deleted(tx, UserId(3), Utc::now()))
            .unwrap();
        assert!(store.read(|conn| find(conn, UserId(3))).unwrap().is_none());

        store.write(|tx| upsert(tx, &contact("new"))).unwrap();
        let found = store.read(|conn| find(conn, UserId(3))).unwrap().unwrap();
        assert_eq!(found.nickname, "new");
    }
}
