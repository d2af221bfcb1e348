//! Live per-user reminder settings.
//!
//! The settings-update flow writes `user_settings:<user_id>` as JSON whenever
//! a user changes their reminder configuration. Reconciliation reads the
//! entries for a whole batch with one MGET.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::types::{UserId, UserSettingsCacheEntry};

use super::{CacheError, KvCache, Result};

fn key(user_id: UserId) -> String {
    format!("user_settings:{}", user_id)
}

/// Reads and writes [`UserSettingsCacheEntry`] values.
#[derive(Debug)]
pub struct SettingsCache<C> {
    cache: Arc<C>,
}

impl<C> Clone for SettingsCache<C> {
    fn clone(&self) -> Self {
        SettingsCache {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<C: KvCache> SettingsCache<C> {
    pub fn new(cache: Arc<C>) -> Self {
        SettingsCache { cache }
    }

    /// Loads the entries for `user_ids`. Users without an entry are absent
    /// from the map.
    ///
    /// An undecodable entry is logged and treated as absent, so one bad
    /// value cannot block a batch.
    pub async fn load_many(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, UserSettingsCacheEntry>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = user_ids.iter().copied().map(key).collect();
        let values = self.cache.get_many(&keys).await?;

        let mut entries = HashMap::with_capacity(user_ids.len());
        for ((user_id, key), value) in user_ids.iter().zip(&keys).zip(values) {
            let Some(value) = value else { continue };
            match serde_json::from_str::<UserSettingsCacheEntry>(&value) {
                Ok(entry) => {
                    entries.insert(*user_id, entry);
                }
                Err(source) => {
                    let err = CacheError::Corrupt {
                        key: key.clone(),
                        source,
                    };
                    warn!(error = %err, "ignoring undecodable settings entry");
                }
            }
        }
        Ok(entries)
    }

    /// Loads one user's entry.
    pub async fn load(&self, user_id: UserId) -> Result<Option<UserSettingsCacheEntry>> {
        let key = key(user_id);
        match self.cache.get(&key).await? {
            Some(value) => serde_json::from_str(&value)
                .map(Some)
                .map_err(|source| CacheError::Corrupt { key, source }),
            None => Ok(None),
        }
    }

    /// Stores a user's entry.
    pub async fn put(
        &self,
        user_id: UserId,
        entry: &UserSettingsCacheEntry,
        ttl: Duration,
    ) -> Result<()> {
        let value = serde_json::to_string(entry)?;
        self.cache.set(&key(user_id), &value, ttl).await
    }
}
