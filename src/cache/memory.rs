//! In-process cache backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::{KvCache, Result};

#[derive(Debug)]
struct Slot {
    value: String,
    expires_at: Instant,
}

/// A [`KvCache`] held in process memory.
///
/// Expiry follows the tokio clock, so tests can advance it with
/// `tokio::time::advance`. Expired entries are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // A panic while holding the lock cannot leave a slot half-written.
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live_value(slots: &mut HashMap<String, Slot>, key: &str, now: Instant) -> Option<String> {
        match slots.get(key) {
            Some(slot) if slot.expires_at > now => Some(slot.value.clone()),
            Some(_) => {
                slots.remove(key);
                None
            }
            None => None,
        }
    }

    fn insert(slots: &mut HashMap<String, Slot>, key: &str, value: &str, ttl: Duration) {
        slots.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(Self::live_value(&mut self.slots(), key, Instant::now()))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let now = Instant::now();
        let mut slots = self.slots();
        Ok(keys
            .iter()
            .map(|key| Self::live_value(&mut slots, key, now))
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        Self::insert(&mut self.slots(), key, value, ttl);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut slots = self.slots();
        if Self::live_value(&mut slots, key, Instant::now()).is_some() {
            return Ok(false);
        }
        Self::insert(&mut slots, key, value, ttl);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.slots().remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut slots = self.slots();
        match Self::live_value(&mut slots, key, Instant::now()) {
            Some(value) if value == expected => {
                slots.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_ttl() {
        let cache = MemoryCache::new();
        cache.set("k", "v", TTL).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(TTL).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_live_values_only() {
        let cache = MemoryCache::new();
        assert!(cache.set_if_absent("k", "a", TTL).await.unwrap());
        assert!(!cache.set_if_absent("k", "b", TTL).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(cache.set_if_absent("k", "b", TTL).await.unwrap());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn delete_if_equals_checks_value() {
        let cache = MemoryCache::new();
        cache.set("k", "mine", TTL).await.unwrap();
        assert!(!cache.delete_if_equals("k", "theirs").await.unwrap());
        assert!(cache.delete_if_equals("k", "mine").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_many_preserves_order() {
        let cache = MemoryCache::new();
        cache.set("a", "1", TTL).await.unwrap();
        cache.set("c", "3", TTL).await.unwrap();
        let keys = ["a", "b", "c"].map(String::from);
        assert_eq!(
            cache.get_many(&keys).await.unwrap(),
            vec![Some("1".to_string()), None, Some("3".to_string())]
        );
    }
}
