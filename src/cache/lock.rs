//! Single-owner election by resource key.
//!
//! A lock is a `lock:<resource>` cache entry holding a random token. Only the
//! holder of the token can release it, so a worker whose lock expired cannot
//! release a lock another worker has since taken.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use super::{KvCache, Result};

/// Default lifetime of a lock whose holder never releases it.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Proof of holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a held lock should be released"]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    /// The resource this guard locks (without the `lock:` prefix).
    pub fn resource(&self) -> &str {
        self.key.strip_prefix("lock:").unwrap_or(&self.key)
    }
}

/// Acquires and releases resource locks.
#[derive(Debug)]
pub struct SchedulingLock<C> {
    cache: Arc<C>,
    ttl: Duration,
}

impl<C> Clone for SchedulingLock<C> {
    fn clone(&self) -> Self {
        SchedulingLock {
            cache: Arc::clone(&self.cache),
            ttl: self.ttl,
        }
    }
}

impl<C: KvCache> SchedulingLock<C> {
    pub fn new(cache: Arc<C>, ttl: Duration) -> Self {
        SchedulingLock { cache, ttl }
    }

    /// Tries to take the lock on `resource`. Returns `None` if it is held.
    pub async fn try_acquire(&self, resource: &str) -> Result<Option<LockGuard>> {
        let guard = LockGuard {
            key: format!("lock:{resource}"),
            token: Uuid::new_v4().to_string(),
        };
        if self
            .cache
            .set_if_absent(&guard.key, &guard.token, self.ttl)
            .await?
        {
            debug!(resource, "acquired lock");
            Ok(Some(guard))
        } else {
            debug!(resource, "lock held elsewhere");
            Ok(None)
        }
    }

    /// Releases a lock this worker holds.
    ///
    /// Returns false if the lock had already expired or changed hands.
    pub async fn release(&self, guard: LockGuard) -> Result<bool> {
        let released = self
            .cache
            .delete_if_equals(&guard.key, &guard.token)
            .await?;
        if !released {
            warn!(resource = guard.resource(), "lock expired before release");
        }
        Ok(released)
    }
}
