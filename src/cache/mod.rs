//! Shared key-value cache and the services built on it.
//!
//! The pipeline talks to a Redis-like cache through the [`KvCache`] trait.
//! Every operation the services need is expressible as a single atomic cache
//! command (GET, MGET, SET EX, SET NX EX, DEL, and a compare-and-delete
//! script), so any backend that offers those can stand behind the trait.
//!
//! # Services
//!
//! - [`idempotency::IdempotencyGuard`]: admission of queue messages by
//!   `message_id` (`idempotency:<message_id>`)
//! - [`lock::SchedulingLock`]: single-owner election by resource key
//!   (`lock:<resource>`)
//! - [`settings::SettingsCache`]: live per-user reminder settings
//!   (`user_settings:<user_id>`)
//!
//! [`memory::MemoryCache`] is the in-process backend used by the binary's
//! local mode and by tests.

pub mod idempotency;
pub mod lock;
pub mod memory;
pub mod settings;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

pub use idempotency::{
    DEFAULT_COMPLETED_TTL, DEFAULT_PROCESSING_TTL, IdempotencyGuard, MessageAdmission,
};
pub use lock::{DEFAULT_LOCK_TTL, LockGuard, SchedulingLock};
pub use memory::MemoryCache;
pub use settings::SettingsCache;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached or refused the command.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded.
    #[error("corrupt cache value at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be encoded for storage.
    #[error("cannot encode cache value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Atomic string operations against a shared cache.
///
/// Implementations must make each method a single atomic step as observed by
/// every process sharing the cache.
pub trait KvCache: Send + Sync {
    /// Returns the value at `key`, if present and unexpired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Returns the values at `keys`, in order.
    fn get_many(&self, keys: &[String]) -> impl Future<Output = Result<Vec<Option<String>>>> + Send;

    /// Stores `value` at `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str, ttl: Duration)
    -> impl Future<Output = Result<()>> + Send;

    /// Stores `value` at `key` only if the key is absent. Returns true if stored.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Removes `key`.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Removes `key` only if it currently holds `expected`. Returns true if removed.
    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool>> + Send;
}
