//! Shared counter store.
//!
//! Every piece of rate-limit and brute-force state lives behind the
//! [`CounterStore`] trait so that any number of stateless workers can share
//! it. Implementations must make each operation atomic per key; nothing above
//! this layer takes a lock.

mod memory;
mod redis_store;
mod timeout;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::clock::{duration_ms, sub_span};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;
pub use self::timeout::TimeoutStore;

/// Errors raised by a counter store backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached
    #[error("store unavailable: {0}")]
    Connection(String),

    /// The backend rejected or failed a command
    #[error("store command failed: {0}")]
    Command(String),

    /// The call did not finish within the configured bound
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// A key held a value of the wrong shape
    #[error("unexpected value at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The state of a sliding window right after it has been read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Number of entries still inside the window
    pub count: u64,
    /// Timestamp of the earliest entry, if any could be read
    pub oldest_ms: Option<i64>,
}

/// Atomic keyed operations backing the limiter and the brute-force protector.
///
/// Ordered-set operations (`insert`, `purge_before`, `count`, `oldest`) score
/// members by their millisecond timestamp. Counter operations (`increment`,
/// `get`, `set`) work on plain string values.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `token` to the ordered set at `key`, scored by `timestamp_ms`.
    async fn insert(&self, key: &str, timestamp_ms: i64, token: &str) -> StoreResult<()>;

    /// Remove every ordered-set member scored at or below `cutoff_ms`.
    /// Returns the number of members removed.
    async fn purge_before(&self, key: &str, cutoff_ms: i64) -> StoreResult<u64>;

    /// Cardinality of the ordered set at `key`.
    async fn count(&self, key: &str) -> StoreResult<u64>;

    /// Score of the earliest ordered-set member.
    async fn oldest(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Set a time-to-live on an existing key. Missing keys are left alone.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomically increment the counter at `key`, returning the new value.
    async fn increment(&self, key: &str) -> StoreResult<i64>;

    /// Read a plain value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a plain value with a time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete a key of any type.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Delete every key starting with `prefix`. Returns the number deleted.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64>;

    /// Connectivity check.
    async fn ping(&self) -> StoreResult<()>;

    /// Record one request in the sliding window at `key` and read it back.
    ///
    /// Purges entries older than `now_ms - window`, inserts the new entry,
    /// refreshes the key's expiry and returns the resulting count along with
    /// the earliest remaining timestamp. Backends able to run this as one
    /// transaction should override it.
    async fn record_entry(
        &self,
        key: &str,
        now_ms: i64,
        token: &str,
        window: Duration,
    ) -> StoreResult<WindowSnapshot> {
        let cutoff = sub_span(now_ms, duration_ms(window));
        self.purge_before(key, cutoff).await?;
        self.insert(key, now_ms, token).await?;
        let count = self.count(key).await?;
        self.set_expiry(key, window).await?;
        let oldest_ms = self.oldest(key).await?;
        Ok(WindowSnapshot { count, oldest_ms })
    }

    /// Purge and read the sliding window at `key` without recording anything.
    async fn window_snapshot(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> StoreResult<WindowSnapshot> {
        let cutoff = sub_span(now_ms, duration_ms(window));
        self.purge_before(key, cutoff).await?;
        let count = self.count(key).await?;
        let oldest_ms = self.oldest(key).await?;
        Ok(WindowSnapshot { count, oldest_ms })
    }

    /// Increment the counter at `key` and make sure it expires within `ttl`.
    ///
    /// The TTL is only applied to a counter that has none, so later
    /// increments do not stretch it. A counter must never be left without a
    /// TTL: when this default cannot set one on the counter it just created,
    /// it deletes the counter and returns the error. Backends able to do
    /// both in one step should override it.
    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let value = self.increment(key).await?;
        if value == 1 {
            if let Err(e) = self.set_expiry(key, ttl).await {
                if let Err(cleanup) = self.delete(key).await {
                    warn!(key = %key, error = %cleanup, "Failed to drop counter without expiry");
                }
                return Err(e);
            }
        }
        Ok(value)
    }
}

/// Shared handles are stores too, so one backend can sit behind a decorator
/// while other tasks keep a reference to it.
#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn insert(&self, key: &str, timestamp_ms: i64, token: &str) -> StoreResult<()> {
        (**self).insert(key, timestamp_ms, token).await
    }

    async fn purge_before(&self, key: &str, cutoff_ms: i64) -> StoreResult<u64> {
        (**self).purge_before(key, cutoff_ms).await
    }

    async fn count(&self, key: &str) -> StoreResult<u64> {
        (**self).count(key).await
    }

    async fn oldest(&self, key: &str) -> StoreResult<Option<i64>> {
        (**self).oldest(key).await
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        (**self).set_expiry(key, ttl).await
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        (**self).increment(key).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        (**self).delete(key).await
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        (**self).delete_prefix(prefix).await
    }

    async fn ping(&self) -> StoreResult<()> {
        (**self).ping().await
    }

    async fn record_entry(
        &self,
        key: &str,
        now_ms: i64,
        token: &str,
        window: Duration,
    ) -> StoreResult<WindowSnapshot> {
        (**self).record_entry(key, now_ms, token, window).await
    }

    async fn window_snapshot(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> StoreResult<WindowSnapshot> {
        (**self).window_snapshot(key, now_ms, window).await
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        (**self).increment_with_expiry(key, ttl).await
    }
}
