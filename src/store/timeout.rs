//! Per-call timeout decorator for counter stores.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{CounterStore, StoreError, StoreResult, WindowSnapshot};

/// Wraps a store so every call fails with [`StoreError::Timeout`] once it
/// exceeds `timeout`, instead of hanging the request that made it.
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: CounterStore> TimeoutStore<S> {
    /// Bound every call to `inner` by `timeout`.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The configured bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                trace!(op = op, timeout = ?self.timeout, "Store call timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for TimeoutStore<S> {
    async fn insert(&self, key: &str, timestamp_ms: i64, token: &str) -> StoreResult<()> {
        self.bounded("insert", self.inner.insert(key, timestamp_ms, token))
            .await
    }

    async fn purge_before(&self, key: &str, cutoff_ms: i64) -> StoreResult<u64> {
        self.bounded("purge_before", self.inner.purge_before(key, cutoff_ms))
            .await
    }

    async fn count(&self, key: &str) -> StoreResult<u64> {
        self.bounded("count", self.inner.count(key)).await
    }

    async fn oldest(&self, key: &str) -> StoreResult<Option<i64>> {
        self.bounded("oldest", self.inner.oldest(key)).await
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.bounded("set_expiry", self.inner.set_expiry(key, ttl))
            .await
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        self.bounded("increment", self.inner.increment(key)).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.bounded("set", self.inner.set(key, value, ttl)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.bounded("delete", self.inner.delete(key)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        self.bounded("delete_prefix", self.inner.delete_prefix(prefix))
            .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.bounded("ping", self.inner.ping()).await
    }

    async fn record_entry(
        &self,
        key: &str,
        now_ms: i64,
        token: &str,
        window: Duration,
    ) -> StoreResult<WindowSnapshot> {
        self.bounded(
            "record_entry",
            self.inner.record_entry(key, now_ms, token, window),
        )
        .await
    }

    async fn window_snapshot(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> StoreResult<WindowSnapshot> {
        self.bounded(
            "window_snapshot",
            self.inner.window_snapshot(key, now_ms, window),
        )
        .await
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.bounded(
            "increment_with_expiry",
            self.inner.increment_with_expiry(key, ttl),
        )
        .await
    }
}
