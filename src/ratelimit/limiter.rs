//! Sliding-window rate limiter.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, trace, warn};

use super::key::WindowKey;
use super::policy::{RateLimitConfig, RateLimitResult};
use super::window::{evaluate, fail_open, WindowEntry};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::store::{CounterStore, StoreResult};

/// Per-identifier, per-endpoint sliding-window request limiter.
///
/// Holds no counters of its own: every check goes to the shared store, so
/// any number of instances pointed at the same store enforce one limit.
pub struct RateLimiter {
    /// Shared counter store
    store: Arc<dyn CounterStore>,
    /// Time source for window arithmetic
    clock: Arc<dyn Clock>,
    /// Immutable limit configuration
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a new rate limiter on the system clock.
    ///
    /// Fails if the configuration is invalid.
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Result<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a new rate limiter with an explicit time source.
    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            config,
        })
    }

    /// The limit configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn key(&self, identifier: &str, endpoint: &str) -> WindowKey {
        WindowKey::new(&self.config.key_prefix, identifier, endpoint)
    }

    /// Record a request for `identifier` on `endpoint` and decide whether it
    /// may proceed.
    ///
    /// The request is counted before the verdict is computed, so denied
    /// requests still consume quota. Store failures, timeouts and panics in
    /// the store are logged and turned into an allow verdict with the full
    /// quota.
    pub async fn check_limit(&self, identifier: &str, endpoint: &str) -> RateLimitResult {
        let key = self.key(identifier, endpoint);
        let now = self.clock.now_ms();

        trace!(key = %key, "Checking rate limit");

        let outcome = AssertUnwindSafe(self.record(&key, now)).catch_unwind().await;

        match outcome {
            Ok(Ok(result)) => {
                if !result.allowed {
                    debug!(
                        key = %key,
                        limit = result.limit,
                        retry_after = ?result.retry_after,
                        "Rate limit exceeded"
                    );
                }
                result
            }
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Counter store failed, allowing request");
                fail_open(&self.config, now)
            }
            Err(_) => {
                warn!(key = %key, "Rate limit check panicked, allowing request");
                fail_open(&self.config, now)
            }
        }
    }

    async fn record(&self, key: &WindowKey, now: i64) -> StoreResult<RateLimitResult> {
        let entry = WindowEntry::new(now);
        let snapshot = self
            .store
            .record_entry(&key.to_store_key(), now, &entry.member(), self.config.window())
            .await?;
        Ok(evaluate(&self.config, snapshot, now))
    }

    /// Clear the window of one endpoint, or of every endpoint when `endpoint`
    /// is `None`.
    pub async fn reset_limit(&self, identifier: &str, endpoint: Option<&str>) -> StoreResult<()> {
        match endpoint {
            Some(endpoint) => {
                let key = self.key(identifier, endpoint);
                self.store.delete(&key.to_store_key()).await?;
                debug!(key = %key, "Rate limit reset");
            }
            None => {
                let prefix = WindowKey::identifier_prefix(&self.config.key_prefix, identifier);
                let removed = self.store.delete_prefix(&prefix).await?;
                debug!(prefix = %prefix, removed = removed, "Rate limits reset");
            }
        }
        Ok(())
    }

    /// Number of requests currently inside the window, without recording one.
    pub async fn get_current_count(&self, identifier: &str, endpoint: &str) -> StoreResult<u64> {
        let key = self.key(identifier, endpoint);
        let snapshot = self
            .store
            .window_snapshot(&key.to_store_key(), self.clock.now_ms(), self.config.window())
            .await?;
        Ok(snapshot.count)
    }
}
