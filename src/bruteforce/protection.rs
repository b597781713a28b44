//! Authentication attempt tracking with progressive delay and lockout.
//!
//! Each identifier is either Open (fewer than `max_attempts` recent failures)
//! or Locked (a lockout record with a future `locked_until`). Locked always
//! resolves back to Open, by expiry, by a successful login or by an operator.
//!
//! `check_attempt` is advisory: it never counts anything. The caller must
//! report the real outcome with `record_failed_attempt` or
//! `record_successful_attempt` once credentials have been verified;
//! [`crate::http::LoginGuard`] does this pairing for HTTP handlers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use super::config::BruteForceConfig;
use crate::audit::{AuditEvent, AuditSink, TracingAuditSink, UnlockReason};
use crate::clock::{add_span, to_datetime, Clock, SystemClock};
use crate::error::Result;
use crate::store::{CounterStore, StoreError, StoreResult};

/// Verdict for an upcoming authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptVerdict {
    /// Whether credentials may be checked at all
    pub allowed: bool,
    /// Failures left before a lockout
    pub attempts_remaining: u32,
    /// How long to hold the request before checking credentials
    #[serde(rename = "delayMs", serialize_with = "serialize_millis")]
    pub delay: Duration,
    /// End of the active lockout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    /// Time left on the active lockout, measured on the protector's clock
    #[serde(skip)]
    pub retry_after: Option<Duration>,
    /// Explanation suitable for the end user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Read-only view of an identifier's protection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptStatus {
    /// Failures recorded in the current window
    pub attempts: u64,
    /// Whether a lockout is active
    pub is_locked: bool,
    /// End of the active lockout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
    /// Failures left before a lockout
    pub attempts_remaining: u32,
}

/// Hash an identifier so raw credentials never reach the shared store.
pub fn identifier_hash(identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    hex::encode(hasher.finalize())
}

fn lockout_message(locked_until_ms: i64, now_ms: i64) -> String {
    let minutes = (locked_until_ms.saturating_sub(now_ms).max(0) as u64).div_ceil(60_000).max(1);
    format!(
        "Too many failed attempts. Try again in {} minute{}.",
        minutes,
        if minutes == 1 { "" } else { "s" }
    )
}

fn parse_i64(key: &str, raw: Option<String>) -> StoreResult<Option<i64>> {
    raw.map(|value| {
        value.parse::<i64>().map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    })
    .transpose()
}

/// Store-backed brute-force protection.
pub struct BruteForceProtection {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    config: BruteForceConfig,
}

impl std::fmt::Debug for BruteForceProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BruteForceProtection")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Keys {
    hash: String,
    attempts: String,
    lockout: String,
}

impl BruteForceProtection {
    /// Create a protector on the system clock, auditing to tracing.
    pub fn new(store: Arc<dyn CounterStore>, config: BruteForceConfig) -> Result<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a protector with an explicit time source.
    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        config: BruteForceConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            audit: Arc::new(TracingAuditSink),
            config,
        })
    }

    /// Send audit events to `sink` instead of tracing.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &BruteForceConfig {
        &self.config
    }

    fn keys(&self, identifier: &str) -> Keys {
        let hash = identifier_hash(identifier);
        Keys {
            attempts: format!("{}:attempts:{}", self.config.key_prefix, hash),
            lockout: format!("{}:lockout:{}", self.config.key_prefix, hash),
            hash,
        }
    }

    /// Progressive delay after `failures` prior failures:
    /// `min(base * 2^(failures-1), max)`, zero on a clean slate.
    pub fn delay_for(&self, failures: u64) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = u32::try_from(failures - 1)
            .ok()
            .and_then(|exp| 2u64.checked_pow(exp));
        let delay_ms = factor
            .and_then(|f| self.config.base_delay_ms.checked_mul(f))
            .map_or(self.config.max_delay_ms, |ms| ms.min(self.config.max_delay_ms));
        Duration::from_millis(delay_ms)
    }

    fn attempts_remaining(&self, failures: u64) -> u32 {
        let max = u64::from(self.config.max_attempts);
        (max - failures.min(max)) as u32
    }

    fn locked_verdict(&self, locked_until_ms: i64, now_ms: i64) -> AttemptVerdict {
        AttemptVerdict {
            allowed: false,
            attempts_remaining: 0,
            delay: Duration::ZERO,
            locked_until: Some(to_datetime(locked_until_ms)),
            retry_after: Some(Duration::from_millis(
                locked_until_ms.saturating_sub(now_ms).max(0) as u64,
            )),
            message: Some(lockout_message(locked_until_ms, now_ms)),
        }
    }

    fn open_verdict(&self) -> AttemptVerdict {
        AttemptVerdict {
            allowed: true,
            attempts_remaining: self.config.max_attempts,
            delay: Duration::ZERO,
            locked_until: None,
            retry_after: None,
            message: None,
        }
    }

    /// Decide whether an authentication attempt for `identifier` may go
    /// ahead, and how long it should be held first.
    ///
    /// Never counts the attempt. Store failures and panics fail open.
    pub async fn check_attempt(&self, identifier: &str) -> AttemptVerdict {
        let keys = self.keys(identifier);
        let outcome = AssertUnwindSafe(self.evaluate(&keys)).catch_unwind().await;

        match outcome {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                warn!(
                    identifier_hash = %keys.hash,
                    error = %e,
                    "Counter store failed, allowing authentication attempt"
                );
                self.open_verdict()
            }
            Err(_) => {
                warn!(
                    identifier_hash = %keys.hash,
                    "Attempt check panicked, allowing authentication attempt"
                );
                self.open_verdict()
            }
        }
    }

    async fn evaluate(&self, keys: &Keys) -> StoreResult<AttemptVerdict> {
        let now = self.clock.now_ms();

        let lockout = parse_i64(&keys.lockout, self.store.get(&keys.lockout).await?)?;
        if let Some(locked_until) = lockout {
            if locked_until > now {
                trace!(identifier_hash = %keys.hash, "Attempt rejected while locked");
                self.audit.record(AuditEvent::LockedAttemptRejected {
                    identifier_hash: keys.hash.clone(),
                    locked_until: to_datetime(locked_until),
                });
                return Ok(self.locked_verdict(locked_until, now));
            }

            // Expired but not yet evicted: start over.
            futures::try_join!(
                self.store.delete(&keys.lockout),
                self.store.delete(&keys.attempts)
            )?;
            debug!(identifier_hash = %keys.hash, "Cleared expired lockout");
        }

        let failures = parse_i64(&keys.attempts, self.store.get(&keys.attempts).await?)?
            .unwrap_or(0)
            .max(0) as u64;

        if failures >= u64::from(self.config.max_attempts) {
            let locked_until = self.lock(keys, failures as i64, now).await?;
            return Ok(self.locked_verdict(locked_until, now));
        }

        Ok(AttemptVerdict {
            allowed: true,
            attempts_remaining: self.attempts_remaining(failures),
            delay: self.delay_for(failures),
            locked_until: None,
            retry_after: None,
            message: None,
        })
    }

    /// Convert the attempt counter into a lockout.
    async fn lock(&self, keys: &Keys, failures: i64, now: i64) -> StoreResult<i64> {
        let locked_until = add_span(now, self.config.lockout_duration_ms);
        self.store
            .set(
                &keys.lockout,
                &locked_until.to_string(),
                self.config.lockout_duration(),
            )
            .await?;
        self.store.delete(&keys.attempts).await?;

        self.audit.record(AuditEvent::AccountLocked {
            identifier_hash: keys.hash.clone(),
            locked_until: to_datetime(locked_until),
            failed_attempts: failures,
        });
        Ok(locked_until)
    }

    /// Count a failed authentication for `identifier`.
    ///
    /// The counter and its TTL are written together, and the TTL is set only
    /// by the failure that creates the counter, so later failures cannot keep
    /// a window alive. Reaching `max_attempts` locks the
    /// identifier immediately. Store failures are logged and swallowed.
    pub async fn record_failed_attempt(&self, identifier: &str) {
        let keys = self.keys(identifier);
        if let Err(e) = self.try_record_failure(&keys).await {
            warn!(
                identifier_hash = %keys.hash,
                error = %e,
                "Failed to record authentication failure"
            );
        }
    }

    async fn try_record_failure(&self, keys: &Keys) -> StoreResult<()> {
        let failures = self
            .store
            .increment_with_expiry(&keys.attempts, self.config.window())
            .await?;

        debug!(
            identifier_hash = %keys.hash,
            failed_attempts = failures,
            max_attempts = self.config.max_attempts,
            "Recorded failed authentication attempt"
        );

        if failures >= i64::from(self.config.max_attempts) {
            self.lock(keys, failures, self.clock.now_ms()).await?;
        }
        Ok(())
    }

    /// Clear all protection state after a successful authentication.
    pub async fn record_successful_attempt(&self, identifier: &str) {
        let keys = self.keys(identifier);
        if let Err(e) = self.try_clear_after_success(&keys).await {
            warn!(
                identifier_hash = %keys.hash,
                error = %e,
                "Failed to clear attempt state after success"
            );
        }
    }

    async fn try_clear_after_success(&self, keys: &Keys) -> StoreResult<()> {
        let was_locked = self.store.get(&keys.lockout).await?.is_some();
        futures::try_join!(
            self.store.delete(&keys.attempts),
            self.store.delete(&keys.lockout)
        )?;

        if was_locked {
            self.audit.record(AuditEvent::AccountUnlocked {
                identifier_hash: keys.hash.clone(),
                reason: UnlockReason::SuccessfulLogin,
            });
        }
        debug!(identifier_hash = %keys.hash, "Attempt state cleared after success");
        Ok(())
    }

    /// Administrative override: clear attempts and any lockout.
    pub async fn unlock_account(&self, identifier: &str) -> StoreResult<()> {
        let keys = self.keys(identifier);
        futures::try_join!(
            self.store.delete(&keys.attempts),
            self.store.delete(&keys.lockout)
        )?;

        self.audit.record(AuditEvent::AccountUnlocked {
            identifier_hash: keys.hash,
            reason: UnlockReason::Administrative,
        });
        Ok(())
    }

    /// Current state of `identifier`, without changing it.
    pub async fn get_status(&self, identifier: &str) -> StoreResult<AttemptStatus> {
        let keys = self.keys(identifier);
        let now = self.clock.now_ms();

        let (lockout, attempts) = futures::try_join!(
            self.store.get(&keys.lockout),
            self.store.get(&keys.attempts)
        )?;
        let locked_until = parse_i64(&keys.lockout, lockout)?.filter(|until| *until > now);
        let attempts = parse_i64(&keys.attempts, attempts)?.unwrap_or(0).max(0) as u64;

        Ok(AttemptStatus {
            attempts,
            is_locked: locked_until.is_some(),
            locked_until: locked_until.map(to_datetime),
            attempts_remaining: if locked_until.is_some() {
                0
            } else {
                self.attempts_remaining(attempts)
            },
        })
    }

    /// Hold the calling task for `delay` before it checks credentials.
    ///
    /// Only the caller is suspended; other requests keep running.
    pub async fn apply_delay(delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ChannelAuditSink;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn scenario_config() -> BruteForceConfig {
        BruteForceConfig {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            window_ms: 900_000,
            lockout_duration_ms: 1_800_000,
            key_prefix: "bf".to_string(),
        }
    }

    fn protection(config: BruteForceConfig) -> (Arc<ManualClock>, BruteForceProtection) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let protection = BruteForceProtection::with_clock(store, config, clock.clone()).unwrap();
        (clock, protection)
    }

    #[test]
    fn test_identifier_hash_is_stable() {
        let a = identifier_hash("user@example.com:10.0.0.1");
        assert_eq!(a, identifier_hash("user@example.com:10.0.0.1"));
        assert_ne!(a, identifier_hash("other@example.com:10.0.0.1"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_delay_progression() {
        let (_, p) = protection(scenario_config());
        assert_eq!(p.delay_for(0), Duration::ZERO);
        assert_eq!(p.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(p.delay_for(4), Duration::from_millis(8_000));
        assert_eq!(p.delay_for(9), Duration::from_millis(256_000));
        assert_eq!(p.delay_for(10), Duration::from_millis(300_000));
        assert_eq!(p.delay_for(200), Duration::from_millis(300_000));
    }

    #[test]
    fn test_lockout_message() {
        assert_eq!(
            lockout_message(1_800_000, 0),
            "Too many failed attempts. Try again in 30 minutes."
        );
        assert_eq!(
            lockout_message(10_000, 0),
            "Too many failed attempts. Try again in 1 minute."
        );
    }

    #[tokio::test]
    async fn test_clean_slate_is_open() {
        let (_, p) = protection(scenario_config());
        let verdict = p.check_attempt("alice:10.0.0.1").await;

        assert!(verdict.allowed);
        assert_eq!(verdict.attempts_remaining, 5);
        assert_eq!(verdict.delay, Duration::ZERO);
        assert_eq!(verdict.locked_until, None);
    }

    #[tokio::test]
    async fn test_check_attempt_never_counts() {
        let (_, p) = protection(scenario_config());
        for _ in 0..20 {
            assert!(p.check_attempt("alice").await.allowed);
        }
        assert_eq!(p.get_status("alice").await.unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_failures_drive_delay_and_remaining() {
        let (_, p) = protection(scenario_config());

        p.record_failed_attempt("alice").await;
        p.record_failed_attempt("alice").await;
        p.record_failed_attempt("alice").await;

        let verdict = p.check_attempt("alice").await;
        assert!(verdict.allowed);
        assert_eq!(verdict.attempts_remaining, 2);
        assert_eq!(verdict.delay, Duration::from_millis(4_000));
    }

    #[tokio::test]
    async fn test_reaching_max_attempts_locks() {
        let (clock, p) = protection(scenario_config());
        let now = clock.now_ms();

        for _ in 0..5 {
            p.record_failed_attempt("alice").await;
        }

        let verdict = p.check_attempt("alice").await;
        assert!(!verdict.allowed);
        assert_eq!(verdict.attempts_remaining, 0);
        assert_eq!(
            verdict.locked_until.unwrap().timestamp_millis(),
            now + 1_800_000
        );
        assert_eq!(verdict.retry_after, Some(Duration::from_millis(1_800_000)));
        assert!(verdict.message.unwrap().contains("30 minutes"));

        let status = p.get_status("alice").await.unwrap();
        assert!(status.is_locked);
        assert_eq!(status.attempts, 0, "attempt counter is replaced by the lockout");
    }

    #[tokio::test]
    async fn test_lockout_takes_precedence_and_expires() {
        let (clock, p) = protection(scenario_config());
        for _ in 0..5 {
            p.record_failed_attempt("alice").await;
        }

        clock.advance(Duration::from_millis(1_799_999));
        assert!(!p.check_attempt("alice").await.allowed);

        clock.advance(Duration::from_millis(1));
        let verdict = p.check_attempt("alice").await;
        assert!(verdict.allowed);
        assert_eq!(verdict.attempts_remaining, 5);
        assert!(!p.get_status("alice").await.unwrap().is_locked);
    }

    #[tokio::test]
    async fn test_lazy_conversion_in_check() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let p = BruteForceProtection::with_clock(store.clone(), scenario_config(), clock).unwrap();

        // A counter pushed past the threshold without going through
        // record_failed_attempt, as concurrent increments can leave it.
        let attempts_key = p.keys("alice").attempts;
        for _ in 0..6 {
            store.increment(&attempts_key).await.unwrap();
        }

        let verdict = p.check_attempt("alice").await;
        assert!(!verdict.allowed);
        assert_eq!(store.get(&attempts_key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_window_ttl_set_only_on_first_failure() {
        let (clock, p) = protection(scenario_config());

        p.record_failed_attempt("alice").await;
        clock.advance(Duration::from_millis(899_000));
        p.record_failed_attempt("alice").await;
        assert_eq!(p.get_status("alice").await.unwrap().attempts, 2);

        // The window started with the first failure, not the latest one.
        clock.advance(Duration::from_millis(1_000));
        assert_eq!(p.get_status("alice").await.unwrap().attempts, 0);
    }

    /// Memory store whose expiry calls always time out.
    struct ExpiryTimesOut(MemoryStore);

    #[async_trait::async_trait]
    impl CounterStore for ExpiryTimesOut {
        async fn insert(&self, key: &str, ts: i64, token: &str) -> StoreResult<()> {
            self.0.insert(key, ts, token).await
        }
        async fn purge_before(&self, key: &str, cutoff: i64) -> StoreResult<u64> {
            self.0.purge_before(key, cutoff).await
        }
        async fn count(&self, key: &str) -> StoreResult<u64> {
            self.0.count(key).await
        }
        async fn oldest(&self, key: &str) -> StoreResult<Option<i64>> {
            self.0.oldest(key).await
        }
        async fn set_expiry(&self, _: &str, ttl: Duration) -> StoreResult<()> {
            Err(StoreError::Timeout(ttl.min(Duration::from_millis(250))))
        }
        async fn increment(&self, key: &str) -> StoreResult<i64> {
            self.0.increment(key).await
        }
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            self.0.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.0.delete(key).await
        }
        async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
            self.0.delete_prefix(prefix).await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn test_failed_expiry_never_leaves_an_endless_counter() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(ExpiryTimesOut(MemoryStore::new(clock.clone())));
        let p = BruteForceProtection::with_clock(store, scenario_config(), clock.clone()).unwrap();

        p.record_failed_attempt("alice").await;
        assert_eq!(p.get_status("alice").await.unwrap().attempts, 0);

        clock.advance(Duration::from_millis(10 * 900_000));
        assert_eq!(p.get_status("alice").await.unwrap().attempts, 0);
        assert!(p.check_attempt("alice").await.allowed);
    }

    #[tokio::test]
    async fn test_success_resets_everything() {
        let (_, p) = protection(scenario_config());
        for _ in 0..5 {
            p.record_failed_attempt("alice").await;
        }
        assert!(p.get_status("alice").await.unwrap().is_locked);

        p.record_successful_attempt("alice").await;

        let status = p.get_status("alice").await.unwrap();
        assert_eq!(status.attempts, 0);
        assert!(!status.is_locked);
        assert!(p.check_attempt("alice").await.allowed);
    }

    #[tokio::test]
    async fn test_unlock_account_emits_audit_event() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let (sink, mut rx) = ChannelAuditSink::new(16);
        let p = BruteForceProtection::with_clock(store, scenario_config(), clock)
            .unwrap()
            .with_audit_sink(Arc::new(sink));

        for _ in 0..5 {
            p.record_failed_attempt("alice").await;
        }
        assert!(matches!(
            rx.recv().await,
            Some(AuditEvent::AccountLocked { failed_attempts: 5, .. })
        ));

        p.unlock_account("alice").await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(AuditEvent::AccountUnlocked {
                reason: UnlockReason::Administrative,
                ..
            })
        ));
        assert!(p.check_attempt("alice").await.allowed);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let (_, p) = protection(scenario_config());
        for _ in 0..5 {
            p.record_failed_attempt("alice:10.0.0.1").await;
        }
        assert!(!p.check_attempt("alice:10.0.0.1").await.allowed);
        assert!(p.check_attempt("alice:10.0.0.2").await.allowed);
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
        let config = BruteForceConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(BruteForceProtection::new(store.clone(), config).is_err());

        let endless_lockout = BruteForceConfig {
            max_attempts: 1,
            lockout_duration_ms: i64::MAX as u64,
            ..Default::default()
        };
        assert!(BruteForceProtection::new(store, endless_lockout).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_delay_suspends_only_the_caller() {
        let start = tokio::time::Instant::now();
        let other = tokio::spawn(async { tokio::time::Instant::now() });

        BruteForceProtection::apply_delay(Duration::from_secs(4)).await;

        assert!(start.elapsed() >= Duration::from_secs(4));
        let other_ran_at = other.await.unwrap();
        assert!(other_ran_at - start < Duration::from_secs(4));
    }
}
