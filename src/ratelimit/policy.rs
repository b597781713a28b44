//! Rate limit policy configuration and verdicts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::MAX_SPAN_MS;
use crate::error::{GuardError, Result};

/// Window of the default policy applied to unauthenticated callers.
pub const ANONYMOUS_WINDOW_MS: u64 = 60_000;
/// Requests per window for unauthenticated callers.
pub const ANONYMOUS_MAX_REQUESTS: u64 = 100;
/// Window of the default policy applied to authenticated callers.
pub const AUTHENTICATED_WINDOW_MS: u64 = 3_600_000;
/// Requests per window for authenticated callers.
pub const AUTHENTICATED_MAX_REQUESTS: u64 = 500;

fn default_key_prefix() -> String {
    "rl".to_string()
}

/// A sliding-window limit: at most `max_requests` per trailing `window_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Length of the trailing window in milliseconds
    pub window_ms: u64,
    /// Requests allowed per window; zero denies everything
    pub max_requests: u64,
    /// Namespace for this policy's keys in the counter store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl RateLimitConfig {
    /// Create a new configuration.
    pub fn new(window_ms: u64, max_requests: u64, key_prefix: impl Into<String>) -> Self {
        Self {
            window_ms,
            max_requests,
            key_prefix: key_prefix.into(),
        }
    }

    /// Default policy for callers without a session.
    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS_WINDOW_MS, ANONYMOUS_MAX_REQUESTS, "rl:anon")
    }

    /// Default policy for callers with a session.
    pub fn authenticated() -> Self {
        Self::new(AUTHENTICATED_WINDOW_MS, AUTHENTICATED_MAX_REQUESTS, "rl:auth")
    }

    /// The window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Reject configurations with undefined semantics.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(GuardError::Config(format!(
                "rate limit '{}': window_ms must be greater than zero",
                self.key_prefix
            )));
        }
        if self.window_ms > MAX_SPAN_MS {
            return Err(GuardError::Config(format!(
                "rate limit '{}': window_ms must not exceed {} (one year)",
                self.key_prefix, MAX_SPAN_MS
            )));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(GuardError::Config(
                "rate limit key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Verdict of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The configured `max_requests`
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the earliest counted request leaves the window
    pub reset_at: DateTime<Utc>,
    /// Seconds to wait before retrying; only set on denial
    pub retry_after: Option<u64>,
}
