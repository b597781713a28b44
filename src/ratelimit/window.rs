//! Sliding window entries and verdict arithmetic.

use uuid::Uuid;

use super::policy::{RateLimitConfig, RateLimitResult};
use crate::clock::{add_span, to_datetime};
use crate::store::WindowSnapshot;

/// One recorded request inside a sliding window.
///
/// The random token keeps two requests landing on the same millisecond from
/// collapsing into a single ordered-set member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    /// When the request was seen (Unix milliseconds)
    pub timestamp_ms: i64,
    /// Collision-avoidance token
    pub token: Uuid,
}

impl WindowEntry {
    /// Create an entry stamped at `timestamp_ms` with a fresh token.
    pub fn new(timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            token: Uuid::new_v4(),
        }
    }

    /// The ordered-set member stored for this entry.
    pub fn member(&self) -> String {
        format!("{}-{}", self.timestamp_ms, self.token.simple())
    }
}

fn ceil_secs(ms: i64) -> u64 {
    if ms <= 0 {
        0
    } else {
        (ms as u64).div_ceil(1000)
    }
}

/// Seconds until the earliest entry leaves the window, never less than one.
///
/// Without a readable entry the whole window is assumed.
pub fn retry_after_secs(oldest_ms: Option<i64>, window_ms: u64, now_ms: i64) -> u64 {
    let wait_ms = match oldest_ms {
        Some(oldest) => add_span(oldest, window_ms).saturating_sub(now_ms),
        None => add_span(0, window_ms),
    };
    ceil_secs(wait_ms).max(1)
}

/// Turn a window snapshot into a verdict. Counting is inclusive: exactly
/// `max_requests` entries are allowed.
pub fn evaluate(config: &RateLimitConfig, snapshot: WindowSnapshot, now_ms: i64) -> RateLimitResult {
    let allowed = snapshot.count <= config.max_requests;
    let remaining = config.max_requests.saturating_sub(snapshot.count);
    let reset_ms = add_span(snapshot.oldest_ms.unwrap_or(now_ms), config.window_ms);

    RateLimitResult {
        allowed,
        limit: config.max_requests,
        remaining,
        reset_at: to_datetime(reset_ms),
        retry_after: if allowed {
            None
        } else {
            Some(retry_after_secs(snapshot.oldest_ms, config.window_ms, now_ms))
        },
    }
}

/// The verdict returned when the store cannot be consulted: allow with the
/// full quota.
pub fn fail_open(config: &RateLimitConfig, now_ms: i64) -> RateLimitResult {
    RateLimitResult {
        allowed: true,
        limit: config.max_requests,
        remaining: config.max_requests,
        reset_at: to_datetime(add_span(now_ms, config.window_ms)),
        retry_after: None,
    }
}
