//! Wall-clock abstraction.
//!
//! Window arithmetic and TTLs are expressed in Unix milliseconds. Production
//! code reads the system clock; tests drive a [`ManualClock`] so sliding-window
//! and lockout behaviour can be checked without sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Source of the current time in Unix milliseconds.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Longest window or lockout a configuration may ask for: one year.
pub const MAX_SPAN_MS: u64 = 365 * 24 * 60 * 60 * 1000;

fn span_as_i64(span_ms: u64) -> i64 {
    i64::try_from(span_ms).unwrap_or(i64::MAX)
}

/// `now_ms + span_ms`, saturating at the ends of the timeline.
pub fn add_span(now_ms: i64, span_ms: u64) -> i64 {
    now_ms.saturating_add(span_as_i64(span_ms))
}

/// `now_ms - span_ms`, saturating at the ends of the timeline.
pub fn sub_span(now_ms: i64, span_ms: u64) -> i64 {
    now_ms.saturating_sub(span_as_i64(span_ms))
}

/// Milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Convert Unix milliseconds into a UTC timestamp, clamping values chrono
/// cannot represent to the epoch.
pub fn to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_default()
}
