//! Brute-force protection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::MAX_SPAN_MS;
use crate::error::{GuardError, Result};

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_window_ms() -> u64 {
    900_000
}

fn default_lockout_duration_ms() -> u64 {
    1_800_000
}

fn default_key_prefix() -> String {
    "bf".to_string()
}

/// Thresholds and timings for authentication attempt tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BruteForceConfig {
    /// Failures tolerated before a lockout
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failure; doubles with each further failure
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on the progressive delay
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// How long failures are remembered, counted from the first one
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// How long a lockout lasts
    #[serde(default = "default_lockout_duration_ms")]
    pub lockout_duration_ms: u64,
    /// Namespace for attempt and lockout keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            window_ms: default_window_ms(),
            lockout_duration_ms: default_lockout_duration_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl BruteForceConfig {
    /// Attempt-counting window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Lockout length.
    pub fn lockout_duration(&self) -> Duration {
        Duration::from_millis(self.lockout_duration_ms)
    }

    /// Reject configurations with undefined semantics.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(GuardError::Config(
                "brute_force.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.window_ms == 0 {
            return Err(GuardError::Config(
                "brute_force.window_ms must be greater than zero".to_string(),
            ));
        }
        if self.lockout_duration_ms == 0 {
            return Err(GuardError::Config(
                "brute_force.lockout_duration_ms must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("window_ms", self.window_ms),
            ("lockout_duration_ms", self.lockout_duration_ms),
            ("max_delay_ms", self.max_delay_ms),
        ] {
            if value > MAX_SPAN_MS {
                return Err(GuardError::Config(format!(
                    "brute_force.{} must not exceed {} (one year)",
                    name, MAX_SPAN_MS
                )));
            }
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(GuardError::Config(format!(
                "brute_force.base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.key_prefix.trim().is_empty() {
            return Err(GuardError::Config(
                "brute_force.key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
