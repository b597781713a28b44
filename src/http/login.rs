//! Brute-force protected credential checks.

use std::future::Future;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::Response;
use tracing::debug;

use super::response::{error_response, insert_retry_after};
use crate::bruteforce::{AttemptVerdict, BruteForceProtection};
use crate::clock::duration_ms;

/// Result of a guarded login.
#[derive(Debug)]
pub enum AuthOutcome<S> {
    /// Credentials were valid; carries whatever the verifier produced
    Authorized(S),
    /// Locked out or wrong credentials; the response is ready to return
    Denied(Response),
}

/// Runs credential checks inside the brute-force protocol.
///
/// Every call checks the identifier, waits out the progressive delay, runs
/// the verifier and then records the outcome, so callers cannot forget to
/// report a failure.
#[derive(Debug, Clone)]
pub struct LoginGuard {
    protection: Arc<BruteForceProtection>,
}

impl LoginGuard {
    pub fn new(protection: Arc<BruteForceProtection>) -> Self {
        Self { protection }
    }

    /// The protector behind this guard.
    pub fn protection(&self) -> &Arc<BruteForceProtection> {
        &self.protection
    }

    /// Check credentials for `identifier` with `verify`.
    ///
    /// `verify` returns `Some(session)` when the credentials are valid. It is
    /// not called at all while the identifier is locked.
    pub async fn authenticate<S, F, Fut>(&self, identifier: &str, verify: F) -> AuthOutcome<S>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<S>>,
    {
        let verdict = self.protection.check_attempt(identifier).await;
        if !verdict.allowed {
            return AuthOutcome::Denied(locked_response(&verdict));
        }

        BruteForceProtection::apply_delay(verdict.delay).await;

        match verify().await {
            Some(session) => {
                self.protection.record_successful_attempt(identifier).await;
                AuthOutcome::Authorized(session)
            }
            None => {
                self.protection.record_failed_attempt(identifier).await;
                debug!(
                    attempts_remaining = verdict.attempts_remaining.saturating_sub(1),
                    "Login rejected"
                );
                AuthOutcome::Denied(error_response(
                    StatusCode::UNAUTHORIZED,
                    "INVALID_CREDENTIALS",
                    "Invalid credentials",
                ))
            }
        }
    }
}

fn locked_response(verdict: &AttemptVerdict) -> Response {
    let message = verdict
        .message
        .clone()
        .unwrap_or_else(|| "Too many failed attempts.".to_string());
    let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "ACCOUNT_LOCKED", message);

    if let Some(remaining) = verdict.retry_after {
        insert_retry_after(response.headers_mut(), duration_ms(remaining).div_ceil(1000));
    }
    response
}
