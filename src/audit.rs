//! Fire-and-forget audit trail for security-relevant events.
//!
//! Sinks take events by value and return nothing: a slow or broken sink can
//! drop events but can never change a verdict that has already been made.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Why a lockout was lifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnlockReason {
    /// An operator cleared it
    Administrative,
    /// The account owner authenticated successfully
    SuccessfulLogin,
}

/// A security-relevant event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Too many failures: the identifier is now locked
    AccountLocked {
        identifier_hash: String,
        locked_until: DateTime<Utc>,
        failed_attempts: i64,
    },
    /// An attempt arrived while the identifier was locked
    LockedAttemptRejected {
        identifier_hash: String,
        locked_until: DateTime<Utc>,
    },
    /// A lockout was removed before it expired
    AccountUnlocked {
        identifier_hash: String,
        reason: UnlockReason,
    },
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    /// Hand an event to the sink. Must not block.
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "audit", event = %json, "Security event"),
            Err(e) => debug!(error = %e, "Failed to serialize audit event"),
        }
    }
}

/// Forwards audit events into a bounded channel; events are dropped when the
/// channel is full or closed.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Create a sink and the receiver that drains it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!(error = %e, "Audit event dropped");
        }
    }
}
