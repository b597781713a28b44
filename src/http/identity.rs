//! Who is making a request.
//!
//! Client addresses are read from proxy headers in a fixed trust order:
//! the first `X-Forwarded-For` hop, then `X-Real-IP`, then the hosting
//! platform's own header. Requests carrying none of them share the
//! [`UNKNOWN_CLIENT`] identifier.

use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName};
use tracing::warn;

use crate::error::{GuardError, Result};

/// Client address used when no proxy header identifies the caller.
pub const UNKNOWN_CLIENT: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Request extension marking a caller with a verified session.
///
/// Inserted by whatever layer authenticates requests, before rate limiting
/// runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Stable user id
    pub id: String,
}

impl AuthenticatedUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Looks up the authenticated user behind a request.
pub trait IdentityResolver: Send + Sync {
    /// The authenticated user, or `None` for anonymous callers.
    fn resolve(&self, request: &Request) -> Option<AuthenticatedUser>;
}

/// Reads the [`AuthenticatedUser`] request extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtensionIdentity;

impl IdentityResolver for ExtensionIdentity {
    fn resolve(&self, request: &Request) -> Option<AuthenticatedUser> {
        request.extensions().get::<AuthenticatedUser>().cloned()
    }
}

/// Resolves client addresses from proxy headers.
#[derive(Debug)]
pub struct ClientAddress {
    platform_header: HeaderName,
    warned_unknown: AtomicBool,
}

impl ClientAddress {
    /// Trust `platform_header` as the last resort before giving up.
    pub fn new(platform_header: &str) -> Result<Self> {
        let platform_header = HeaderName::from_bytes(platform_header.as_bytes()).map_err(|e| {
            GuardError::Config(format!("invalid platform header '{}': {}", platform_header, e))
        })?;
        Ok(Self {
            platform_header,
            warned_unknown: AtomicBool::new(false),
        })
    }

    /// The caller's address, or [`UNKNOWN_CLIENT`].
    pub fn resolve(&self, headers: &HeaderMap) -> String {
        let forwarded = header_str(headers, X_FORWARDED_FOR)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());

        let address = forwarded
            .or_else(|| header_str(headers, X_REAL_IP))
            .or_else(|| header_str(headers, self.platform_header.as_str()));

        match address {
            Some(address) => address.to_string(),
            None => {
                if !self.warned_unknown.swap(true, Ordering::Relaxed) {
                    warn!(
                        platform_header = %self.platform_header,
                        "Request without client address headers; all such requests share the '{}' rate limit bucket",
                        UNKNOWN_CLIENT
                    );
                }
                UNKNOWN_CLIENT.to_string()
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Identifier for an anonymous caller.
pub fn ip_identifier(address: &str) -> String {
    format!("ip:{}", address)
}

/// Identifier for an authenticated caller.
pub fn user_identifier(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Identifier for a login attempt: the normalized credential together with
/// the client address, so one attacker cannot lock a victim out from
/// everywhere.
pub fn login_identifier(credential: &str, address: &str) -> String {
    format!("{}:{}", credential.trim().to_lowercase(), address)
}
