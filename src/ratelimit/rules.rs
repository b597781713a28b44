//! Policy selection for inbound requests.
//!
//! Callers fall into one of two named default policies, Anonymous and
//! Authenticated, unless an endpoint rule matches the request path. Endpoint
//! rules match by path prefix on segment boundaries and the most specific
//! (longest) rule wins.
//!
//! # Example YAML Configuration
//!
//! ```yaml
//! anonymous:
//!   window_ms: 60000
//!   max_requests: 100
//! endpoints:
//!   - path: /auth/login
//!     window_ms: 900000
//!     max_requests: 10
//!     key_prefix: rl:login
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::limiter::RateLimiter;
use super::policy::RateLimitConfig;
use crate::clock::Clock;
use crate::error::{GuardError, Result};
use crate::store::CounterStore;

/// A limit bound to a path prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    /// Path prefix, e.g. `/auth/login` or `/api/uploads`
    pub path: String,
    /// The limit applied to matching requests
    #[serde(flatten)]
    pub limit: RateLimitConfig,
}

impl EndpointRule {
    /// Whether `path` falls under this rule.
    pub fn matches(&self, path: &str) -> bool {
        let prefix = self.path.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Declarative policy set, as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy for callers without a session
    #[serde(default = "RateLimitConfig::anonymous")]
    pub anonymous: RateLimitConfig,
    /// Policy for callers with a session
    #[serde(default = "RateLimitConfig::authenticated")]
    pub authenticated: RateLimitConfig,
    /// Per-endpoint overrides
    #[serde(default)]
    pub endpoints: Vec<EndpointRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            anonymous: RateLimitConfig::anonymous(),
            authenticated: RateLimitConfig::authenticated(),
            endpoints: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load policies from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(format!("Failed to parse rate limit policies: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every policy in the set.
    pub fn validate(&self) -> Result<()> {
        self.anonymous.validate()?;
        self.authenticated.validate()?;
        for rule in &self.endpoints {
            if !rule.path.starts_with('/') {
                return Err(GuardError::Config(format!(
                    "endpoint rule path '{}' must start with '/'",
                    rule.path
                )));
            }
            rule.limit.validate()?;
        }
        Ok(())
    }

    /// Find the most specific endpoint rule for `path`.
    pub fn find_endpoint(&self, path: &str) -> Option<&EndpointRule> {
        self.endpoints
            .iter()
            .filter(|rule| rule.matches(path))
            .max_by_key(|rule| rule.path.trim_end_matches('/').len())
    }
}

/// Which policy a request was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// The Anonymous default
    Anonymous,
    /// The Authenticated default
    Authenticated,
    /// An endpoint override
    Endpoint,
}

/// A policy picked for one request: the limiter to consult and the endpoint
/// name to count under.
#[derive(Debug)]
pub struct SelectedPolicy<'a> {
    /// Which policy matched
    pub kind: PolicyKind,
    /// The limiter enforcing it
    pub limiter: &'a RateLimiter,
    /// Endpoint component of the window key
    pub endpoint: &'a str,
}

/// Runtime policy set: one limiter per policy, all sharing a store.
#[derive(Debug)]
pub struct Policies {
    anonymous: RateLimiter,
    authenticated: RateLimiter,
    endpoints: Vec<(EndpointRule, RateLimiter)>,
}

impl Policies {
    /// Build limiters for every policy in `config`.
    pub fn build(
        config: &PolicyConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let anonymous =
            RateLimiter::with_clock(store.clone(), config.anonymous.clone(), clock.clone())?;
        let authenticated =
            RateLimiter::with_clock(store.clone(), config.authenticated.clone(), clock.clone())?;

        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for rule in &config.endpoints {
            let limiter = RateLimiter::with_clock(store.clone(), rule.limit.clone(), clock.clone())?;
            endpoints.push((rule.clone(), limiter));
        }

        Ok(Self {
            anonymous,
            authenticated,
            endpoints,
        })
    }

    /// Pick the policy for a request to `path`.
    ///
    /// An endpoint rule counts every path under it in one window named after
    /// the rule; the defaults count per `route`.
    pub fn select<'a>(&'a self, route: &'a str, authenticated: bool) -> SelectedPolicy<'a> {
        let rule = self
            .endpoints
            .iter()
            .filter(|(rule, _)| rule.matches(route))
            .max_by_key(|(rule, _)| rule.path.trim_end_matches('/').len());

        match rule {
            Some((rule, limiter)) => SelectedPolicy {
                kind: PolicyKind::Endpoint,
                limiter,
                endpoint: &rule.path,
            },
            None if authenticated => SelectedPolicy {
                kind: PolicyKind::Authenticated,
                limiter: &self.authenticated,
                endpoint: route,
            },
            None => SelectedPolicy {
                kind: PolicyKind::Anonymous,
                limiter: &self.anonymous,
                endpoint: route,
            },
        }
    }

    /// Every limiter in the set, defaults first.
    pub fn limiters(&self) -> impl Iterator<Item = &RateLimiter> {
        [&self.anonymous, &self.authenticated]
            .into_iter()
            .chain(self.endpoints.iter().map(|(_, limiter)| limiter))
    }
}
