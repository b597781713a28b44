//! Configuration management for Gatekeeper.
//!
//! Settings are read from an optional YAML or TOML file and then overlaid with
//! `GATEKEEPER__*` environment variables, e.g.
//! `GATEKEEPER__STORE__URL=redis://cache:6379`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bruteforce::BruteForceConfig;
use crate::error::{GuardError, Result};
use crate::ratelimit::PolicyConfig;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Brute-force protection configuration
    #[serde(default)]
    pub brute_force: BruteForceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Static credentials accepted by the demo login route
    #[serde(default)]
    pub users: HashMap<String, String>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Public API address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Admin API address
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; only for single-instance deployments and tests
    #[default]
    Memory,
    /// Shared Redis store
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Upper bound on a single store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the memory backend evicts expired keys, in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            timeout_ms: default_store_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Inline policies, used when `policies_path` is unset
    #[serde(default)]
    pub policies: PolicyConfig,

    /// Path to a YAML policy file
    #[serde(default)]
    pub policies_path: Option<PathBuf>,

    /// Add `X-RateLimit-*` headers to allowed responses
    #[serde(default = "default_expose_headers")]
    pub expose_headers: bool,

    /// Header set by the hosting platform's edge proxy with the client address
    #[serde(default = "default_platform_header")]
    pub platform_header: String,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            policies: PolicyConfig::default(),
            policies_path: None,
            expose_headers: default_expose_headers(),
            platform_header: default_platform_header(),
        }
    }
}

fn default_expose_headers() -> bool {
    true
}

fn default_platform_header() -> String {
    "cf-connecting-ip".to_string()
}

impl RateLimitingConfig {
    /// The effective policy set: the policy file when one is configured,
    /// otherwise the inline policies.
    pub fn resolve_policies(&self) -> Result<PolicyConfig> {
        match &self.policies_path {
            Some(path) => PolicyConfig::from_file(path),
            None => {
                self.policies.validate()?;
                Ok(self.policies.clone())
            }
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GuardConfig {
    /// Load configuration from an optional file layered with environment
    /// variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: GuardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GuardError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GuardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.store.timeout_ms == 0 {
            return Err(GuardError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(GuardError::Config(
                "store.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.trim().is_empty() {
            return Err(GuardError::Config(
                "store.url is required for the redis backend".to_string(),
            ));
        }
        if axum::http::HeaderName::from_bytes(self.rate_limiting.platform_header.as_bytes())
            .is_err()
        {
            return Err(GuardError::Config(format!(
                "rate_limiting.platform_header '{}' is not a valid header name",
                self.rate_limiting.platform_header
            )));
        }
        if self.rate_limiting.policies_path.is_none() {
            self.rate_limiting.policies.validate()?;
        }
        self.brute_force.validate()?;
        Ok(())
    }
}
