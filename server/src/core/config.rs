use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::cli::CliConfig;
use super::constants::{
    CONFIG_FILE_NAME, DEFAULT_KEY_PREFIX, DEFAULT_MAX_PAYLOAD_BYTES,
    DEFAULT_RATE_LIMIT_MAX_REQUESTS, DEFAULT_RATE_LIMIT_WINDOW_MS,
    DEFAULT_SLOW_CLIENT_THRESHOLD_MS, DEFAULT_STORE_DEADLINE_MS, DEFAULT_SUBSCRIBER_QUEUE_SIZE,
    DEFAULT_TOPIC_BUFFER_SIZE, ENV_DURABILITY, ENV_ENVIRONMENT, ENV_KEY_PREFIX,
    ENV_STORE_BACKEND, ENV_STORE_URL,
};

// =============================================================================
// Deploy Environment
// =============================================================================

/// Deploy environment; production enables the fail-closed safety guards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!(
                "Invalid environment '{other}' (expected: development, production)"
            )),
        }
    }
}

// =============================================================================
// Store Backend Enum
// =============================================================================

/// Shared store backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendType {
    #[default]
    Memory,
    Redis,
}

impl fmt::Display for StoreBackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackendType::Memory => write!(f, "memory"),
            StoreBackendType::Redis => write!(f, "redis"),
        }
    }
}

impl std::str::FromStr for StoreBackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackendType::Memory),
            "redis" => Ok(StoreBackendType::Redis),
            other => Err(format!(
                "Invalid store backend '{other}' (expected: memory, redis)"
            )),
        }
    }
}

// =============================================================================
// Store Config
// =============================================================================

/// Shared store connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend type (memory for single-process development, redis for replicas)
    pub backend: StoreBackendType,
    /// Redis-compatible URL, required for the redis backend
    pub url: Option<String>,
    /// Per-call deadline in milliseconds
    pub deadline_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendType::default(),
            url: None,
            deadline_ms: DEFAULT_STORE_DEADLINE_MS,
        }
    }
}

// =============================================================================
// Rate Limit Config
// =============================================================================

/// Sliding-window rate limit settings for the per-{principal, action} scope
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub max_requests: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            max_requests: DEFAULT_RATE_LIMIT_MAX_REQUESTS,
        }
    }
}

// =============================================================================
// Gateway Config
// =============================================================================

/// Event-plane configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Deploy environment
    pub environment: Environment,
    /// Key namespace prefix; all store keys are `{prefix}:…:{tenant}:{topic}`
    pub prefix: String,
    /// Durable stream cap per topic
    pub max_topic_buffer_size: u64,
    /// Per-subscriber bounded queue cap
    pub max_subscriber_queue_size: usize,
    /// Subscribers idle longer than this are reaped (milliseconds)
    pub slow_client_threshold_ms: u64,
    /// Gates the `fromSeq` replay path
    pub durability_enabled: bool,
    /// Maximum serialized payload size in bytes
    pub max_payload_bytes: usize,
    /// Per-{principal, action} rate limit
    pub rate_limit: RateLimitSettings,
    /// Allow running without authentication (rejected in production)
    pub allow_auth_disabled: bool,
    /// Shared store settings
    pub store: StoreConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_topic_buffer_size: DEFAULT_TOPIC_BUFFER_SIZE,
            max_subscriber_queue_size: DEFAULT_SUBSCRIBER_QUEUE_SIZE,
            slow_client_threshold_ms: DEFAULT_SLOW_CLIENT_THRESHOLD_MS,
            durability_enabled: false,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            rate_limit: RateLimitSettings::default(),
            allow_auth_disabled: false,
            store: StoreConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration: file (if present), then environment variables,
    /// then CLI flags, each layer overriding the previous.
    pub fn load(cli: &CliConfig) -> Result<Self> {
        let mut config = match Self::config_path(cli) {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        config.apply_env();
        config.apply_cli(cli);
        config.validate()?;

        Ok(config)
    }

    fn config_path(cli: &CliConfig) -> Option<PathBuf> {
        cli.config
            .clone()
            .or_else(|| Some(PathBuf::from(CONFIG_FILE_NAME)))
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(ENV_ENVIRONMENT)
            && let Ok(env) = v.parse()
        {
            self.environment = env;
        }
        if let Ok(v) = std::env::var(ENV_STORE_BACKEND)
            && let Ok(backend) = v.parse()
        {
            self.store.backend = backend;
        }
        if let Ok(v) = std::env::var(ENV_STORE_URL) {
            self.store.url = Some(v);
        }
        if let Ok(v) = std::env::var(ENV_KEY_PREFIX) {
            self.prefix = v;
        }
        if let Ok(v) = std::env::var(ENV_DURABILITY)
            && let Ok(enabled) = v.parse()
        {
            self.durability_enabled = enabled;
        }
    }

    fn apply_cli(&mut self, cli: &CliConfig) {
        if let Some(env) = cli.environment {
            self.environment = env;
        }
        if let Some(backend) = cli.store_backend {
            self.store.backend = backend;
        }
        if let Some(url) = &cli.store_url {
            self.store.url = Some(url.clone());
        }
        if let Some(prefix) = &cli.prefix {
            self.prefix = prefix.clone();
        }
        if let Some(durability) = cli.durability {
            self.durability_enabled = durability;
        }
        if cli.no_auth {
            self.allow_auth_disabled = true;
        }
    }

    /// Reject configurations that would weaken production deployments.
    pub fn validate(&self) -> Result<()> {
        if self.allow_auth_disabled && self.environment.is_production() {
            anyhow::bail!(
                "allowAuthDisabled is not permitted in the production environment"
            );
        }
        if self.store.backend == StoreBackendType::Redis && self.store.url.is_none() {
            anyhow::bail!("store.url is required for the redis store backend");
        }
        if self.prefix.is_empty() || self.prefix.contains(':') {
            anyhow::bail!("prefix must be non-empty and must not contain ':'");
        }
        if self.max_subscriber_queue_size == 0 {
            anyhow::bail!("maxSubscriberQueueSize must be at least 1");
        }
        Ok(())
    }
}
