use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete framework configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Secret vault key derivation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Environment variable holding the master secret
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    /// PBKDF2 rounds (minimum 100,000)
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Fixed application salt (not secret)
    #[serde(default = "default_salt")]
    pub salt: String,
}

fn default_secret_env() -> String {
    "CONDUIT_MASTER_SECRET".to_string()
}

fn default_iterations() -> u32 {
    100_000
}

fn default_salt() -> String {
    "conduit-connector-vault-v1".to_string()
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            iterations: default_iterations(),
            salt: default_salt(),
        }
    }
}

/// Outbound HTTP settings (API connectors and token endpoints)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-call timeout for every backend call (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    "conduit-connector/1.0".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Bounded exponential backoff for transient backend failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    200
}

fn default_max_delay() -> u64 {
    2_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Connection pool settings for database connectors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: 0,
            acquire_timeout_secs: default_acquire_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Where an API connector looks for a result's total count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountSource {
    Header,
    Body,
}

/// Query validation and result shaping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    /// Hard cap; larger limits are rejected
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
    /// Count inference order for API connectors
    #[serde(default = "default_count_sources")]
    pub count_sources: Vec<CountSource>,
    #[serde(default = "default_count_headers")]
    pub count_headers: Vec<String>,
    #[serde(default = "default_count_fields")]
    pub count_fields: Vec<String>,
}

fn default_limit() -> u32 {
    100
}

fn default_max_limit() -> u32 {
    1_000
}

fn default_count_sources() -> Vec<CountSource> {
    vec![CountSource::Header, CountSource::Body]
}

fn default_count_headers() -> Vec<String> {
    vec!["x-total-count".to_string(), "x-total".to_string()]
}

fn default_count_fields() -> Vec<String> {
    vec!["total".to_string(), "count".to_string(), "totalCount".to_string()]
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            count_sources: default_count_sources(),
            count_headers: default_count_headers(),
            count_fields: default_count_fields(),
        }
    }
}

/// Persistence collaborator location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "connectors.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

impl ConduitConfig {
    /// Build from defaults, then apply env var overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Overrides individual settings from `CONDUIT_*` env vars.
    ///
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(n) = env_parse::<u64>("CONDUIT_HTTP_TIMEOUT_SECS") {
            self.http.request_timeout_secs = n;
        }
        if let Some(n) = env_parse::<u32>("CONDUIT_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = n;
        }
        if let Some(n) = env_parse::<u32>("CONDUIT_QUERY_MAX_LIMIT") {
            self.query.max_limit = n;
        }
        if let Some(n) = env_parse::<u32>("CONDUIT_DB_MAX_CONNECTIONS") {
            self.database.max_connections = n;
        }
        if let Some(n) = env_parse::<u32>("CONDUIT_PBKDF2_ITERATIONS") {
            self.vault.iterations = n;
        }
        if let Ok(path) = std::env::var("CONDUIT_STORAGE_PATH") {
            self.storage.path = path;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<ConduitConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config file {}", path))?;
    let config: ConduitConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
