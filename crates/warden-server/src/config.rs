//! Daemon configuration loading from file and environment variables.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use warden_db::DbRuntimeSettings;
use warden_domain::keypair::KeyUsage;
use warden_eventstore::{EventstoreConfig, RetryPolicy};
use warden_keys::KeySettings;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub eventstore: EventstoreSection,

    #[serde(default)]
    pub keys: KeysConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Milliseconds a writer waits for the database lock.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// Milliseconds a read or push waits for a free pooled connection.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

/// Event store tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct EventstoreSection {
    /// Push attempts on transient storage failures, including the first.
    #[serde(default = "default_push_retry_attempts")]
    pub push_retry_attempts: u32,

    #[serde(default = "default_push_retry_backoff_ms")]
    pub push_retry_backoff_ms: u64,

    /// Deadline for operations called without one; 0 disables it.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Events buffered between the database reader and a stream consumer.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

/// Background signing-key maintenance.
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between maintenance rounds; 0 runs a single round at startup.
    #[serde(default = "default_keys_interval_seconds")]
    pub interval_seconds: u64,

    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,

    #[serde(default = "default_keys_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_keys_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_key_lifetime_days")]
    pub key_lifetime_days: i64,

    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: i64,

    /// Instances whose keys are maintained. Empty means every instance
    /// holding an organization, looked up each round.
    #[serde(default)]
    pub instances: Vec<String>,

    #[serde(default = "default_key_usages")]
    pub usages: Vec<KeyUsage>,

    /// Hex-encoded 32-byte key sealing private keys at rest.
    #[serde(default)]
    pub encryption_key: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warden_eventstore=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_db_path() -> String {
    "warden.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    DbRuntimeSettings::default().busy_timeout_ms
}

fn default_pool_max_size() -> u32 {
    DbRuntimeSettings::default().pool_max_size
}

fn default_connection_timeout_ms() -> u64 {
    DbRuntimeSettings::default().connection_timeout_ms
}

fn default_push_retry_attempts() -> u32 {
    3
}

fn default_push_retry_backoff_ms() -> u64 {
    50
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_stream_buffer() -> usize {
    256
}

fn default_keys_interval_seconds() -> u64 {
    300
}

fn default_lock_duration_ms() -> u64 {
    5_000
}

fn default_keys_retry_attempts() -> u32 {
    3
}

fn default_keys_retry_backoff_ms() -> u64 {
    500
}

fn default_key_lifetime_days() -> i64 {
    365
}

fn default_grace_period_seconds() -> i64 {
    3_600
}

fn default_key_usages() -> Vec<KeyUsage> {
    KeyUsage::ALL.to_vec()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl Default for EventstoreSection {
    fn default() -> Self {
        Self {
            push_retry_attempts: default_push_retry_attempts(),
            push_retry_backoff_ms: default_push_retry_backoff_ms(),
            default_timeout_ms: default_timeout_ms(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: default_keys_interval_seconds(),
            lock_duration_ms: default_lock_duration_ms(),
            retry_attempts: default_keys_retry_attempts(),
            retry_backoff_ms: default_keys_retry_backoff_ms(),
            key_lifetime_days: default_key_lifetime_days(),
            grace_period_seconds: default_grace_period_seconds(),
            instances: Vec::new(),
            usages: default_key_usages(),
            encryption_key: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DatabaseConfig {
    pub fn runtime_settings(&self) -> DbRuntimeSettings {
        DbRuntimeSettings {
            busy_timeout_ms: self.busy_timeout_ms,
            pool_max_size: self.pool_max_size,
            connection_timeout_ms: self.connection_timeout_ms,
        }
    }
}

impl EventstoreSection {
    pub fn store_config(&self) -> EventstoreConfig {
        EventstoreConfig {
            push_retry: RetryPolicy::new(
                self.push_retry_attempts,
                Duration::from_millis(self.push_retry_backoff_ms),
            ),
            default_timeout: (self.default_timeout_ms > 0)
                .then(|| Duration::from_millis(self.default_timeout_ms)),
            stream_buffer: self.stream_buffer,
        }
    }
}

impl KeysConfig {
    pub fn settings(&self) -> KeySettings {
        KeySettings {
            lock_duration: Duration::from_millis(self.lock_duration_ms),
            retry: RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_backoff_ms)),
            key_lifetime: chrono::Duration::days(self.key_lifetime_days),
            grace_period: chrono::Duration::seconds(self.grace_period_seconds),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Longest key lifetime accepted, about a century.
pub const MAX_KEY_LIFETIME_DAYS: i64 = 36_500;

impl Config {
    /// Checks cross-field requirements the types cannot express.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.pool_max_size == 0 {
            return Err(ConfigError::Invalid("database.pool_max_size must be positive".into()));
        }
        if self.database.connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "database.connection_timeout_ms must be positive".into(),
            ));
        }
        if self.eventstore.stream_buffer == 0 {
            return Err(ConfigError::Invalid("eventstore.stream_buffer must be positive".into()));
        }
        if self.keys.enabled && self.keys.encryption_key.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Invalid(
                "keys.encryption_key is required when keys.enabled is set".into(),
            ));
        }
        if !(1..=MAX_KEY_LIFETIME_DAYS).contains(&self.keys.key_lifetime_days) {
            return Err(ConfigError::Invalid(format!(
                "keys.key_lifetime_days must be between 1 and {MAX_KEY_LIFETIME_DAYS}"
            )));
        }
        let lifetime_seconds = self.keys.key_lifetime_days * 86_400;
        if !(0..lifetime_seconds).contains(&self.keys.grace_period_seconds) {
            return Err(ConfigError::Invalid(
                "keys.grace_period_seconds must be non-negative and shorter than the key lifetime"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides (see [`apply_env_overrides`]) and
/// validates the result.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or the resulting configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

/// Applies environment variable overrides read through `lookup`.
///
/// - `WARDEN_DB_PATH` overrides `database.path`
/// - `WARDEN_DB_BUSY_TIMEOUT_MS` overrides `database.busy_timeout_ms`
/// - `WARDEN_DB_POOL_MAX_SIZE` overrides `database.pool_max_size`
/// - `WARDEN_DB_CONNECTION_TIMEOUT_MS` overrides `database.connection_timeout_ms`
/// - `WARDEN_KEYS_ENABLED` overrides `keys.enabled` ("true" or "1")
/// - `WARDEN_KEYS_INSTANCES` overrides `keys.instances` (comma-separated)
/// - `WARDEN_KEYS_ENCRYPTION_KEY` overrides `keys.encryption_key`
/// - `WARDEN_LOG_LEVEL` overrides `logging.level`
/// - `WARDEN_LOG_JSON` overrides `logging.json` ("true" or "1")
///
/// Unparseable numeric values are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("WARDEN_DB_PATH") {
        config.database.path = path;
    }
    if let Some(Ok(ms)) = lookup("WARDEN_DB_BUSY_TIMEOUT_MS").map(|v| v.parse()) {
        config.database.busy_timeout_ms = ms;
    }
    if let Some(Ok(size)) = lookup("WARDEN_DB_POOL_MAX_SIZE").map(|v| v.parse()) {
        config.database.pool_max_size = size;
    }
    if let Some(Ok(ms)) = lookup("WARDEN_DB_CONNECTION_TIMEOUT_MS").map(|v| v.parse()) {
        config.database.connection_timeout_ms = ms;
    }
    if let Some(enabled) = lookup("WARDEN_KEYS_ENABLED") {
        config.keys.enabled = is_truthy(&enabled);
    }
    if let Some(instances) = lookup("WARDEN_KEYS_INSTANCES") {
        config.keys.instances = instances
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(key) = lookup("WARDEN_KEYS_ENCRYPTION_KEY") {
        config.keys.encryption_key = Some(key);
    }
    if let Some(level) = lookup("WARDEN_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("WARDEN_LOG_JSON") {
        config.logging.json = is_truthy(&json);
    }
}

fn is_truthy(value: &str) -> bool {
    value == "true" || value == "1"
}
