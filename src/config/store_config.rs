use std::time::Duration;

use serde::Deserialize;

use crate::domain::{Backoff, StoreError};
use crate::infrastructure::backend::{
    BackendConfig, BackendKind, RedisStoreConfig, DEFAULT_CAS_RETRIES,
};
use crate::infrastructure::store::{LockOptions, DEFAULT_FAN_OUT, DEFAULT_SEQUENCE_BASE};

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Tenant namespace stamped into every derived key.
    pub namespace: String,
    /// Logical table holding the records.
    pub table: String,
    /// Separator between key segments.
    pub delimiter: char,
    pub backend: BackendSettings,
    /// The first id drawn from a fresh sequence is `sequence_base + 1`.
    pub sequence_base: i64,
    /// Parallelism bound for multi-record reads and commits.
    pub fan_out: usize,
    pub lock: LockSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// One of `memory`, `memory-cas`, `redis`.
    pub kind: String,
    /// Compare-and-set retry budget.
    pub retries: u32,
    /// Jittered backoff window between retries, in milliseconds.
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub redis: RedisSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    pub connection_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Poll attempts after the initial one.
    pub ticks: u32,
    /// Delay between polls, in milliseconds.
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "local".to_string(),
            table: "records".to_string(),
            delimiter: '/',
            backend: BackendSettings::default(),
            sequence_base: DEFAULT_SEQUENCE_BASE,
            fan_out: DEFAULT_FAN_OUT,
            lock: LockSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: "memory".to_string(),
            retries: DEFAULT_CAS_RETRIES,
            backoff_base_ms: 20,
            backoff_cap_ms: 200,
            redis: RedisSettings::default(),
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connection_timeout_ms: 5_000,
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ticks: 10,
            interval_ms: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl StoreConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("STORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Maps the declarative backend section onto a [`BackendConfig`].
    pub fn backend_config(&self) -> Result<BackendConfig, StoreError> {
        let kind = BackendKind::from_str(&self.backend.kind).ok_or_else(|| {
            StoreError::validation(format!("unknown backend kind '{}'", self.backend.kind))
        })?;
        let backoff = Backoff::jittered_ms(
            self.backend.backoff_base_ms,
            self.backend.backoff_cap_ms,
        );

        let config = match kind {
            BackendKind::Memory => BackendConfig::memory(),
            BackendKind::MemoryCas => BackendConfig::memory_cas()
                .with_retries(self.backend.retries)
                .with_backoff(backoff),
            BackendKind::Redis => BackendConfig::redis(
                RedisStoreConfig::new(&self.backend.redis.url)
                    .with_table(&self.table)
                    .with_connection_timeout(Duration::from_millis(
                        self.backend.redis.connection_timeout_ms,
                    )),
            )
            .with_retries(self.backend.retries)
            .with_backoff(backoff),
        };
        Ok(config)
    }

    /// Advisory-lock polling defaults for this deployment.
    pub fn lock_options(&self) -> LockOptions {
        LockOptions::new(self.lock.ticks, Duration::from_millis(self.lock.interval_ms))
    }
}
