//! Backend factory for runtime backend selection

use std::sync::Arc;

use crate::domain::retry::Backoff;
use crate::domain::{StorageBackend, StoreError};

use super::cas::{CasBackend, MemoryCasStore, DEFAULT_CAS_RETRIES};
use super::memory::MemoryBackend;
use super::redis::{RedisCasStore, RedisStoreConfig};

/// Supported backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Plain in-memory table (for testing/development)
    Memory,
    /// In-memory store behind the compare-and-set write path
    MemoryCas,
    /// Redis behind the compare-and-set write path
    Redis,
}

impl BackendKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "inmemory" | "in-memory" | "in_memory" => Some(Self::Memory),
            "memory-cas" | "memory_cas" | "cas" => Some(Self::MemoryCas),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }
}

/// Backend configuration
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// In-memory table configuration
    Memory,
    /// Compare-and-set over an in-memory store
    MemoryCas { retries: u32, backoff: Backoff },
    /// Compare-and-set over Redis
    Redis {
        store: RedisStoreConfig,
        retries: u32,
        backoff: Backoff,
    },
}

impl BackendConfig {
    /// Creates an in-memory backend configuration
    pub fn memory() -> Self {
        Self::Memory
    }

    /// Creates an in-memory compare-and-set configuration
    pub fn memory_cas() -> Self {
        Self::MemoryCas {
            retries: DEFAULT_CAS_RETRIES,
            backoff: Backoff::default_cas(),
        }
    }

    /// Creates a Redis configuration
    pub fn redis(store: RedisStoreConfig) -> Self {
        Self::Redis {
            store,
            retries: DEFAULT_CAS_RETRIES,
            backoff: Backoff::default_cas(),
        }
    }

    /// Creates a Redis configuration from a URL
    pub fn redis_url(url: impl Into<String>) -> Self {
        Self::redis(RedisStoreConfig::new(url))
    }

    /// Sets the conflict retry budget on compare-and-set variants
    pub fn with_retries(mut self, n: u32) -> Self {
        match &mut self {
            Self::MemoryCas { retries, .. } | Self::Redis { retries, .. } => *retries = n,
            Self::Memory => {}
        }
        self
    }

    /// Sets the conflict backoff on compare-and-set variants
    pub fn with_backoff(mut self, b: Backoff) -> Self {
        match &mut self {
            Self::MemoryCas { backoff, .. } | Self::Redis { backoff, .. } => *backoff = b,
            Self::Memory => {}
        }
        self
    }

    /// Returns the backend kind
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Memory => BackendKind::Memory,
            Self::MemoryCas { .. } => BackendKind::MemoryCas,
            Self::Redis { .. } => BackendKind::Redis,
        }
    }
}

/// Factory for creating backend instances
#[derive(Debug)]
pub struct BackendFactory;

impl BackendFactory {
    /// Creates a backend instance based on the configuration.
    ///
    /// `table` names the logical table everywhere (errors, health checks,
    /// Redis key prefixes) and overrides any table set in a nested config.
    pub async fn create(
        config: &BackendConfig,
        table: &str,
    ) -> Result<Arc<dyn StorageBackend>, StoreError> {
        match config {
            BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new(table))),
            BackendConfig::MemoryCas { retries, backoff } => Ok(Arc::new(
                CasBackend::new(MemoryCasStore::new(table))
                    .with_retries(*retries)
                    .with_backoff(*backoff),
            )),
            BackendConfig::Redis {
                store,
                retries,
                backoff,
            } => {
                let store = RedisCasStore::new(store.clone().with_table(table)).await?;
                Ok(Arc::new(
                    CasBackend::new(store)
                        .with_retries(*retries)
                        .with_backoff(*backoff),
                ))
            }
        }
    }

    /// Creates an in-memory backend
    pub fn create_memory(table: &str) -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend::new(table))
    }

    /// Creates a Redis backend
    pub async fn create_redis(
        config: &RedisStoreConfig,
    ) -> Result<Arc<CasBackend<RedisCasStore>>, StoreError> {
        let store = RedisCasStore::new(config.clone()).await?;
        Ok(Arc::new(CasBackend::new(store)))
    }
}
