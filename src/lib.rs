//! Record Store
//!
//! Backend-agnostic storage engine for multi-tenant typed records:
//! - Deterministic keys (`namespace/type/id`) over a flat key-value table
//! - Minimal-diff writes with undeclared fields folded into `meta`
//! - Unique field claims arbitrated through lookup records
//! - Counter-backed id sequences and cooperative advisory locks
//! - Staged mutations flushed with bounded parallelism

pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::StoreConfig;
pub use domain::{ModelSpec, Record, StoreError};
pub use infrastructure::store::{LockOptions, TypedStore, UnitOfWork};

use std::sync::Arc;

use tracing::info;

use domain::record::KeyMaker;
use domain::StorageBackend;
use infrastructure::backend::BackendFactory;
use infrastructure::store::StorageProxy;

/// Handle to one configured engine: a backend, a namespace and the services
/// layered on top. Clones share the backend.
#[derive(Debug, Clone)]
pub struct Store {
    proxy: Arc<StorageProxy>,
}

impl Store {
    /// Builds the engine described by `config`. The Redis backend connects
    /// here; in-memory backends are ready immediately.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let backend = BackendFactory::create(&config.backend_config()?, &config.table).await?;
        let store = Self::with_backend(backend, config)?;
        info!(
            namespace = %config.namespace,
            table = %config.table,
            backend = %config.backend.kind,
            "store connected"
        );
        Ok(store)
    }

    /// Builds the engine on an already-constructed backend. Fails when the
    /// configured key scheme is rejected (see [`KeyMaker::new`]).
    pub fn with_backend(
        backend: Arc<dyn StorageBackend>,
        config: &StoreConfig,
    ) -> Result<Self, StoreError> {
        let keys = KeyMaker::new(config.namespace.as_str(), config.delimiter)?;
        let proxy = StorageProxy::new(backend, keys)
            .with_sequence_base(config.sequence_base)
            .with_fan_out(config.fan_out);
        Ok(Self {
            proxy: Arc::new(proxy),
        })
    }

    /// The shared orchestration layer beneath the typed surfaces.
    pub fn proxy(&self) -> Arc<StorageProxy> {
        self.proxy.clone()
    }

    /// Storage surface for one model.
    pub fn typed(&self, spec: &'static ModelSpec) -> TypedStore {
        TypedStore::new(self.proxy.clone(), spec)
    }

    /// Starts an empty unit of work on this engine.
    pub fn unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::new(self.proxy.clone())
    }

    /// Backend reachability check; returns the backend's banner.
    pub async fn hello(&self) -> Result<String, StoreError> {
        self.proxy.hello().await
    }
}
