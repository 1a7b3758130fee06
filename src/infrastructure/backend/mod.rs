//! Backend infrastructure - Storage backend implementations

mod cas;
mod factory;
mod memory;
mod redis;

pub use cas::{
    ApplyFn, CasBackend, CasMutation, CasOutcome, CasStore, MemoryCasStore, DEFAULT_CAS_RETRIES,
};
pub use factory::{BackendConfig, BackendFactory, BackendKind};
pub use memory::MemoryBackend;
pub use redis::{RedisCasStore, RedisStoreConfig};
