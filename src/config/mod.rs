//! Engine configuration

mod store_config;

pub use store_config::{
    BackendSettings, LockSettings, LogFormat, LoggingConfig, RedisSettings, StoreConfig,
};
