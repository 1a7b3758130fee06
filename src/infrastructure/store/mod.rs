//! Storage services - orchestration above the backend contract

mod proxy;
mod staging;
mod typed;
mod unique;

pub use proxy::{LockOptions, StorageProxy, DEFAULT_FAN_OUT, DEFAULT_SEQUENCE_BASE};
pub use staging::{CommitReport, StagedStore, UnitOfWork};
pub use typed::TypedStore;
pub use unique::{UniqueIndex, MAX_VALUE_LENGTH};
