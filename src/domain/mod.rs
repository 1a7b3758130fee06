//! Domain layer - Records, model descriptors, storage contracts and errors

pub mod backend;
pub mod error;
pub mod record;
pub mod retry;
pub mod sync;

pub use backend::{Increments, Patch, StorageBackend};
pub use error::StoreError;
pub use record::{KeyMaker, ModelFilter, ModelSpec, Record, RecordKey};
pub use retry::Backoff;
pub use sync::{dispatch, is_syncable, ChangeEvent, ChangeKind, ChangeListener};
