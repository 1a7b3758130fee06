//! Backend domain - Uniform persistence contract over record tables

mod repository;

pub use repository::{Increments, Patch, StorageBackend};

pub(crate) use repository::apply_patch;
