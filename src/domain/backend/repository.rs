//! Storage backend trait definition

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::error::StoreError;
use crate::domain::record::{is_blank, Record};

/// Partial record update: member name to new value, blanks clear.
pub type Patch = Map<String, Value>;

/// Atomic counter deltas keyed by field name.
pub type Increments = BTreeMap<String, i64>;

/// Uniform persistence contract over a single table of records.
///
/// Backends store whole records keyed by an opaque string and know nothing
/// about models, diffs or key derivation; that shaping happens above them.
/// `read_or_create`, `update` and `increment` are atomic per key.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Identifies the live backend (used by health checks).
    async fn hello(&self) -> Result<String, StoreError>;

    /// Retrieves the record at `key`, failing when it does not exist.
    async fn read(&self, key: &str) -> Result<Record, StoreError>;

    /// Returns the record at `key`, storing `model` first when absent.
    /// Never overwrites an existing record.
    async fn read_or_create(&self, key: &str, model: &Record) -> Result<Record, StoreError>;

    /// Stores `model` at `key` unconditionally, replacing any prior record.
    async fn save(&self, key: &str, model: &Record) -> Result<Record, StoreError>;

    /// Merges `patch` (and optional counter deltas) into the existing record,
    /// failing when it does not exist.
    async fn update(
        &self,
        key: &str,
        patch: &Patch,
        increments: Option<&Increments>,
    ) -> Result<Record, StoreError>;

    /// Atomically adds the given deltas to numeric fields, failing when the
    /// record does not exist.
    async fn increment(&self, key: &str, fields: &Increments) -> Result<Record, StoreError> {
        self.update(key, &Patch::new(), Some(fields)).await
    }

    /// Physically removes the record at `key`, failing when it does not exist.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Merges a patch and counter deltas into a record's flat stored shape.
///
/// Blank values are dropped after the merge so the stored form never carries
/// empty members. Increments treat a missing or null field as 0 and reject
/// non-numeric ones.
pub(crate) fn apply_patch(
    mut flat: Map<String, Value>,
    patch: &Patch,
    increments: Option<&Increments>,
) -> Result<Map<String, Value>, StoreError> {
    for (name, value) in patch {
        flat.insert(name.clone(), value.clone());
    }

    if let Some(increments) = increments {
        for (field, delta) in increments {
            let current = match flat.get(field) {
                None | Some(Value::Null) => 0,
                Some(Value::Number(n)) => n
                    .as_i64()
                    .ok_or_else(|| StoreError::field_type(field.clone()))?,
                Some(_) => return Err(StoreError::field_type(field.clone())),
            };
            flat.insert(field.clone(), Value::from(current + delta));
        }
    }

    flat.retain(|_, value| !is_blank(value));
    Ok(flat)
}
