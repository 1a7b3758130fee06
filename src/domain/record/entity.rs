//! Record entity and its flat stored shape

use std::collections::HashSet;

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::error::StoreError;

/// Fields every record carries regardless of its declared model.
pub const BASE_FIELDS: &[&str] = &[
    "id",
    "ns",
    "type",
    "stereo",
    "sid",
    "uid",
    "gid",
    "lock",
    "next",
    "meta",
    "createdAt",
    "updatedAt",
    "deletedAt",
    "error",
];

/// Engine-managed fields: stripped from every diff, mutated only through
/// increments or dedicated lock/sequence operations.
pub const RESERVED_FIELDS: &[&str] = &["lock", "next"];

/// Stereotype prefix marking internal records (lookups, sequence counters).
pub const INTERNAL_MARK: char = '#';

static BASE_FIELD_SET: Lazy<HashSet<&'static str>> =
    Lazy::new(|| BASE_FIELDS.iter().copied().collect());

/// True when `name` is one of the base fields shared by all records.
pub fn is_base_field(name: &str) -> bool {
    BASE_FIELD_SET.contains(name)
}

/// Epoch milliseconds, the timestamp unit used across all records.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// `null` and `""` both mean "absent" in stored payloads.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// A stored entity: typed base fields plus an open bag of model fields.
///
/// The serialized form is a single flat JSON object; `fields` is flattened
/// into it and zero/empty members are omitted, so a record round-trips
/// through storage without carrying dead weight. `key` is derivation state
/// attached by the engine after reads and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Record {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ns: String,

    /// Model name. Plain data: key derivation uses the service-bound model,
    /// never this field.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    /// Stereotype tag; values starting with `#` mark internal records.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stereo: String,

    /// Session scope.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sid: String,

    /// Owning user.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Owning group.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gid: String,

    /// Advisory lock counter; 0 is free.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub lock: i64,

    /// Sequence counter for `#`-stereotyped counter records.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub next: i64,

    /// Overflow bag. Stored as a JSON-encoded string, decoded to its logical
    /// value after reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,

    #[serde(rename = "createdAt", default, skip_serializing_if = "is_zero")]
    pub created_at: i64,

    #[serde(rename = "updatedAt", default, skip_serializing_if = "is_zero")]
    pub updated_at: i64,

    #[serde(rename = "deletedAt", default, skip_serializing_if = "is_zero")]
    pub deleted_at: i64,

    /// Set when a read degraded (for example an undecodable meta payload).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Declared model fields, flattened into the record body.
    #[serde(flatten)]
    pub fields: Map<String, Value>,

    /// Derived storage key, attached by the engine after successful calls.
    #[serde(skip)]
    pub key: Option<String>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_stereo(mut self, stereo: impl Into<String>) -> Self {
        self.stereo = stereo.into();
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Internal records (lookups, counters) are invisible to sync listeners.
    pub fn is_internal(&self) -> bool {
        self.kind.starts_with(INTERNAL_MARK) || self.stereo.starts_with(INTERNAL_MARK)
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.deleted_at > 0
    }

    /// Decoded meta as an object, when it is one.
    pub fn meta_object(&self) -> Option<&Map<String, Value>> {
        self.meta.as_ref().and_then(Value::as_object)
    }
}

/// Serializes a record to its flat stored shape.
pub fn to_flat(record: &Record) -> Result<Map<String, Value>, StoreError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::backend(format!(
            "record serialized to non-object value: {other}"
        ))),
        Err(e) => Err(StoreError::backend(format!(
            "failed to serialize record: {e}"
        ))),
    }
}

/// Rebuilds a record from its flat stored shape.
pub fn from_flat(map: Map<String, Value>) -> Result<Record, StoreError> {
    serde_json::from_value(Value::Object(map))
        .map_err(|e| StoreError::backend(format!("failed to deserialize record: {e}")))
}
