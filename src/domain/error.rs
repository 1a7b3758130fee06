//! Storage error taxonomy

use thiserror::Error;

/// Core storage errors.
///
/// Every variant carries structured context; callers branch on the variant
/// (or the `is_*` helpers), never on message text. The rendered messages keep
/// the wire conventions REST layers expect (`404 NOT FOUND - table/key`,
/// `400 DUPLICATED NAME - ...`).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("404 NOT FOUND - {table}/{key}")]
    NotFound { table: String, key: String },

    #[error("400 BAD REQUEST - {message}")]
    Validation { message: String },

    #[error("400 DUPLICATED NAME - {field}[{value}] is duplicated to {kind}[{id}]")]
    Duplicate {
        field: String,
        value: String,
        kind: String,
        id: String,
    },

    #[error("409 LOCK TIMEOUT - {key} not acquired after {waited_ms}ms")]
    LockTimeout { key: String, waited_ms: u64 },

    #[error("500 TRANSACTION - {table}/{key} aborted after {attempts} attempts")]
    Transaction {
        table: String,
        key: String,
        attempts: u32,
    },

    #[error("400 TYPE MISMATCH - field '{field}' is not numeric")]
    FieldType { field: String },

    #[error("499 CANCELLED - {op}")]
    Cancelled { op: String },

    #[error("500 BACKEND - {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn not_found(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn duplicate(
        field: impl Into<String>,
        value: impl Into<String>,
        kind: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self::Duplicate {
            field: field.into(),
            value: value.into(),
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn lock_timeout(key: impl Into<String>, waited_ms: u64) -> Self {
        Self::LockTimeout {
            key: key.into(),
            waited_ms,
        }
    }

    pub fn transaction(table: impl Into<String>, key: impl Into<String>, attempts: u32) -> Self {
        Self::Transaction {
            table: table.into(),
            key: key.into(),
            attempts,
        }
    }

    pub fn field_type(field: impl Into<String>) -> Self {
        Self::FieldType {
            field: field.into(),
        }
    }

    pub fn cancelled(op: impl Into<String>) -> Self {
        Self::Cancelled { op: op.into() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// True for the variant `find`/`find_by_unique`/`get_multi` convert to `None`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction { .. })
    }
}
