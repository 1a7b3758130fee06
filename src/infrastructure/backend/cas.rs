//! Compare-and-set storage backend
//!
//! Write path for stores that only offer optimistic concurrency: read the
//! current version, compute the full next state, commit it only if nothing
//! moved underneath, retry on conflict. The [`CasStore`] seam carries the
//! store-specific watch/commit cycle; [`CasBackend`] owns record shaping and
//! the retry budget.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::domain::backend::{apply_patch, Increments, Patch, StorageBackend};
use crate::domain::record::{from_flat, to_flat, Record};
use crate::domain::retry::Backoff;
use crate::domain::StoreError;

/// Default retry budget for contended writes.
pub const DEFAULT_CAS_RETRIES: u32 = 5;

/// Next state for a key, decided by an apply closure from the current one.
#[derive(Debug, Clone, PartialEq)]
pub enum CasMutation {
    /// Commit this value.
    Put(Value),
    /// Remove the key.
    Delete,
    /// Leave the key untouched; still succeeds the cycle.
    Keep,
}

/// Result of one optimistic write cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The mutation landed; carries the value now stored under the key.
    Committed(Option<Value>),
    /// Another writer moved the key between watch and commit.
    Conflicted,
}

/// Computes the next state of a key from its current one. Runs once per
/// cycle, so it must be pure enough to repeat on conflict.
pub type ApplyFn<'a> = dyn Fn(Option<&Value>) -> Result<CasMutation, StoreError> + Send + Sync + 'a;

/// One key-value store able to run watched read-modify-write cycles.
#[async_trait]
pub trait CasStore: Send + Sync + Debug {
    /// Table name reported in errors and health checks.
    fn table(&self) -> &str;

    /// Plain read outside any transaction.
    async fn fetch(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Runs one watch/read/apply/commit cycle for `key`.
    async fn transact(&self, key: &str, apply: &ApplyFn<'_>) -> Result<CasOutcome, StoreError>;
}

/// Storage backend over any [`CasStore`].
///
/// Every mutating operation funnels through one retry loop: conflicts are
/// retried with jittered backoff up to the configured budget, then surface
/// as a transaction error. Errors raised by the apply closure itself abort
/// immediately.
#[derive(Debug)]
pub struct CasBackend<S> {
    store: S,
    retries: u32,
    backoff: Backoff,
}

impl<S: CasStore> CasBackend<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            retries: DEFAULT_CAS_RETRIES,
            backoff: Backoff::default_cas(),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn mutate(&self, key: &str, apply: &ApplyFn<'_>) -> Result<Option<Value>, StoreError> {
        for attempt in 1..=self.retries {
            match self.store.transact(key, apply).await? {
                CasOutcome::Committed(value) => {
                    if attempt > 1 {
                        debug!(key = %key, attempt, "committed after contention");
                    }
                    return Ok(value);
                }
                CasOutcome::Conflicted => {
                    debug!(key = %key, attempt, "concurrent write detected, retrying");
                    if attempt < self.retries {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }
        Err(StoreError::transaction(self.store.table(), key, self.retries))
    }

    fn decode(&self, key: &str, value: Value) -> Result<Record, StoreError> {
        match value {
            Value::Object(map) => from_flat(map),
            other => Err(StoreError::backend(format!(
                "malformed record at '{key}': {other}"
            ))),
        }
    }
}

#[async_trait]
impl<S: CasStore> StorageBackend for CasBackend<S> {
    async fn hello(&self) -> Result<String, StoreError> {
        Ok(format!("cas:{}", self.store.table()))
    }

    async fn read(&self, key: &str) -> Result<Record, StoreError> {
        match self.store.fetch(key).await? {
            Some(value) => self.decode(key, value),
            None => Err(StoreError::not_found(self.store.table(), key)),
        }
    }

    async fn read_or_create(&self, key: &str, model: &Record) -> Result<Record, StoreError> {
        let body = Value::Object(to_flat(model)?);
        let stored = self
            .mutate(key, &|current: Option<&Value>| match current {
                Some(_) => Ok(CasMutation::Keep),
                None => Ok(CasMutation::Put(body.clone())),
            })
            .await?;

        match stored {
            Some(value) => self.decode(key, value),
            None => Err(StoreError::backend(format!(
                "create committed nothing at '{key}'"
            ))),
        }
    }

    async fn save(&self, key: &str, model: &Record) -> Result<Record, StoreError> {
        let body = Value::Object(to_flat(model)?);
        self.mutate(key, &|_| Ok(CasMutation::Put(body.clone())))
            .await?;
        Ok(model.clone())
    }

    async fn update(
        &self,
        key: &str,
        patch: &Patch,
        increments: Option<&Increments>,
    ) -> Result<Record, StoreError> {
        let table = self.store.table().to_string();
        let stored = self
            .mutate(key, &|current: Option<&Value>| {
                let Some(Value::Object(flat)) = current else {
                    return Err(StoreError::not_found(&table, key));
                };
                let merged = apply_patch(flat.clone(), patch, increments)?;
                Ok(CasMutation::Put(Value::Object(merged)))
            })
            .await?;

        match stored {
            Some(value) => self.decode(key, value),
            None => Err(StoreError::backend(format!(
                "update committed nothing at '{key}'"
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let table = self.store.table().to_string();
        self.mutate(key, &|current: Option<&Value>| {
            if current.is_none() {
                return Err(StoreError::not_found(&table, key));
            }
            Ok(CasMutation::Delete)
        })
        .await?;
        Ok(())
    }
}

/// Process-local [`CasStore`].
///
/// The single mutex makes every cycle conflict-free, which is exactly the
/// behavior wanted in tests and development.
#[derive(Debug)]
pub struct MemoryCasStore {
    table: String,
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryCasStore {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCasStore {
    fn default() -> Self {
        Self::new("records")
    }
}

#[async_trait]
impl CasStore for MemoryCasStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn fetch(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::backend(format!("Failed to acquire lock: {}", e)))?;
        Ok(entries.get(key).cloned())
    }

    async fn transact(&self, key: &str, apply: &ApplyFn<'_>) -> Result<CasOutcome, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::backend(format!("Failed to acquire lock: {}", e)))?;

        let current = entries.get(key).cloned();
        match apply(current.as_ref())? {
            CasMutation::Put(value) => {
                entries.insert(key.to_string(), value.clone());
                Ok(CasOutcome::Committed(Some(value)))
            }
            CasMutation::Delete => {
                entries.remove(key);
                Ok(CasOutcome::Committed(None))
            }
            CasMutation::Keep => Ok(CasOutcome::Committed(current)),
        }
    }
}
