//! Typed store - one model's full storage surface
//!
//! Binds a [`StorageProxy`] to a single [`ModelSpec`] and layers the
//! model-level behavior on top: sequence-assigned inserts, unique field
//! claims and cleanup, soft and hard deletes, and the lock guard.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{info, warn};

use crate::domain::backend::{Increments, Patch};
use crate::domain::record::{ModelSpec, Record};
use crate::domain::StoreError;

use super::proxy::{LockOptions, StorageProxy};
use super::unique::UniqueIndex;

/// Storage service for records of one model.
#[derive(Debug, Clone)]
pub struct TypedStore {
    proxy: Arc<StorageProxy>,
    spec: &'static ModelSpec,
    unique: Option<UniqueIndex>,
}

impl TypedStore {
    pub fn new(proxy: Arc<StorageProxy>, spec: &'static ModelSpec) -> Self {
        let unique = spec
            .unique
            .map(|field| UniqueIndex::new(proxy.clone(), spec, field));
        Self {
            proxy,
            spec,
            unique,
        }
    }

    pub fn spec(&self) -> &'static ModelSpec {
        self.spec
    }

    pub fn unique(&self) -> Option<&UniqueIndex> {
        self.unique.as_ref()
    }

    /// Reads the record at `id`, failing when it does not exist.
    pub async fn read(&self, id: &str) -> Result<Record, StoreError> {
        self.proxy.do_read(self.spec, id).await
    }

    /// Reads the record at `id`, `None` when it does not exist.
    pub async fn find(&self, id: &str) -> Result<Option<Record>, StoreError> {
        match self.proxy.do_read(self.spec, id).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads records for all `ids` concurrently, bounded by the proxy
    /// fan-out. Results line up with the input; missing records are `None`.
    pub async fn get_multi<S: AsRef<str>>(
        &self,
        ids: &[S],
    ) -> Result<Vec<Option<Record>>, StoreError> {
        stream::iter(ids.iter().map(|id| self.find(id.as_ref())))
            .buffered(self.proxy.fan_out())
            .try_collect()
            .await
    }

    /// Returns the record at `id`, creating it from `model` when absent.
    pub async fn read_or_create(&self, id: &str, model: &Record) -> Result<Record, StoreError> {
        self.proxy.do_read_or_create(self.spec, id, model).await
    }

    /// Stores `model` at `id`, replacing any prior record and keeping the
    /// unique index in step (claim the new value, drop the old one).
    pub async fn save(&self, id: &str, model: &Record) -> Result<Record, StoreError> {
        let origin = self.find(id).await?;
        let dropped = self.sync_unique(id, model, origin.as_ref()).await?;
        let record = self.proxy.do_save(self.spec, id, model).await?;
        self.drop_old_value(dropped).await?;
        Ok(record)
    }

    /// Diff-updates the record at `id`, keeping the unique index in step.
    /// Fails when the record does not exist.
    pub async fn update(&self, id: &str, model: &Record) -> Result<Record, StoreError> {
        let origin = self.proxy.do_read(self.spec, id).await?;
        let dropped = self.sync_unique(id, model, Some(&origin)).await?;
        let record = self
            .proxy
            .do_update(self.spec, id, model, Some(&origin))
            .await?;
        self.drop_old_value(dropped).await?;
        Ok(record)
    }

    /// Creates a record under a sequence-assigned id.
    ///
    /// Draws the next id from this model's sequence, then claims the unique
    /// value when one is set. A duplicate claim fails the insert; the drawn
    /// id is not returned to the sequence.
    pub async fn insert(&self, model: &Record) -> Result<Record, StoreError> {
        self.insert_with_base(model, None).await
    }

    /// Like [`insert`](Self::insert) with an explicit sequence seed, applied
    /// only when this call creates the sequence.
    pub async fn insert_with_base(
        &self,
        model: &Record,
        init_base: Option<i64>,
    ) -> Result<Record, StoreError> {
        let seq = self.proxy.next_seq(self.spec.kind, init_base).await?;
        let id = seq.to_string();

        let mut created = model.clone();
        created.id = id.clone();

        let record = match (&self.unique, self.unique_value(model)) {
            (Some(index), Some(value)) => index.claim(value, &created).await?,
            _ => {
                self.proxy
                    .do_read_or_create(self.spec, &id, &created)
                    .await?
            }
        };
        info!(kind = self.spec.kind, id = %record.id, "record inserted");
        Ok(record)
    }

    /// Atomically adds deltas to numeric fields of the record at `id`.
    pub async fn increment(&self, id: &str, fields: &Increments) -> Result<Record, StoreError> {
        self.proxy.do_increment(self.spec, id, fields).await
    }

    /// Soft-deletes (`destroy = false`, unique claims stay valid) or
    /// physically removes the record and its unique claim (`destroy = true`).
    pub async fn delete(&self, id: &str, destroy: bool) -> Result<Option<Record>, StoreError> {
        if !destroy {
            return self.proxy.do_delete(self.spec, id, false).await;
        }

        let origin = self.proxy.do_read(self.spec, id).await?;
        self.proxy.do_delete(self.spec, id, true).await?;
        if let (Some(index), Some(value)) = (&self.unique, self.unique_value(&origin)) {
            index.remove(value).await?;
        }
        Ok(None)
    }

    /// Resolves a unique field value to its record, `None` when unclaimed.
    pub async fn find_by_unique(&self, value: &str) -> Result<Option<Record>, StoreError> {
        match &self.unique {
            Some(index) => index.find(value).await,
            None => Err(StoreError::validation(format!(
                "model '{}' declares no unique field",
                self.spec.kind
            ))),
        }
    }

    /// Acquires the advisory lock on `id`.
    pub async fn lock(&self, id: &str, opts: &LockOptions) -> Result<Record, StoreError> {
        self.proxy.do_lock(self.spec, id, opts).await
    }

    /// Releases the advisory lock on `id`.
    pub async fn release(&self, id: &str) -> Result<Record, StoreError> {
        self.proxy.do_release(self.spec, id).await
    }

    /// Runs `handler` while holding the advisory lock on `id`.
    ///
    /// The lock is released whatever the handler returns; a handler error
    /// wins over a release error, which is then only logged.
    pub async fn guard<F, Fut, T>(
        &self,
        id: &str,
        opts: &LockOptions,
        handler: F,
    ) -> Result<T, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.lock(id, opts).await?;
        let outcome = handler().await;
        let released = self.release(id).await;

        match (outcome, released) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), released) => {
                if let Err(re) = released {
                    warn!(
                        kind = self.spec.kind,
                        id = %id,
                        error = %re,
                        "failed to release lock after guarded section"
                    );
                }
                Err(e)
            }
        }
    }

    /// Create flush for staged work: claim-then-create under an explicit id.
    pub(crate) async fn create_staged(&self, id: &str, model: &Record) -> Result<Record, StoreError> {
        let mut created = model.clone();
        created.id = id.to_string();

        if let (Some(index), Some(value)) = (&self.unique, self.unique_value(model)) {
            return index.claim(value, &created).await;
        }
        self.proxy.do_read_or_create(self.spec, id, &created).await
    }

    /// Update flush for staged work: the diff is already computed, so only
    /// the unique flow and the write remain.
    pub(crate) async fn update_staged(
        &self,
        id: &str,
        model: &Record,
        origin: &Record,
        patch: Patch,
    ) -> Result<Record, StoreError> {
        let dropped = self.sync_unique(id, model, Some(origin)).await?;
        let record = self.proxy.do_apply(self.spec, id, patch).await?;
        self.drop_old_value(dropped).await?;
        Ok(record)
    }

    fn unique_value<'a>(&self, model: &'a Record) -> Option<&'a str> {
        let field = self.spec.unique?;
        model.field_str(field).filter(|v| !v.is_empty())
    }

    /// Claims the model's unique value ahead of the write. Returns the
    /// origin's value when the write abandons it; the caller removes that
    /// lookup after the record landed. An empty new value leaves the index
    /// untouched.
    async fn sync_unique(
        &self,
        id: &str,
        model: &Record,
        origin: Option<&Record>,
    ) -> Result<Option<String>, StoreError> {
        let Some(index) = &self.unique else {
            return Ok(None);
        };
        let Some(new_value) = self.unique_value(model) else {
            return Ok(None);
        };
        let old_value = origin
            .and_then(|o| self.unique_value(o))
            .map(str::to_string);
        if old_value.as_deref() == Some(new_value) {
            return Ok(None);
        }

        let mut owner = model.clone();
        owner.id = id.to_string();
        index.claim(new_value, &owner).await?;
        Ok(old_value)
    }

    async fn drop_old_value(&self, dropped: Option<String>) -> Result<(), StoreError> {
        if let (Some(index), Some(old)) = (&self.unique, dropped) {
            index.remove(&old).await?;
        }
        Ok(())
    }
}
