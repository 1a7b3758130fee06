//! Storage proxy - model-aware orchestration over a raw backend
//!
//! Everything above talks to [`StorageProxy`]; everything below it only sees
//! whole records and opaque keys. The proxy derives keys, runs records
//! through the diff filter, stamps timestamps, and layers sequences and
//! advisory locks on top of the backend's atomic increments.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::backend::{Increments, Patch, StorageBackend};
use crate::domain::record::{
    from_flat, now_millis, KeyMaker, ModelFilter, ModelSpec, Record, RecordKey, INTERNAL_MARK,
};
use crate::domain::retry::Backoff;
use crate::domain::StoreError;

/// Key-space type of sequence counter records. Counters carry the `#`
/// stereotype so they never leave the engine.
const SEQ_KIND: &str = "sequence";

/// First id handed out by a fresh sequence is `DEFAULT_SEQUENCE_BASE + 1`.
pub const DEFAULT_SEQUENCE_BASE: i64 = 1_000_000;

/// Default fan-out for bounded-parallel flushes.
pub const DEFAULT_FAN_OUT: usize = 4;

/// Tuning for one advisory lock acquisition.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Retry polls after the initial attempt.
    pub ticks: u32,
    /// Delay schedule between polls.
    pub backoff: Backoff,
    /// Abandons the wait when triggered.
    pub cancel: Option<CancellationToken>,
}

impl LockOptions {
    pub fn new(ticks: u32, interval: Duration) -> Self {
        Self {
            ticks,
            backoff: Backoff::Fixed(interval),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(50))
    }
}

/// Model-aware storage orchestrator.
///
/// Stateless apart from its backend handle; clones of the `Arc` share one
/// proxy across every typed service and unit of work.
#[derive(Debug)]
pub struct StorageProxy {
    backend: Arc<dyn StorageBackend>,
    keys: KeyMaker,
    sequence_base: i64,
    fan_out: usize,
}

impl StorageProxy {
    pub fn new(backend: Arc<dyn StorageBackend>, keys: KeyMaker) -> Self {
        Self {
            backend,
            keys,
            sequence_base: DEFAULT_SEQUENCE_BASE,
            fan_out: DEFAULT_FAN_OUT,
        }
    }

    /// Sets the seed for sequences created by this proxy.
    pub fn with_sequence_base(mut self, base: i64) -> Self {
        self.sequence_base = base;
        self
    }

    /// Sets the parallelism used by batched reads and commits.
    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    pub fn keys(&self) -> &KeyMaker {
        &self.keys
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Reports the live backend's identity.
    pub async fn hello(&self) -> Result<String, StoreError> {
        self.backend.hello().await
    }

    /// Reads one record, decoding meta and attaching the derived key.
    pub async fn do_read(&self, spec: &'static ModelSpec, id: &str) -> Result<Record, StoreError> {
        let key = self.keys.derive(spec.kind, id)?;
        let record = self.backend.read(&key.key).await?;
        Ok(self.finish(spec, &key, record))
    }

    /// Returns the record at `id`, storing a shaped copy of `model` when
    /// absent. Existing records are never overwritten.
    pub async fn do_read_or_create(
        &self,
        spec: &'static ModelSpec,
        id: &str,
        model: &Record,
    ) -> Result<Record, StoreError> {
        let key = self.keys.derive(spec.kind, id)?;
        let candidate = self.build_create(spec, &key, model)?;
        let record = self.backend.read_or_create(&key.key, &candidate).await?;
        debug!(key = %key.key, "record ensured");
        Ok(self.finish(spec, &key, record))
    }

    /// Stores `model` unconditionally, replacing any prior record.
    pub async fn do_save(
        &self,
        spec: &'static ModelSpec,
        id: &str,
        model: &Record,
    ) -> Result<Record, StoreError> {
        let key = self.keys.derive(spec.kind, id)?;
        let record = self.build_create(spec, &key, model)?;
        let stored = self.backend.save(&key.key, &record).await?;
        info!(key = %key.key, "record saved");
        Ok(self.finish(spec, &key, stored))
    }

    /// Diffs `model` against the origin and writes only what changed.
    ///
    /// With no origin given, the current record is read first; a missing
    /// record fails the update. When the diff is empty nothing is written
    /// and `updatedAt` stays untouched.
    pub async fn do_update(
        &self,
        spec: &'static ModelSpec,
        id: &str,
        model: &Record,
        origin: Option<&Record>,
    ) -> Result<Record, StoreError> {
        let key = self.keys.derive(spec.kind, id)?;
        let fetched;
        let origin = match origin {
            Some(o) => o,
            None => {
                fetched = self.do_read(spec, id).await?;
                &fetched
            }
        };

        let filter = ModelFilter::new(spec);
        match filter.before_save(model, Some(origin))? {
            None => {
                debug!(key = %key.key, "no changes detected");
                let mut unchanged = origin.clone();
                unchanged.key = Some(key.key);
                Ok(unchanged)
            }
            Some(patch) => self.write_patch(spec, &key, patch).await,
        }
    }

    /// Writes a precomputed patch (diffing already done by the caller).
    pub async fn do_apply(
        &self,
        spec: &'static ModelSpec,
        id: &str,
        patch: Patch,
    ) -> Result<Record, StoreError> {
        if patch.is_empty() {
            return self.do_read(spec, id).await;
        }
        let key = self.keys.derive(spec.kind, id)?;
        self.write_patch(spec, &key, patch).await
    }

    /// Atomically adds deltas to numeric fields of an existing record.
    pub async fn do_increment(
        &self,
        spec: &'static ModelSpec,
        id: &str,
        fields: &Increments,
    ) -> Result<Record, StoreError> {
        let key = self.keys.derive(spec.kind, id)?;
        let record = self.backend.increment(&key.key, fields).await?;
        debug!(key = %key.key, "fields incremented");
        Ok(self.finish(spec, &key, record))
    }

    /// Marks the record deleted (`destroy = false`) or removes it and
    /// returns nothing (`destroy = true`).
    pub async fn do_delete(
        &self,
        spec: &'static ModelSpec,
        id: &str,
        destroy: bool,
    ) -> Result<Option<Record>, StoreError> {
        let key = self.keys.derive(spec.kind, id)?;

        if destroy {
            self.backend.delete(&key.key).await?;
            info!(key = %key.key, "record destroyed");
            return Ok(None);
        }

        let now = now_millis();
        let patch = Patch::from_iter([
            ("deletedAt".to_string(), Value::from(now)),
            ("updatedAt".to_string(), Value::from(now)),
        ]);
        let record = self.backend.update(&key.key, &patch, None).await?;
        info!(key = %key.key, "record soft deleted");
        Ok(Some(self.finish(spec, &key, record)))
    }

    /// Draws the next id from the `kind` sequence.
    ///
    /// The counter record is created on first use, pre-seeded with
    /// `init_base` (or the proxy default), so the first draw returns
    /// `base + 1`. Seeding and drawing are both backend-atomic; racing
    /// callers can lose the create but never a draw.
    pub async fn next_seq(&self, kind: &str, init_base: Option<i64>) -> Result<i64, StoreError> {
        let base = init_base.unwrap_or(self.sequence_base);
        let key = self.keys.derive(SEQ_KIND, kind)?;

        let now = now_millis();
        let mut seed = Record::new(kind);
        seed.kind = SEQ_KIND.to_string();
        seed.stereo = INTERNAL_MARK.to_string();
        seed.ns = self.keys.ns().to_string();
        seed.next = base;
        seed.created_at = now;
        seed.updated_at = now;
        self.backend.read_or_create(&key.key, &seed).await?;

        let fields = Increments::from([("next".to_string(), 1)]);
        let record = self.backend.increment(&key.key, &fields).await?;
        debug!(kind = %kind, next = record.next, "sequence advanced");
        Ok(record.next)
    }

    /// Acquires the advisory lock on `(spec.kind, id)`.
    ///
    /// The lock is an atomic counter: whoever increments it to exactly 1
    /// holds it, everyone else polls per `opts` until the budget is spent.
    /// A missing record is created first so locks work on ids that do not
    /// exist yet. Returns the record as seen at acquisition.
    pub async fn do_lock(
        &self,
        spec: &'static ModelSpec,
        id: &str,
        opts: &LockOptions,
    ) -> Result<Record, StoreError> {
        let key = self.keys.derive(spec.kind, id)?;

        let now = now_millis();
        let mut seed = Record::new(id);
        seed.kind = spec.kind.to_string();
        seed.ns = self.keys.ns().to_string();
        seed.created_at = now;
        seed.updated_at = now;
        self.backend.read_or_create(&key.key, &seed).await?;

        let fields = Increments::from([("lock".to_string(), 1)]);
        let record = self.backend.increment(&key.key, &fields).await?;
        if record.lock == 1 {
            debug!(key = %key.key, "lock acquired");
            return Ok(self.finish(spec, &key, record));
        }

        let mut waited = Duration::ZERO;
        for tick in 1..=opts.ticks {
            let delay = opts.backoff.delay(tick);
            match &opts.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!(key = %key.key, "lock wait cancelled");
                            return Err(StoreError::cancelled(format!("lock {}", key.key)));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            waited += delay;

            let record = self.backend.increment(&key.key, &fields).await?;
            if record.lock == 1 {
                debug!(key = %key.key, tick, "lock acquired after contention");
                return Ok(self.finish(spec, &key, record));
            }
        }

        let waited_ms = waited.as_millis() as u64;
        warn!(key = %key.key, waited_ms, "lock contended past budget");
        Err(StoreError::lock_timeout(&key.key, waited_ms))
    }

    /// Releases the advisory lock by resetting the counter to 0, erasing
    /// any contention inflation in the same write.
    pub async fn do_release(
        &self,
        spec: &'static ModelSpec,
        id: &str,
    ) -> Result<Record, StoreError> {
        let key = self.keys.derive(spec.kind, id)?;
        let patch = Patch::from_iter([("lock".to_string(), Value::from(0))]);
        let record = self.backend.update(&key.key, &patch, None).await?;
        debug!(key = %key.key, "lock released");
        Ok(self.finish(spec, &key, record))
    }

    /// Shapes a model for a create: diff against nothing, id and namespace
    /// from the derived key, timestamps stamped.
    fn build_create(
        &self,
        spec: &'static ModelSpec,
        key: &RecordKey,
        model: &Record,
    ) -> Result<Record, StoreError> {
        let filter = ModelFilter::new(spec);
        let patch = filter.before_save(model, None)?.unwrap_or_default();
        let mut record = from_flat(patch)?;

        record.id = key.id.clone();
        if record.ns.is_empty() {
            record.ns = key.ns.clone();
        }
        let now = now_millis();
        if record.created_at == 0 {
            record.created_at = now;
        }
        record.updated_at = now;
        Ok(record)
    }

    async fn write_patch(
        &self,
        spec: &'static ModelSpec,
        key: &RecordKey,
        mut patch: Patch,
    ) -> Result<Record, StoreError> {
        patch.insert("updatedAt".to_string(), Value::from(now_millis()));
        let fields = patch.len();
        let record = self.backend.update(&key.key, &patch, None).await?;
        info!(key = %key.key, fields, "record updated");
        Ok(self.finish(spec, key, record))
    }

    fn finish(&self, spec: &'static ModelSpec, key: &RecordKey, mut record: Record) -> Record {
        ModelFilter::new(spec).after_read(&mut record);
        record.key = Some(key.key.clone());
        record
    }
}
