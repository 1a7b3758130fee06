//! Unit of work - staged mutations flushed in one bounded-parallel commit
//!
//! Reads stage their origin, writes touch only the working copy, and
//! `commit` diffs every staged entity exactly once before flushing the
//! non-empty ones concurrently. There is no cross-record atomicity: each
//! write stands alone and failures never roll back committed siblings.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{self, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::backend::Patch;
use crate::domain::record::{from_flat, to_flat, ModelFilter, ModelSpec, Record, RESERVED_FIELDS};
use crate::domain::StoreError;

use super::proxy::StorageProxy;
use super::typed::TypedStore;

type StageKey = (String, String);

#[derive(Debug)]
struct StagedEntity {
    spec: &'static ModelSpec,
    /// Stored state at staging time; `None` marks a create.
    origin: Option<Record>,
    working: Record,
}

enum FlushAction {
    Create,
    Update { origin: Record, patch: Patch },
}

struct FlushJob {
    kind: String,
    id: String,
    typed: TypedStore,
    working: Record,
    action: FlushAction,
}

/// Outcome of a [`UnitOfWork::commit`], one entry per staged entity.
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Records stored, in completion order.
    pub committed: Vec<Record>,
    /// `(kind, id)` pairs whose working copy matched their origin.
    pub skipped: Vec<(String, String)>,
    /// `(kind, id, error)` for writes that did not land.
    pub failed: Vec<(String, String, StoreError)>,
}

impl CommitReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Collects mutations across models and flushes them in one go.
#[derive(Debug)]
pub struct UnitOfWork {
    proxy: Arc<StorageProxy>,
    fan_out: usize,
    id: Uuid,
    stages: Mutex<BTreeMap<StageKey, StagedEntity>>,
}

impl UnitOfWork {
    pub fn new(proxy: Arc<StorageProxy>) -> Self {
        let fan_out = proxy.fan_out();
        Self {
            proxy,
            fan_out,
            id: Uuid::new_v4(),
            stages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out.max(1);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// View of this unit of work scoped to one model.
    pub fn staged(&self, spec: &'static ModelSpec) -> StagedStore<'_> {
        StagedStore { work: self, spec }
    }

    /// Flushes every staged entity and reports per-item outcomes.
    ///
    /// Unchanged entities are skipped without a write. Writes run
    /// concurrently, bounded by the fan-out, through the same create and
    /// update paths a [`TypedStore`] uses, so unique claims stay in step.
    pub async fn commit(self) -> Result<CommitReport, StoreError> {
        let stages = self
            .stages
            .into_inner()
            .map_err(|e| StoreError::backend(format!("Failed to acquire stage lock: {}", e)))?;

        let mut report = CommitReport::default();
        let mut jobs = Vec::new();
        for ((kind, id), staged) in stages {
            let StagedEntity {
                spec,
                origin,
                working,
            } = staged;
            let action = match origin {
                None => FlushAction::Create,
                Some(origin) => {
                    let filter = ModelFilter::new(spec);
                    match filter.before_save(&working, Some(&origin)) {
                        Ok(Some(patch)) => FlushAction::Update { origin, patch },
                        Ok(None) => {
                            report.skipped.push((kind, id));
                            continue;
                        }
                        Err(e) => {
                            report.failed.push((kind, id, e));
                            continue;
                        }
                    }
                }
            };
            jobs.push(FlushJob {
                kind,
                id,
                typed: TypedStore::new(self.proxy.clone(), spec),
                working,
                action,
            });
        }

        let outcomes = stream::iter(jobs.into_iter().map(|job| async move {
            let FlushJob {
                kind,
                id,
                typed,
                working,
                action,
            } = job;
            let result = match action {
                FlushAction::Create => typed.create_staged(&id, &working).await,
                FlushAction::Update { origin, patch } => {
                    typed.update_staged(&id, &working, &origin, patch).await
                }
            };
            (kind, id, result)
        }))
        .buffer_unordered(self.fan_out)
        .collect::<Vec<_>>()
        .await;

        for (kind, id, result) in outcomes {
            match result {
                Ok(record) => report.committed.push(record),
                Err(e) => {
                    warn!(uow = %self.id, kind = %kind, id = %id, error = %e, "staged write failed");
                    report.failed.push((kind, id, e));
                }
            }
        }

        info!(
            uow = %self.id,
            committed = report.committed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "unit of work committed"
        );
        Ok(report)
    }

    fn stage_guard(&self) -> Result<MutexGuard<'_, BTreeMap<StageKey, StagedEntity>>, StoreError> {
        self.stages
            .lock()
            .map_err(|e| StoreError::backend(format!("Failed to acquire stage lock: {}", e)))
    }
}

/// Per-model access to a [`UnitOfWork`]'s staged entities.
#[derive(Debug, Clone, Copy)]
pub struct StagedStore<'a> {
    work: &'a UnitOfWork,
    spec: &'static ModelSpec,
}

impl StagedStore<'_> {
    /// Returns the working copy at `id`, fetching and staging the stored
    /// record on first touch.
    pub async fn get(&self, id: &str) -> Result<Record, StoreError> {
        let key = self.key_for(id);
        {
            let stages = self.work.stage_guard()?;
            if let Some(staged) = stages.get(&key) {
                return Ok(staged.working.clone());
            }
        }

        let fetched = self.work.proxy.do_read(self.spec, id).await?;
        let mut stages = self.work.stage_guard()?;
        let staged = stages.entry(key).or_insert_with(|| StagedEntity {
            spec: self.spec,
            origin: Some(fetched.clone()),
            working: fetched,
        });
        Ok(staged.working.clone())
    }

    /// [`get`](Self::get) that maps a missing record to `None`.
    pub async fn find(&self, id: &str) -> Result<Option<Record>, StoreError> {
        match self.get(id).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stages a new entity under `id`. Nothing hits the backend until
    /// commit; id collisions with stored records surface there.
    pub fn create(&self, id: &str, model: &Record) -> Result<Record, StoreError> {
        let key = self.key_for(id);
        let mut stages = self.work.stage_guard()?;
        if stages.contains_key(&key) {
            return Err(StoreError::validation(format!(
                "'{}/{}' is already staged",
                self.spec.kind, id
            )));
        }

        let mut working = model.clone();
        working.id = id.to_string();
        stages.insert(
            key,
            StagedEntity {
                spec: self.spec,
                origin: None,
                working: working.clone(),
            },
        );
        Ok(working)
    }

    /// Merges `patch` into the working copy at `id`, staging the stored
    /// record on first touch. Reserved fields are rejected.
    pub async fn apply(&self, id: &str, patch: &Patch) -> Result<Record, StoreError> {
        for field in patch.keys() {
            if RESERVED_FIELDS.contains(&field.as_str()) {
                return Err(StoreError::validation(format!(
                    "field '{}' is reserved",
                    field
                )));
            }
        }

        self.get(id).await?;

        let key = self.key_for(id);
        let mut stages = self.work.stage_guard()?;
        let staged = stages.get_mut(&key).ok_or_else(|| {
            StoreError::backend(format!(
                "staged entity '{}/{}' vanished",
                self.spec.kind, id
            ))
        })?;

        let mut flat = to_flat(&staged.working)?;
        for (field, value) in patch {
            flat.insert(field.clone(), value.clone());
        }
        staged.working = from_flat(flat)?;
        Ok(staged.working.clone())
    }

    fn key_for(&self, id: &str) -> StageKey {
        (self.spec.kind.to_string(), id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::KeyMaker;
    use crate::infrastructure::backend::MemoryBackend;
    use serde_json::json;

    const SPEC: ModelSpec = ModelSpec::new("test", &["name", "size"]).with_unique("name");
    const PLAIN: ModelSpec = ModelSpec::new("plain", &["name", "size"]);

    fn harness() -> (Arc<StorageProxy>, UnitOfWork) {
        let backend = Arc::new(MemoryBackend::new("records"));
        let proxy = Arc::new(StorageProxy::new(backend, KeyMaker::new("it", '/').unwrap()));
        let work = UnitOfWork::new(proxy.clone());
        (proxy, work)
    }

    fn plain_rec(name: &str) -> Record {
        Record::new("").with_kind("plain").with_field("name", name)
    }

    fn named(name: &str) -> Record {
        Record::new("").with_kind("test").with_field("name", name)
    }

    fn patch_of(field: &str, value: serde_json::Value) -> Patch {
        let mut patch = Patch::new();
        patch.insert(field.to_string(), value);
        patch
    }

    #[tokio::test]
    async fn test_commit_of_an_empty_stage_is_clean() {
        let (_, work) = harness();
        let report = work.commit().await.unwrap();
        assert!(report.is_clean());
        assert!(report.committed.is_empty());
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_staged_create_lands_on_commit() {
        let (proxy, work) = harness();
        work.staged(&PLAIN).create("a1", &plain_rec("AAA")).unwrap();

        // Nothing stored until commit.
        assert!(proxy.do_read(&PLAIN, "a1").await.unwrap_err().is_not_found());

        let report = work.commit().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.committed.len(), 1);

        let stored = proxy.do_read(&PLAIN, "a1").await.unwrap();
        assert_eq!(stored.field_str("name"), Some("AAA"));
    }

    #[tokio::test]
    async fn test_create_twice_under_one_id_is_rejected() {
        let (_, work) = harness();
        let staged = work.staged(&PLAIN);
        staged.create("a1", &plain_rec("AAA")).unwrap();

        let err = staged.create("a1", &plain_rec("BBB")).unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_get_returns_the_working_copy_not_the_store() {
        let (proxy, work) = harness();
        proxy.do_save(&PLAIN, "a1", &plain_rec("AAA")).await.unwrap();

        let staged = work.staged(&PLAIN);
        staged.apply("a1", &patch_of("name", json!("AAA2"))).await.unwrap();

        // The store still has the old value; the stage has the new one.
        let stored = proxy.do_read(&PLAIN, "a1").await.unwrap();
        assert_eq!(stored.field_str("name"), Some("AAA"));
        let working = staged.get("a1").await.unwrap();
        assert_eq!(working.field_str("name"), Some("AAA2"));
    }

    #[tokio::test]
    async fn test_apply_merges_and_commit_writes_the_diff() {
        let (proxy, work) = harness();
        proxy.do_save(&PLAIN, "a1", &plain_rec("AAA")).await.unwrap();

        let staged = work.staged(&PLAIN);
        staged.apply("a1", &patch_of("size", json!(7))).await.unwrap();

        let report = work.commit().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.committed.len(), 1);

        let stored = proxy.do_read(&PLAIN, "a1").await.unwrap();
        assert_eq!(stored.field("size"), Some(&json!(7)));
        assert_eq!(stored.field_str("name"), Some("AAA"));
    }

    #[tokio::test]
    async fn test_apply_rejects_reserved_fields() {
        let (proxy, work) = harness();
        proxy.do_save(&PLAIN, "a1", &plain_rec("AAA")).await.unwrap();

        let staged = work.staged(&PLAIN);
        let err = staged.apply("a1", &patch_of("lock", json!(1))).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
        let err = staged.apply("a1", &patch_of("next", json!(5))).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_apply_to_a_missing_record_fails() {
        let (_, work) = harness();
        let staged = work.staged(&PLAIN);
        let err = staged.apply("nope", &patch_of("size", json!(1))).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_untouched_entities_are_skipped() {
        let (proxy, work) = harness();
        proxy.do_save(&PLAIN, "a1", &plain_rec("AAA")).await.unwrap();

        work.staged(&PLAIN).get("a1").await.unwrap();

        let report = work.commit().await.unwrap();
        assert!(report.is_clean());
        assert!(report.committed.is_empty());
        assert_eq!(report.skipped, vec![("plain".to_string(), "a1".to_string())]);
    }

    #[tokio::test]
    async fn test_commit_spans_models() {
        let (proxy, work) = harness();
        work.staged(&PLAIN).create("a1", &plain_rec("AAA")).unwrap();
        work.staged(&SPEC).create("b1", &named("BBB")).unwrap();

        let report = work.commit().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.committed.len(), 2);

        assert!(proxy.do_read(&PLAIN, "a1").await.is_ok());
        assert!(proxy.do_read(&SPEC, "b1").await.is_ok());
    }

    #[tokio::test]
    async fn test_staged_create_claims_the_unique_value() {
        let (proxy, work) = harness();
        work.staged(&SPEC).create("5000001", &named("QQQ")).unwrap();
        work.commit().await.unwrap();

        let typed = TypedStore::new(proxy, &SPEC);
        let found = typed.find_by_unique("QQQ").await.unwrap().unwrap();
        assert_eq!(found.id, "5000001");
    }

    #[tokio::test]
    async fn test_staged_rename_moves_the_unique_claim() {
        let (proxy, work) = harness();
        let typed = TypedStore::new(proxy.clone(), &SPEC);
        let inserted = typed.insert(&named("BBB")).await.unwrap();

        let staged = work.staged(&SPEC);
        staged
            .apply(&inserted.id, &patch_of("name", json!("CCC")))
            .await
            .unwrap();
        let report = work.commit().await.unwrap();
        assert!(report.is_clean());

        assert!(typed.find_by_unique("BBB").await.unwrap().is_none());
        let found = typed.find_by_unique("CCC").await.unwrap().unwrap();
        assert_eq!(found.id, inserted.id);
    }

    #[tokio::test]
    async fn test_failures_never_roll_back_committed_siblings() {
        let (proxy, work) = harness();
        proxy.do_save(&PLAIN, "a1", &plain_rec("AAA")).await.unwrap();
        proxy.do_save(&PLAIN, "a2", &plain_rec("BBB")).await.unwrap();

        let staged = work.staged(&PLAIN);
        staged.apply("a1", &patch_of("name", json!("AAA2"))).await.unwrap();
        staged.apply("a2", &patch_of("name", json!("BBB2"))).await.unwrap();

        // a2 vanishes between staging and commit.
        proxy.do_delete(&PLAIN, "a2", true).await.unwrap();

        let report = work.commit().await.unwrap();
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.failed.len(), 1);
        let (kind, id, error) = &report.failed[0];
        assert_eq!(kind, "plain");
        assert_eq!(id, "a2");
        assert!(error.is_not_found());

        // The sibling landed regardless.
        let a1 = proxy.do_read(&PLAIN, "a1").await.unwrap();
        assert_eq!(a1.field_str("name"), Some("AAA2"));
    }

    #[tokio::test]
    async fn test_duplicate_claim_fails_only_that_create() {
        let (proxy, work) = harness();
        let typed = TypedStore::new(proxy, &SPEC);
        typed.insert(&named("AAA")).await.unwrap();

        let staged = work.staged(&SPEC);
        staged.create("9000001", &named("AAA")).unwrap();
        staged.create("9000002", &named("ZZZ")).unwrap();

        let report = work.commit().await.unwrap();
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.committed[0].id, "9000002");
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].2.is_duplicate());
    }

    #[tokio::test]
    async fn test_many_staged_creates_all_land() {
        let (proxy, work) = harness();
        let staged = work.staged(&PLAIN);
        for i in 0..12 {
            staged
                .create(&format!("m{}", i), &plain_rec(&format!("N{}", i)))
                .unwrap();
        }

        let report = work.commit().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.committed.len(), 12);

        for i in 0..12 {
            assert!(proxy.do_read(&PLAIN, &format!("m{}", i)).await.is_ok());
        }
    }
}
