//! In-memory storage backend

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::domain::backend::{apply_patch, Increments, Patch, StorageBackend};
use crate::domain::record::{from_flat, to_flat, Record};
use crate::domain::StoreError;

/// Thread-safe in-memory table of records.
///
/// The reference backend for tests and development; per-key atomicity comes
/// from the single process-wide lock. Data is lost when the process
/// terminates.
#[derive(Debug)]
pub struct MemoryBackend {
    table: String,
    records: RwLock<HashMap<String, Record>>,
}

impl MemoryBackend {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn read_guard(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Record>>, StoreError> {
        self.records
            .read()
            .map_err(|e| StoreError::backend(format!("Failed to acquire read lock: {}", e)))
    }

    fn write_guard(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Record>>, StoreError> {
        self.records
            .write()
            .map_err(|e| StoreError::backend(format!("Failed to acquire write lock: {}", e)))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("records")
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn hello(&self) -> Result<String, StoreError> {
        Ok(format!("memory:{}", self.table))
    }

    async fn read(&self, key: &str) -> Result<Record, StoreError> {
        let records = self.read_guard()?;
        records
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(&self.table, key))
    }

    async fn read_or_create(&self, key: &str, model: &Record) -> Result<Record, StoreError> {
        let mut records = self.write_guard()?;

        if let Some(existing) = records.get(key) {
            return Ok(existing.clone());
        }

        records.insert(key.to_string(), model.clone());
        Ok(model.clone())
    }

    async fn save(&self, key: &str, model: &Record) -> Result<Record, StoreError> {
        let mut records = self.write_guard()?;
        records.insert(key.to_string(), model.clone());
        Ok(model.clone())
    }

    async fn update(
        &self,
        key: &str,
        patch: &Patch,
        increments: Option<&Increments>,
    ) -> Result<Record, StoreError> {
        let mut records = self.write_guard()?;

        let existing = records
            .get(key)
            .ok_or_else(|| StoreError::not_found(&self.table, key))?;

        let flat = to_flat(existing)?;
        let merged = apply_patch(flat, patch, increments)?;
        let record = from_flat(merged)?;

        records.insert(key.to_string(), record.clone());
        Ok(record)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut records = self.write_guard()?;

        if records.remove(key).is_none() {
            return Err(StoreError::not_found(&self.table, key));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn record(id: &str, name: &str) -> Record {
        Record::new(id).with_kind("test").with_field("name", name)
    }

    #[tokio::test]
    async fn test_read_not_found_carries_table_and_key() {
        let backend = MemoryBackend::new("records");
        let err = backend.read("prod/test/a1").await.unwrap_err();
        assert_eq!(err.to_string(), "404 NOT FOUND - records/prod/test/a1");
    }

    #[tokio::test]
    async fn test_read_or_create_never_overwrites() {
        let backend = MemoryBackend::new("records");

        let first = backend
            .read_or_create("k1", &record("a1", "original"))
            .await
            .unwrap();
        assert_eq!(first.field_str("name"), Some("original"));

        let second = backend
            .read_or_create("k1", &record("a1", "replacement"))
            .await
            .unwrap();
        assert_eq!(second.field_str("name"), Some("original"));
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let backend = MemoryBackend::new("records");

        backend.save("k1", &record("a1", "first")).await.unwrap();
        backend.save("k1", &record("a1", "second")).await.unwrap();

        let stored = backend.read("k1").await.unwrap();
        assert_eq!(stored.field_str("name"), Some("second"));
    }

    #[tokio::test]
    async fn test_update_merges_patch_into_record() {
        let backend = MemoryBackend::new("records");
        backend.save("k1", &record("a1", "box")).await.unwrap();

        let patch = Patch::from_iter([("size".to_string(), json!(3))]);
        let updated = backend.update("k1", &patch, None).await.unwrap();

        assert_eq!(updated.field_str("name"), Some("box"));
        assert_eq!(updated.field("size"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_update_with_blank_clears_member() {
        let backend = MemoryBackend::new("records");
        backend.save("k1", &record("a1", "box")).await.unwrap();

        let patch = Patch::from_iter([("name".to_string(), json!(""))]);
        let updated = backend.update("k1", &patch, None).await.unwrap();

        assert_eq!(updated.field("name"), None);
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let backend = MemoryBackend::new("records");
        let err = backend.update("k1", &Patch::new(), None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_increment_missing_record_fails() {
        let backend = MemoryBackend::new("records");
        let fields = Increments::from([("lock".to_string(), 1)]);
        let err = backend.increment("k1", &fields).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_increment_starts_absent_field_at_zero() {
        let backend = MemoryBackend::new("records");
        backend.save("k1", &record("a1", "box")).await.unwrap();

        let fields = Increments::from([("lock".to_string(), 1)]);
        let updated = backend.increment("k1", &fields).await.unwrap();
        assert_eq!(updated.lock, 1);
    }

    #[tokio::test]
    async fn test_increment_on_string_field_fails() {
        let backend = MemoryBackend::new("records");
        backend.save("k1", &record("a1", "box")).await.unwrap();

        let fields = Increments::from([("name".to_string(), 1)]);
        let err = backend.increment("k1", &fields).await.unwrap_err();
        assert!(matches!(err, StoreError::FieldType { .. }));
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let backend = MemoryBackend::new("records");
        backend.save("k1", &record("a1", "box")).await.unwrap();

        backend.delete("k1").await.unwrap();
        assert!(backend.read("k1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_missing_record_fails() {
        let backend = MemoryBackend::new("records");
        assert!(backend.delete("k1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_lose_updates() {
        let backend = Arc::new(MemoryBackend::new("records"));
        backend.save("k1", &record("a1", "box")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let fields = Increments::from([("next".to_string(), 1)]);
                backend.increment("k1", &fields).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = backend.read("k1").await.unwrap();
        assert_eq!(stored.next, 32);
    }

    #[tokio::test]
    async fn test_hello_reports_backend_identity() {
        let backend = MemoryBackend::new("records");
        assert_eq!(backend.hello().await.unwrap(), "memory:records");
    }
}
