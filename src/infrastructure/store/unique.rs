//! Unique field index backed by lookup records
//!
//! Uniqueness piggybacks on the table's per-key atomicity: each claimed
//! value owns a lookup record whose id embeds the value and whose meta
//! carries the owning record's id. `read_or_create` on that id is the
//! arbiter; there is no scan anywhere.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::domain::record::{ModelSpec, Record, INTERNAL_MARK};
use crate::domain::StoreError;

use super::proxy::StorageProxy;

/// Longest accepted unique value; the value is embedded in the lookup id.
pub const MAX_VALUE_LENGTH: usize = 200;

/// Single line, printable content at both ends.
static VALUE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\S(.*\S)?$").unwrap());

/// Secondary index mapping one field's values to record ids.
#[derive(Debug, Clone)]
pub struct UniqueIndex {
    proxy: Arc<StorageProxy>,
    spec: &'static ModelSpec,
    field: &'static str,
}

impl UniqueIndex {
    pub fn new(proxy: Arc<StorageProxy>, spec: &'static ModelSpec, field: &'static str) -> Self {
        Self { proxy, spec, field }
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    /// Id of the lookup record guarding `value`. Lives in the model's own
    /// key space, `#`-prefixed so it can never collide with a real id.
    pub fn lookup_id(&self, value: &str) -> String {
        format!("{}{}/{}", INTERNAL_MARK, self.field, value)
    }

    /// Values must be non-empty, bounded and carry no surrounding
    /// whitespace; two values that differ only in padding would otherwise
    /// claim different lookups.
    pub fn validate_value(&self, value: &str) -> Result<(), StoreError> {
        if value.is_empty() {
            return Err(StoreError::validation(format!(
                "unique field '{}' must not be empty",
                self.field
            )));
        }
        if value.len() > MAX_VALUE_LENGTH {
            return Err(StoreError::validation(format!(
                "unique field '{}' too long: {} characters (max {})",
                self.field,
                value.len(),
                MAX_VALUE_LENGTH
            )));
        }
        if !VALUE_PATTERN.is_match(value) {
            return Err(StoreError::validation(format!(
                "invalid value for unique field '{}': must be a single line without surrounding whitespace",
                self.field
            )));
        }
        Ok(())
    }

    /// Ensures `value` belongs to `owner`, claiming it when free.
    ///
    /// Fails with a duplicate error when the value already maps to a
    /// different record. On success both the lookup and the owner record
    /// exist; returns the owner as stored.
    pub async fn claim(&self, value: &str, owner: &Record) -> Result<Record, StoreError> {
        self.validate_value(value)?;

        let lookup_id = self.lookup_id(value);
        match self.proxy.do_read(self.spec, &lookup_id).await {
            Ok(lookup) => {
                if let Some(current) = Self::target_of(&lookup) {
                    if current != owner.id {
                        return Err(StoreError::duplicate(
                            self.field,
                            value,
                            self.spec.kind,
                            current,
                        ));
                    }
                }
                self.find_or_create(value, Some(owner)).await
            }
            Err(e) if e.is_not_found() => self.find_or_create(value, Some(owner)).await,
            Err(e) => Err(e),
        }
    }

    /// Resolves `value` through its lookup and returns the owning record.
    ///
    /// With `creates` given, missing pieces are filled in on the way: the
    /// lookup is claimed for `creates.id` when absent, the owner record is
    /// created from `creates` when absent, and a lookup that lost its
    /// target id is repaired. Without `creates` a missing lookup or owner
    /// is a plain not-found.
    pub async fn find_or_create(
        &self,
        value: &str,
        creates: Option<&Record>,
    ) -> Result<Record, StoreError> {
        let lookup_id = self.lookup_id(value);

        let Some(model) = creates else {
            let lookup = self.proxy.do_read(self.spec, &lookup_id).await?;
            let target = Self::target_of(&lookup).ok_or_else(|| {
                StoreError::backend(format!("lookup '{}' carries no target id", lookup_id))
            })?;
            return self.proxy.do_read(self.spec, &target).await;
        };

        self.validate_value(value)?;

        let mut candidate = Record::new(&lookup_id);
        candidate.kind = self.spec.kind.to_string();
        candidate.stereo = INTERNAL_MARK.to_string();
        candidate.meta = Some(Value::String(model.id.clone()));
        let lookup = self
            .proxy
            .do_read_or_create(self.spec, &lookup_id, &candidate)
            .await?;

        let owner_id = Self::target_of(&lookup).unwrap_or_else(|| model.id.clone());
        let mut owner_model = model.clone();
        owner_model.id = owner_id.clone();
        let target = self
            .proxy
            .do_read_or_create(self.spec, &owner_id, &owner_model)
            .await?;

        if Self::target_of(&lookup).as_deref() != Some(target.id.as_str()) {
            let mut repaired = lookup.clone();
            repaired.meta = Some(Value::String(target.id.clone()));
            self.proxy
                .do_update(self.spec, &lookup_id, &repaired, Some(&lookup))
                .await?;
            debug!(field = self.field, value, target = %target.id, "lookup repaired");
        }

        Ok(target)
    }

    /// Looks up the record owning `value`, `None` when the value is free.
    pub async fn find(&self, value: &str) -> Result<Option<Record>, StoreError> {
        match self.find_or_create(value, None).await {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Id currently owning `value`, without touching the owner record.
    pub async fn resolve(&self, value: &str) -> Result<Option<String>, StoreError> {
        match self.proxy.do_read(self.spec, &self.lookup_id(value)).await {
            Ok(lookup) => Ok(Self::target_of(&lookup)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Frees `value`. Removing an unclaimed value is a no-op.
    pub async fn remove(&self, value: &str) -> Result<(), StoreError> {
        let lookup_id = self.lookup_id(value);
        match self.proxy.do_delete(self.spec, &lookup_id, true).await {
            Ok(_) => {
                debug!(field = self.field, value, "lookup removed");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn target_of(lookup: &Record) -> Option<String> {
        lookup
            .meta
            .as_ref()
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}
