//! Diff computation and meta overflow handling

use serde_json::{Map, Value};

use crate::domain::backend::Patch;
use crate::domain::error::StoreError;
use crate::domain::record::entity::{is_blank, to_flat, Record, RESERVED_FIELDS};
use crate::domain::record::spec::ModelSpec;

/// Shapes records on their way in and out of a backend.
///
/// `before_save` computes the minimal patch that turns `origin` into `model`,
/// folding undeclared fields into the meta overflow bag. `after_read` decodes
/// the stored meta back to its logical value. Both directions treat `null`
/// and `""` as "absent", so writing a blank over a missing member is a no-op
/// and a record round-trips regardless of which blank form it carried.
#[derive(Debug, Clone, Copy)]
pub struct ModelFilter {
    spec: &'static ModelSpec,
}

impl ModelFilter {
    pub fn new(spec: &'static ModelSpec) -> Self {
        Self { spec }
    }

    /// Diffs `model` against `origin` (or against nothing for creates).
    ///
    /// Returns `None` when nothing changed. Reserved fields (`lock`, `next`)
    /// are stripped from the input; they only move through increments. Meta
    /// in the returned patch is already in its stored string-encoded form.
    pub fn before_save(
        &self,
        model: &Record,
        origin: Option<&Record>,
    ) -> Result<Option<Patch>, StoreError> {
        let mut flat = to_flat(model)?;
        for field in RESERVED_FIELDS {
            flat.remove(*field);
        }
        let explicit_meta = flat.remove("meta");

        let mut overflow = Map::new();
        let mut declared = Map::new();
        for (name, value) in flat {
            if self.spec.is_declared(&name) {
                declared.insert(name, value);
            } else {
                overflow.insert(name, value);
            }
        }

        let origin_flat = match origin {
            Some(o) => {
                let mut m = to_flat(o)?;
                for field in RESERVED_FIELDS {
                    m.remove(*field);
                }
                m.remove("meta");
                m
            }
            None => Map::new(),
        };

        let mut patch = Patch::new();
        for (name, value) in declared {
            match origin_flat.get(&name) {
                Some(prev) if *prev == value => {}
                Some(prev) if is_blank(prev) && is_blank(&value) => {}
                Some(_) => {
                    patch.insert(name, value);
                }
                None if is_blank(&value) => {}
                None => {
                    patch.insert(name, value);
                }
            }
        }

        let origin_meta = origin.and_then(|o| o.meta.clone()).filter(|v| !is_blank(v));
        let merged = merge_meta(explicit_meta, origin_meta.as_ref(), overflow);
        if merged != origin_meta {
            patch.insert("meta".to_string(), encode_meta(merged)?);
        }

        Ok(if patch.is_empty() { None } else { Some(patch) })
    }

    /// Decodes the stored meta string back to its logical value.
    ///
    /// An undecodable payload keeps the raw string and marks the record's
    /// `error` member instead of failing the read.
    pub fn after_read(&self, record: &mut Record) {
        let Some(Value::String(raw)) = &record.meta else {
            return;
        };
        if raw.is_empty() {
            record.meta = None;
            return;
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => record.meta = Some(value).filter(|v| !is_blank(v)),
            Err(e) => record.error = Some(format!("undecodable meta: {e}")),
        }
    }

    /// Post-write counterpart of [`after_read`](Self::after_read): what a
    /// backend hands back after a save carries the stored meta shape too.
    pub fn after_save(&self, record: &mut Record) {
        self.after_read(record);
    }
}

/// Applies the overflow fields on top of the effective meta base.
///
/// The base is the model's explicit meta when present (a blank explicit meta
/// clears the bag), otherwise the origin's. Blank overflow values delete
/// their entry. A non-object base survives untouched unless overflow fields
/// force an object.
fn merge_meta(
    explicit: Option<Value>,
    origin: Option<&Value>,
    overflow: Map<String, Value>,
) -> Option<Value> {
    let base = match explicit {
        Some(v) if is_blank(&v) => None,
        Some(v) => Some(v),
        None => origin.cloned(),
    };

    if overflow.is_empty() {
        return base.filter(|v| !matches!(v, Value::Object(m) if m.is_empty()));
    }

    let mut bag = match base {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };
    for (name, value) in overflow {
        if is_blank(&value) {
            bag.remove(&name);
        } else {
            bag.insert(name, value);
        }
    }

    if bag.is_empty() {
        None
    } else {
        Some(Value::Object(bag))
    }
}

/// Stored form of a meta value: the JSON encoding of the logical value, or
/// `""` when the bag is gone.
fn encode_meta(meta: Option<Value>) -> Result<Value, StoreError> {
    match meta {
        None => Ok(Value::String(String::new())),
        Some(v) => serde_json::to_string(&v)
            .map(Value::String)
            .map_err(|e| StoreError::backend(format!("failed to encode meta: {e}"))),
    }
}
