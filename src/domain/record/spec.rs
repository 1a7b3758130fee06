//! Model descriptors

use super::entity::is_base_field;

/// Static descriptor of a model: its name, its declared fields and the
/// optional field whose values must be unique across records of the model.
///
/// Specs are compile-time constants; services bind to a `&'static ModelSpec`
/// and derive keys from its `kind`, never from record payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSpec {
    pub kind: &'static str,
    pub fields: &'static [&'static str],
    pub unique: Option<&'static str>,
}

impl ModelSpec {
    pub const fn new(kind: &'static str, fields: &'static [&'static str]) -> Self {
        Self {
            kind,
            fields,
            unique: None,
        }
    }

    pub const fn with_unique(self, field: &'static str) -> Self {
        Self {
            kind: self.kind,
            fields: self.fields,
            unique: Some(field),
        }
    }

    /// Base fields and declared model fields are stored as record members;
    /// everything else overflows into meta.
    pub fn is_declared(&self, name: &str) -> bool {
        is_base_field(name) || self.fields.contains(&name)
    }
}
