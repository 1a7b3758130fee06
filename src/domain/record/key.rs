//! Deterministic storage key derivation

use std::fmt;

use crate::domain::error::StoreError;

/// A derived storage key and the components it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordKey {
    pub ns: String,
    pub kind: String,
    pub id: String,
    /// Full joined key, the only identifier backends ever see.
    pub key: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Derives backend keys as `ns{d}kind{d}id` with a fixed namespace and
/// delimiter.
///
/// Components are percent-escaped so a delimiter occurring inside an id can
/// never collide with the join: distinct `(ns, kind, id)` triples always
/// produce distinct keys.
#[derive(Debug, Clone)]
pub struct KeyMaker {
    ns: String,
    delimiter: char,
}

impl KeyMaker {
    /// Builds a key scheme joining components with `delimiter`.
    ///
    /// Delimiters that collide with the escape form are rejected: `%`
    /// itself, and any character whose code point needs more than two hex
    /// digits. With either of those, distinct components can join to the
    /// same key.
    pub fn new(ns: impl Into<String>, delimiter: char) -> Result<Self, StoreError> {
        if delimiter == '%' || delimiter as u32 > 0xFF {
            return Err(StoreError::validation(format!(
                "unsupported key delimiter {delimiter:?}"
            )));
        }
        Ok(Self {
            ns: ns.into(),
            delimiter,
        })
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// Builds the key for `(kind, id)` under this namespace.
    ///
    /// Fails with a validation error when `kind` or `id` is empty; keys for
    /// anonymous records do not exist.
    pub fn derive(&self, kind: &str, id: &str) -> Result<RecordKey, StoreError> {
        if kind.is_empty() {
            return Err(StoreError::validation("record type must not be empty"));
        }
        if id.is_empty() {
            return Err(StoreError::validation("record id must not be empty"));
        }

        let key = format!(
            "{}{d}{}{d}{}",
            self.escape(&self.ns),
            self.escape(kind),
            self.escape(id),
            d = self.delimiter,
        );

        Ok(RecordKey {
            ns: self.ns.clone(),
            kind: kind.to_string(),
            id: id.to_string(),
            key,
        })
    }

    fn escape(&self, component: &str) -> String {
        if !component.contains('%') && !component.contains(self.delimiter) {
            return component.to_string();
        }
        let mut out = String::with_capacity(component.len() + 3);
        for c in component.chars() {
            if c == '%' {
                out.push_str("%25");
            } else if c == self.delimiter {
                out.push_str(&format!("%{:02X}", c as u32));
            } else {
                out.push(c);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_joins_components() {
        let keys = KeyMaker::new("prod", '/').unwrap();
        let key = keys.derive("test", "a1").unwrap();
        assert_eq!(key.key, "prod/test/a1");
        assert_eq!(key.ns, "prod");
        assert_eq!(key.kind, "test");
        assert_eq!(key.id, "a1");
    }

    #[test]
    fn test_derive_is_deterministic() {
        let keys = KeyMaker::new("prod", '/').unwrap();
        let a = keys.derive("test", "a1").unwrap();
        let b = keys.derive("test", "a1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_id_is_rejected() {
        let keys = KeyMaker::new("prod", '/').unwrap();
        let err = keys.derive("test", "").unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn test_empty_kind_is_rejected() {
        let keys = KeyMaker::new("prod", '/').unwrap();
        let err = keys.derive("", "a1").unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn test_ambiguous_delimiters_are_rejected() {
        // With '%' as delimiter, ("a%", "25b") and ("a", "25%b") would both
        // join to a%25%25b: separator and escape are the same character.
        let err = KeyMaker::new("prod", '%').unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));

        // Code points above U+00FF escape to more than two hex digits, which
        // an escaped '%' followed by literals can imitate.
        let err = KeyMaker::new("prod", '\u{25AB}').unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn test_delimiter_inside_id_does_not_collide() {
        let keys = KeyMaker::new("prod", '/').unwrap();
        // ("a/b", "c") and ("a", "b/c") would both join to prod/a/b/c
        // without escaping.
        let a = keys.derive("a/b", "c").unwrap();
        let b = keys.derive("a", "b/c").unwrap();
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_percent_in_component_round_trips_unambiguously() {
        let keys = KeyMaker::new("prod", '/').unwrap();
        // A literal "%2F" in an id must not collide with an escaped "/".
        let a = keys.derive("test", "a%2Fb").unwrap();
        let b = keys.derive("test", "a/b").unwrap();
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_lookup_ids_derive_like_any_other() {
        let keys = KeyMaker::new("prod", '/').unwrap();
        let key = keys.derive("test", "#name/AAA").unwrap();
        assert_eq!(key.key, "prod/test/#name%2FAAA");
    }
}
