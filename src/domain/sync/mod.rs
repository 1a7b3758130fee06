//! Sync domain - Change propagation contract for table streams

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::domain::error::StoreError;
use crate::domain::record::Record;

/// What happened to a record in the underlying table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Modify => "modify",
            Self::Remove => "remove",
        }
    }
}

/// One change observed on the table, as delivered by a backend's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Id of the changed record.
    pub id: String,
    /// Record state after the change (last known state for removes).
    pub item: Record,
    /// Names of the fields the change touched, when the stream knows them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed: Option<Vec<String>>,
    /// Record state before the change, when the stream carries it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Record>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, id: impl Into<String>, item: Record) -> Self {
        Self {
            kind,
            id: id.into(),
            item,
            changed: None,
            previous: None,
        }
    }

    pub fn with_changed(mut self, fields: Vec<String>) -> Self {
        self.changed = Some(fields);
        self
    }

    pub fn with_previous(mut self, previous: Record) -> Self {
        self.previous = Some(previous);
        self
    }
}

/// Downstream consumer of record changes.
///
/// Implementations live outside the engine (replication, cache invalidation,
/// audit trails); the engine only defines the contract and the gate in
/// [`dispatch`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChangeListener: Send + Sync {
    /// Cheap predicate run before forwarding; lets a listener subscribe to a
    /// slice of the table.
    fn filter(&self, id: &str, item: &Record) -> bool;

    /// Runs ahead of a forward; an error here skips the forward.
    async fn on_before_sync(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        let _ = event;
        Ok(())
    }

    /// Delivers one change to the listener.
    async fn forward(&self, event: &ChangeEvent) -> Result<(), StoreError>;

    /// Runs after a successful forward.
    async fn on_after_sync(&self, event: &ChangeEvent) -> Result<(), StoreError> {
        let _ = event;
        Ok(())
    }
}

/// Records that never leave the engine: lookups, counters and anything else
/// whose type or stereotype is `#`-marked.
pub fn is_syncable(item: &Record) -> bool {
    !item.is_internal()
}

/// Routes one event through the internal-record gate, the listener's own
/// filter and its hooks. Returns whether the event was forwarded.
pub async fn dispatch(
    listener: &dyn ChangeListener,
    event: &ChangeEvent,
) -> Result<bool, StoreError> {
    if !is_syncable(&event.item) {
        return Ok(false);
    }
    if !listener.filter(&event.id, &event.item) {
        return Ok(false);
    }
    listener.on_before_sync(event).await?;
    listener.forward(event).await?;
    listener.on_after_sync(event).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: ChangeKind, record: Record) -> ChangeEvent {
        ChangeEvent::new(kind, record.id.clone(), record)
    }

    #[tokio::test]
    async fn test_dispatch_forwards_ordinary_records() {
        let mut listener = MockChangeListener::new();
        listener.expect_filter().return_const(true);
        listener.expect_on_before_sync().once().returning(|_| Ok(()));
        listener.expect_forward().once().returning(|_| Ok(()));
        listener.expect_on_after_sync().once().returning(|_| Ok(()));

        let e = event(ChangeKind::Insert, Record::new("a1").with_kind("test"));
        let forwarded = dispatch(&listener, &e).await.unwrap();
        assert!(forwarded);
    }

    #[tokio::test]
    async fn test_dispatch_skips_internal_records() {
        let mut listener = MockChangeListener::new();
        listener.expect_filter().never();
        listener.expect_on_before_sync().never();
        listener.expect_forward().never();
        listener.expect_on_after_sync().never();

        let lookup = Record::new("#name/AAA").with_kind("test").with_stereo("#");
        let e = event(ChangeKind::Insert, lookup);
        assert!(!dispatch(&listener, &e).await.unwrap());

        let counter = Record::new("test").with_kind("sequence").with_stereo("#");
        let e = event(ChangeKind::Modify, counter);
        assert!(!dispatch(&listener, &e).await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_respects_listener_filter() {
        let mut listener = MockChangeListener::new();
        listener.expect_filter().return_const(false);
        listener.expect_on_before_sync().never();
        listener.expect_forward().never();
        listener.expect_on_after_sync().never();

        let e = event(ChangeKind::Modify, Record::new("a1").with_kind("test"));
        assert!(!dispatch(&listener, &e).await.unwrap());
    }

    #[tokio::test]
    async fn test_before_hook_failure_skips_the_forward() {
        let mut listener = MockChangeListener::new();
        listener.expect_filter().return_const(true);
        listener
            .expect_on_before_sync()
            .returning(|_| Err(StoreError::backend("index offline")));
        listener.expect_forward().never();
        listener.expect_on_after_sync().never();

        let e = event(ChangeKind::Insert, Record::new("a1").with_kind("test"));
        assert!(dispatch(&listener, &e).await.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_propagates_listener_failure() {
        let mut listener = MockChangeListener::new();
        listener.expect_filter().return_const(true);
        listener.expect_on_before_sync().returning(|_| Ok(()));
        listener
            .expect_forward()
            .returning(|_| Err(StoreError::backend("stream closed")));
        listener.expect_on_after_sync().never();

        let e = event(ChangeKind::Remove, Record::new("a1").with_kind("test"));
        assert!(dispatch(&listener, &e).await.is_err());
    }

    #[test]
    fn test_soft_deleted_records_remain_syncable() {
        let mut record = Record::new("a1").with_kind("test");
        record.deleted_at = 1_700_000_000_000;
        assert!(is_syncable(&record));
    }

    #[test]
    fn test_change_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ChangeKind::Insert).unwrap(),
            "\"insert\""
        );
        assert_eq!(ChangeKind::Remove.as_str(), "remove");
    }

    #[test]
    fn test_event_extras_are_omitted_when_unset() {
        let e = event(ChangeKind::Modify, Record::new("a1").with_kind("test"));
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("changed").is_none());
        assert!(json.get("previous").is_none());

        let e = e
            .with_changed(vec!["name".into()])
            .with_previous(Record::new("a1").with_kind("test"));
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["changed"][0], "name");
        assert!(json.get("previous").is_some());
    }
}
