//! The storage boundary.
//!
//! A backend only has to insert records under two uniqueness constraints,
//! filter events by equality and `step >` predicates combined as an OR of
//! AND-groups, sort them, and replace a snapshot atomically.

use std::cmp::Ordering;

use async_trait::async_trait;
use thiserror::Error;

use crate::{EventRecord, SnapshotRecord, Uuid};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Uniqueness of `(aggregate_key, aggregate_id, step)` over events.
pub const EVENT_STEP_CONSTRAINT: &str = "eskit_events_stream_step";

/// Uniqueness of `(aggregate_key, aggregate_id)` over snapshots.
pub const SNAPSHOT_CONSTRAINT: &str = "eskit_snapshots_stream";

#[derive(Error, Debug)]
pub enum StorageError {
    /// The insert would violate one of the two uniqueness constraints.
    #[error("Uniqueness constraint `{constraint}` violated")]
    UniqueViolation { constraint: &'static str },

    #[error("Backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

/// The `StorageBackend` trait defines how event and snapshot records are persisted.
///
/// Implementations must reject an `insert_event` whose
/// `(aggregate_key, aggregate_id, step)` already exists with
/// [`StorageError::UniqueViolation`]: this is the only concurrency control the
/// repository relies on.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Appends an event record.
    async fn insert_event(&self, record: EventRecord) -> Result<(), StorageError>;

    /// Returns every event record matching `query`, sorted by its sort keys.
    async fn find_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StorageError>;

    /// Loads the snapshot of one aggregate, if any.
    async fn find_snapshot(
        &self,
        aggregate_key: &str,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRecord>, StorageError>;

    /// Deletes the snapshot with id `previous` (when given) and inserts `next`, atomically.
    ///
    /// Readers must observe either the old or the new snapshot. If another
    /// snapshot for the same aggregate is still present after the delete, the
    /// insert fails with [`StorageError::UniqueViolation`].
    async fn replace_snapshot(
        &self,
        previous: Option<Uuid>,
        next: SnapshotRecord,
    ) -> Result<(), StorageError>;
}

/// Event record columns that support equality filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    EventType,
    AggregateKey,
    AggregateId,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Predicate {
    Equals(Field, String),
    StepAfter(u64),
}

impl Predicate {
    pub fn matches(&self, record: &EventRecord) -> bool {
        match self {
            Predicate::Equals(Field::EventType, value) => record.event_type == *value,
            Predicate::Equals(Field::AggregateKey, value) => record.aggregate_key == *value,
            Predicate::Equals(Field::AggregateId, value) => record.aggregate_id == *value,
            Predicate::StepAfter(step) => record.step > *step,
        }
    }
}

/// Ascending sort keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKey {
    EventType,
    Step,
    CreatedAt,
    RecordId,
}

impl SortKey {
    fn compare(self, a: &EventRecord, b: &EventRecord) -> Ordering {
        match self {
            SortKey::EventType => a.event_type.cmp(&b.event_type),
            SortKey::Step => a.step.cmp(&b.step),
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
            SortKey::RecordId => a.id.cmp(&b.id),
        }
    }
}

/// A filter over event records: an OR of AND-groups of [`Predicate`]s, plus a sort order.
///
/// A query without groups matches nothing; an empty group matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventQuery {
    groups: Vec<Vec<Predicate>>,
    sort: Vec<SortKey>,
}

impl EventQuery {
    /// Events of one aggregate with `step > after_step`, in step order.
    pub fn stream(aggregate_key: &str, aggregate_id: &str, after_step: u64) -> Self {
        Self::any_of([vec![
            Predicate::Equals(Field::AggregateKey, aggregate_key.to_string()),
            Predicate::Equals(Field::AggregateId, aggregate_id.to_string()),
            Predicate::StepAfter(after_step),
        ]])
        .sorted_by([SortKey::Step])
    }

    pub fn any_of<I>(groups: I) -> Self
    where
        I: IntoIterator<Item = Vec<Predicate>>,
    {
        Self {
            groups: groups.into_iter().collect(),
            sort: Vec::new(),
        }
    }

    #[must_use]
    pub fn sorted_by<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = SortKey>,
    {
        self.sort = keys.into_iter().collect();
        self
    }

    pub fn groups(&self) -> &[Vec<Predicate>] {
        &self.groups
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort
    }

    pub fn matches(&self, record: &EventRecord) -> bool {
        self.groups
            .iter()
            .any(|group| group.iter().all(|predicate| predicate.matches(record)))
    }

    /// Compares two records by this query's sort keys.
    pub fn compare(&self, a: &EventRecord, b: &EventRecord) -> Ordering {
        self.sort
            .iter()
            .fold(Ordering::Equal, |ordering, key| {
                ordering.then_with(|| key.compare(a, b))
            })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn record(event_type: &str, aggregate_id: &str, step: u64) -> EventRecord {
        EventRecord {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            aggregate_key: "todos".to_string(),
            aggregate_id: aggregate_id.to_string(),
            step,
            payload: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn stream_query_selects_one_aggregate_after_a_step() {
        let query = EventQuery::stream("todos", "user1", 2);

        assert!(query.matches(&record("todoCreated", "user1", 3)));
        assert!(!query.matches(&record("todoCreated", "user1", 2)));
        assert!(!query.matches(&record("todoCreated", "user2", 3)));
    }

    #[test]
    fn groups_are_or_ed_and_predicates_and_ed() {
        let query = EventQuery::any_of([
            vec![Predicate::Equals(Field::EventType, "a".to_string())],
            vec![
                Predicate::Equals(Field::EventType, "b".to_string()),
                Predicate::Equals(Field::AggregateId, "user1".to_string()),
            ],
        ]);

        assert!(query.matches(&record("a", "user2", 1)));
        assert!(query.matches(&record("b", "user1", 1)));
        assert!(!query.matches(&record("b", "user2", 1)));
        assert!(!query.matches(&record("c", "user1", 1)));
    }

    #[test]
    fn query_without_groups_matches_nothing() {
        assert!(!EventQuery::default().matches(&record("a", "user1", 1)));
        assert!(EventQuery::any_of([vec![]]).matches(&record("a", "user1", 1)));
    }

    #[test]
    fn compare_uses_sort_keys_in_order() {
        let query = EventQuery::default().sorted_by([SortKey::EventType, SortKey::Step]);

        assert_eq!(
            query.compare(&record("a", "user1", 5), &record("b", "user1", 1)),
            Ordering::Less
        );
        assert_eq!(
            query.compare(&record("b", "user1", 1), &record("b", "user1", 2)),
            Ordering::Less
        );
    }
}
