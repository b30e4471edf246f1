use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    EVENT_STEP_CONSTRAINT, EventQuery, SNAPSHOT_CONSTRAINT, StorageBackend, StorageError,
};
use crate::{EventRecord, SnapshotRecord, Uuid};

type StreamKey = (String, String);

/// Keeps events and snapshots in process memory.
///
/// Both uniqueness constraints are enforced under a write lock, which also
/// makes snapshot replacement atomic for readers. Intended for tests and
/// local development.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    events: RwLock<Vec<EventRecord>>,
    snapshots: RwLock<HashMap<StreamKey, SnapshotRecord>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes the snapshot of one aggregate out of band, returning it.
    pub async fn remove_snapshot(
        &self,
        aggregate_key: &str,
        aggregate_id: &str,
    ) -> Option<SnapshotRecord> {
        self.snapshots
            .write()
            .await
            .remove(&(aggregate_key.to_string(), aggregate_id.to_string()))
    }

    /// Every stored event, in insertion order.
    pub async fn events(&self) -> Vec<EventRecord> {
        self.events.read().await.clone()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn insert_event(&self, record: EventRecord) -> Result<(), StorageError> {
        let mut events = self.events.write().await;
        let taken = events.iter().any(|existing| {
            existing.aggregate_key == record.aggregate_key
                && existing.aggregate_id == record.aggregate_id
                && existing.step == record.step
        });
        if taken {
            return Err(StorageError::UniqueViolation {
                constraint: EVENT_STEP_CONSTRAINT,
            });
        }
        events.push(record);
        Ok(())
    }

    async fn find_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StorageError> {
        let mut found: Vec<EventRecord> = self
            .events
            .read()
            .await
            .iter()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        found.sort_by(|a, b| query.compare(a, b));
        Ok(found)
    }

    async fn find_snapshot(
        &self,
        aggregate_key: &str,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(&(aggregate_key.to_string(), aggregate_id.to_string()))
            .cloned())
    }

    async fn replace_snapshot(
        &self,
        previous: Option<Uuid>,
        next: SnapshotRecord,
    ) -> Result<(), StorageError> {
        let mut snapshots = self.snapshots.write().await;
        if let Some(previous) = previous {
            snapshots.retain(|_, snapshot| snapshot.id != previous);
        }

        let key = (next.aggregate_key.clone(), next.aggregate_id.clone());
        if snapshots.contains_key(&key) {
            return Err(StorageError::UniqueViolation {
                constraint: SNAPSHOT_CONSTRAINT,
            });
        }
        snapshots.insert(key, next);
        Ok(())
    }
}
