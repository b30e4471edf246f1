//! SQLite storage via `sqlx`.
//!
//! Tables:
//! - `eskit_events`, unique on `(aggregate_key, aggregate_id, step)`, indexed on `(type, step)`.
//! - `eskit_snapshots`, unique on `(aggregate_key, aggregate_id)`.
//!
//! Timestamps are stored as fixed-width RFC 3339 text so that text order is
//! chronological order.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

use super::{
    EVENT_STEP_CONSTRAINT, EventQuery, Field, Predicate, SNAPSHOT_CONSTRAINT, SortKey,
    StorageBackend, StorageError,
};
use crate::{EventRecord, SnapshotRecord, Uuid};

const SCHEMA: [&str; 3] = [
    r"CREATE TABLE IF NOT EXISTS eskit_events (
        id TEXT PRIMARY KEY NOT NULL,
        type TEXT NOT NULL,
        step INTEGER NOT NULL,
        aggregate_key TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        payload BLOB NOT NULL,
        created_at TEXT NOT NULL,
        CONSTRAINT eskit_events_stream_step UNIQUE (aggregate_key, aggregate_id, step)
    )",
    r"CREATE INDEX IF NOT EXISTS eskit_events_type_step ON eskit_events (type, step)",
    r"CREATE TABLE IF NOT EXISTS eskit_snapshots (
        id TEXT PRIMARY KEY NOT NULL,
        last_step INTEGER NOT NULL,
        aggregate_key TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        payload BLOB NOT NULL,
        CONSTRAINT eskit_snapshots_stream UNIQUE (aggregate_key, aggregate_id)
    )",
];

const SELECT_EVENTS: &str =
    "SELECT id, type, step, aggregate_key, aggregate_id, payload, created_at FROM eskit_events";

/// Event and snapshot storage in a SQLite database.
#[derive(Clone, Debug)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePool::connect(url).await.map_err(backend_error)?;
        Ok(Self::new(pool))
    }

    /// A private in-memory database, kept alive on a single pooled connection.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await
            .map_err(backend_error)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend_error)?;
        }
        tracing::debug!("Applied eskit schema");
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn insert_event(&self, record: EventRecord) -> Result<(), StorageError> {
        sqlx::query(
            r"INSERT INTO eskit_events (id, type, step, aggregate_key, aggregate_id, payload, created_at)
              VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.event_type)
        .bind(to_db_step(record.step)?)
        .bind(record.aggregate_key)
        .bind(record.aggregate_id)
        .bind(record.payload)
        .bind(to_db_time(&record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|err| classify(err, EVENT_STEP_CONSTRAINT))?;

        Ok(())
    }

    async fn find_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StorageError> {
        if query.groups().is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = sqlx::QueryBuilder::<sqlx::Sqlite>::new(SELECT_EVENTS);
        sql.push(" WHERE ");
        for (index, group) in query.groups().iter().enumerate() {
            if index > 0 {
                sql.push(" OR ");
            }
            sql.push("(");
            if group.is_empty() {
                sql.push("1 = 1");
            }
            for (position, predicate) in group.iter().enumerate() {
                if position > 0 {
                    sql.push(" AND ");
                }
                match predicate {
                    Predicate::Equals(field, value) => {
                        sql.push(column(*field));
                        sql.push(" = ");
                        sql.push_bind(value.clone());
                    }
                    Predicate::StepAfter(step) => {
                        sql.push("step > ");
                        sql.push_bind(to_db_step(*step)?);
                    }
                }
            }
            sql.push(")");
        }
        for (index, key) in query.sort_keys().iter().enumerate() {
            sql.push(if index == 0 { " ORDER BY " } else { ", " });
            sql.push(sort_column(*key));
        }

        let rows = sql
            .build_query_as::<EventRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(backend_error)?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    async fn find_snapshot(
        &self,
        aggregate_key: &str,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r"SELECT id, last_step, aggregate_key, aggregate_id, payload
              FROM eskit_snapshots
              WHERE aggregate_key = ? AND aggregate_id = ?",
        )
        .bind(aggregate_key.to_string())
        .bind(aggregate_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;

        row.map(SnapshotRecord::try_from).transpose()
    }

    async fn replace_snapshot(
        &self,
        previous: Option<Uuid>,
        next: SnapshotRecord,
    ) -> Result<(), StorageError> {
        let last_step = to_db_step(next.last_step)?;
        let mut tx = self.pool.begin().await.map_err(backend_error)?;

        if let Some(previous) = previous {
            sqlx::query("DELETE FROM eskit_snapshots WHERE id = ?")
                .bind(previous.to_string())
                .execute(&mut *tx)
                .await
                .map_err(backend_error)?;
        }

        sqlx::query(
            r"INSERT INTO eskit_snapshots (id, last_step, aggregate_key, aggregate_id, payload)
              VALUES (?, ?, ?, ?, ?)",
        )
        .bind(next.id.to_string())
        .bind(last_step)
        .bind(next.aggregate_key)
        .bind(next.aggregate_id)
        .bind(next.payload)
        .execute(&mut *tx)
        .await
        .map_err(|err| classify(err, SNAPSHOT_CONSTRAINT))?;

        tx.commit().await.map_err(backend_error)?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    step: i64,
    aggregate_key: String,
    aggregate_id: String,
    payload: Vec<u8>,
    created_at: String,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = StorageError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            event_type: row.event_type,
            aggregate_key: row.aggregate_key,
            aggregate_id: row.aggregate_id,
            step: from_db_step(row.step)?,
            payload: row.payload,
            created_at: from_db_time(&row.created_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    id: String,
    last_step: i64,
    aggregate_key: String,
    aggregate_id: String,
    payload: Vec<u8>,
}

impl TryFrom<SnapshotRow> for SnapshotRecord {
    type Error = StorageError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            aggregate_key: row.aggregate_key,
            aggregate_id: row.aggregate_id,
            last_step: from_db_step(row.last_step)?,
            payload: row.payload,
        })
    }
}

const fn column(field: Field) -> &'static str {
    match field {
        Field::EventType => "type",
        Field::AggregateKey => "aggregate_key",
        Field::AggregateId => "aggregate_id",
    }
}

const fn sort_column(key: SortKey) -> &'static str {
    match key {
        SortKey::EventType => "type",
        SortKey::Step => "step",
        SortKey::CreatedAt => "created_at",
        SortKey::RecordId => "id",
    }
}

fn classify(err: sqlx::Error, constraint: &'static str) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StorageError::UniqueViolation { constraint };
        }
    }
    backend_error(err)
}

fn backend_error(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.into())
}

fn to_db_step(step: u64) -> Result<i64, StorageError> {
    i64::try_from(step).map_err(|_| StorageError::Backend(anyhow!("step {step} exceeds i64")))
}

fn from_db_step(step: i64) -> Result<u64, StorageError> {
    u64::try_from(step).map_err(|_| StorageError::Backend(anyhow!("negative step {step} in storage")))
}

fn to_db_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn from_db_time(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| StorageError::Backend(anyhow!("invalid timestamp `{raw}`: {err}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|err| StorageError::Backend(anyhow!("invalid record id `{raw}`: {err}")))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn stored_timestamps_sort_chronologically_as_text() {
        let earlier = Utc.timestamp_opt(999, 5).unwrap();
        let later = Utc.timestamp_opt(1000, 0).unwrap();

        assert!(to_db_time(&earlier) < to_db_time(&later));
        assert_eq!(from_db_time(&to_db_time(&earlier)).unwrap(), earlier);
    }

    #[test]
    fn negative_steps_are_rejected() {
        assert!(from_db_step(-1).is_err());
        assert_eq!(from_db_step(7).unwrap(), 7);
    }
}
