//! Event-sourcing kit.
//!
//! Aggregates are derived values: [`Repository`] rebuilds them by folding their
//! immutable events, starting from the latest snapshot when one exists. New
//! events are appended with a per-aggregate `step` that doubles as the
//! optimistic-concurrency token, and [`QueryBuilder`] folds any set of event
//! types into a read model.
//!
//! The engine knows nothing about concrete storage: any [`StorageBackend`]
//! that can insert under a uniqueness constraint, filter and sort event
//! records, and swap a snapshot atomically will do. [`InMemoryBackend`] ships
//! with the crate, and `SqliteBackend` is available behind the `sqlite`
//! feature.

mod aggregate;
pub mod backend;
mod codec;
mod config;
mod dispatch;
mod error;
mod event;
mod query;
mod record;
mod repository;

pub use aggregate::{Aggregate, AggregateId};
pub use backend::{InMemoryBackend, StorageBackend, StorageError};
pub use codec::{JsonCodec, PayloadCodec};
pub use config::RepositoryConfig;
pub use dispatch::{DispatchTable, ErasedAggregate};
pub use error::{EsError, Result};
pub use event::{Event, IdOf};
pub use query::QueryBuilder;
pub use record::{EventRecord, SnapshotRecord, fold_order};
pub use repository::{Replay, Repository, RepositoryBuilder};

pub use chrono::{DateTime, Utc};
pub use uuid::Uuid;
