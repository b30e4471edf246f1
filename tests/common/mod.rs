#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::TimeZone;
use eskit::{
    Aggregate, DateTime, Event, EventRecord, InMemoryBackend, SnapshotRecord, StorageBackend,
    StorageError, Utc, Uuid,
    backend::EventQuery,
    event_accessors,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Barrier;

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).unwrap()
}

// Todos, one list per user.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TodoState {
    Todo,
    Doing,
    Done,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub title: String,
    pub state: TodoState,
}

impl Todo {
    pub fn new(title: &str, state: TodoState) -> Self {
        Self {
            title: title.to_string(),
            state,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Todos {
    pub id: String,
    pub todos: Vec<Todo>,
}

impl Aggregate for Todos {
    type Id = String;
    const KEY: &'static str = "todos";

    fn id(&self) -> &String {
        &self.id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TodoCreatedData {
    pub title: String,
}

#[derive(Clone, Debug)]
pub struct TodoCreated {
    pub aggregate_id: String,
    pub data: TodoCreatedData,
    pub created_at: DateTime<Utc>,
}

impl Event for TodoCreated {
    type Aggregate = Todos;
    type Data = TodoCreatedData;
    const TYPE: &'static str = "todoCreated";

    event_accessors!();

    fn apply(&self, aggregate: Option<Todos>) -> Option<Todos> {
        let todo = Todo::new(&self.data.title, TodoState::Todo);
        match aggregate {
            Some(mut todos) => {
                todos.todos.push(todo);
                Some(todos)
            }
            None => Some(Todos {
                id: self.aggregate_id.clone(),
                todos: vec![todo],
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TodoStateChangedData {
    pub index: usize,
    pub state: TodoState,
}

#[derive(Clone, Debug)]
pub struct TodoStateChanged {
    pub aggregate_id: String,
    pub data: TodoStateChangedData,
    pub created_at: DateTime<Utc>,
}

impl Event for TodoStateChanged {
    type Aggregate = Todos;
    type Data = TodoStateChangedData;
    const TYPE: &'static str = "todoStateChanged";

    event_accessors!();

    fn apply(&self, aggregate: Option<Todos>) -> Option<Todos> {
        let mut todos = aggregate?;
        if let Some(todo) = todos.todos.get_mut(self.data.index) {
            todo.state = self.data.state;
        }
        Some(todos)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum TodoError {
    #[error("todo list not found")]
    NotFound,

    #[error("todo {0} is already in that state")]
    AlreadyInState(usize),
}

pub fn create(user: &str, title: &str, created_at: DateTime<Utc>) -> TodoCreated {
    TodoCreated {
        aggregate_id: user.to_string(),
        data: TodoCreatedData {
            title: title.to_string(),
        },
        created_at,
    }
}

pub fn change_state(
    aggregate: Option<&Todos>,
    index: usize,
    state: TodoState,
    created_at: DateTime<Utc>,
) -> Result<TodoStateChanged, TodoError> {
    let todos = aggregate.ok_or(TodoError::NotFound)?;
    let current = todos.todos.get(index).ok_or(TodoError::NotFound)?;
    if current.state == state {
        return Err(TodoError::AlreadyInState(index));
    }
    Ok(TodoStateChanged {
        aggregate_id: todos.id.clone(),
        data: TodoStateChangedData { index, state },
        created_at,
    })
}

// Counters, keyed by a numeric id.

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub id: u32,
    pub count: u64,
}

impl Aggregate for Counter {
    type Id = u32;
    const KEY: &'static str = "counter";

    fn id(&self) -> &u32 {
        &self.id
    }
}

#[derive(Clone, Debug)]
pub struct Incremented {
    pub aggregate_id: u32,
    pub data: u64,
    pub created_at: DateTime<Utc>,
}

impl Event for Incremented {
    type Aggregate = Counter;
    type Data = u64;
    const TYPE: &'static str = "incremented";

    event_accessors!();

    fn apply(&self, aggregate: Option<Counter>) -> Option<Counter> {
        let mut counter = aggregate.unwrap_or(Counter {
            id: self.aggregate_id,
            count: 0,
        });
        counter.count += self.data;
        Some(counter)
    }
}

/// Deletes the counter.
#[derive(Clone, Debug)]
pub struct Discarded {
    pub aggregate_id: u32,
    pub data: (),
    pub created_at: DateTime<Utc>,
}

impl Event for Discarded {
    type Aggregate = Counter;
    type Data = ();
    const TYPE: &'static str = "discarded";

    event_accessors!();

    fn apply(&self, _aggregate: Option<Counter>) -> Option<Counter> {
        None
    }
}

pub fn increment(id: u32, by: u64) -> Incremented {
    Incremented {
        aggregate_id: id,
        data: by,
        created_at: Utc::now(),
    }
}

/// A raw record, for writing what the typed API would refuse to write.
pub fn raw_record(
    event_type: &str,
    aggregate_key: &str,
    aggregate_id: &str,
    step: u64,
    payload: &[u8],
) -> EventRecord {
    EventRecord {
        id: Uuid::new_v4(),
        event_type: event_type.to_string(),
        aggregate_key: aggregate_key.to_string(),
        aggregate_id: aggregate_id.to_string(),
        step,
        payload: payload.to_vec(),
        created_at: Utc::now(),
    }
}

/// Holds the first `gated` event reads until that many readers are waiting,
/// so concurrent commands all observe the same last step.
#[derive(Debug)]
pub struct RacingBackend {
    pub inner: InMemoryBackend,
    barrier: Barrier,
    gated: AtomicUsize,
}

impl RacingBackend {
    pub fn new(readers: usize) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            barrier: Barrier::new(readers),
            gated: AtomicUsize::new(readers),
        }
    }
}

#[async_trait]
impl StorageBackend for RacingBackend {
    async fn insert_event(&self, record: EventRecord) -> Result<(), StorageError> {
        self.inner.insert_event(record).await
    }

    async fn find_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StorageError> {
        let found = self.inner.find_events(query).await?;
        let gated = self
            .gated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if gated {
            self.barrier.wait().await;
        }
        Ok(found)
    }

    async fn find_snapshot(
        &self,
        aggregate_key: &str,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        self.inner.find_snapshot(aggregate_key, aggregate_id).await
    }

    async fn replace_snapshot(
        &self,
        previous: Option<Uuid>,
        next: SnapshotRecord,
    ) -> Result<(), StorageError> {
        self.inner.replace_snapshot(previous, next).await
    }
}

/// Stores events normally but fails every snapshot write.
#[derive(Debug, Default)]
pub struct FailingSnapshotBackend {
    pub inner: InMemoryBackend,
}

#[async_trait]
impl StorageBackend for FailingSnapshotBackend {
    async fn insert_event(&self, record: EventRecord) -> Result<(), StorageError> {
        self.inner.insert_event(record).await
    }

    async fn find_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>, StorageError> {
        self.inner.find_events(query).await
    }

    async fn find_snapshot(
        &self,
        aggregate_key: &str,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRecord>, StorageError> {
        self.inner.find_snapshot(aggregate_key, aggregate_id).await
    }

    async fn replace_snapshot(
        &self,
        _previous: Option<Uuid>,
        _next: SnapshotRecord,
    ) -> Result<(), StorageError> {
        Err(StorageError::Backend(anyhow!("snapshot storage is read-only")))
    }
}
