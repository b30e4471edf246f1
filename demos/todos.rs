/// # Eskit Example: Todo Lists
///
/// Each user owns one `Todos` aggregate. Two event types build it up, the
/// repository replays it on every command, and a query folds every list into
/// a board-wide tally of how many todos were created and moved into each state.
///
/// ## Usage
///
/// ```sh
/// RUST_LOG=eskit=debug cargo run --example todos
/// ```
use std::collections::BTreeMap;

use eskit::{
    Aggregate, DateTime, Event, InMemoryBackend, RepositoryBuilder, RepositoryConfig, Utc,
    event_accessors,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Aggregate
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
enum State {
    Todo,
    Doing,
    Done,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Todo {
    title: String,
    state: State,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Todos {
    id: String,
    todos: Vec<Todo>,
}

impl Aggregate for Todos {
    type Id = String;
    const KEY: &'static str = "todos";

    fn id(&self) -> &String {
        &self.id
    }
}

// Events
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Title(String);

#[derive(Clone, Debug)]
struct TodoCreated {
    aggregate_id: String,
    data: Title,
    created_at: DateTime<Utc>,
}

impl Event for TodoCreated {
    type Aggregate = Todos;
    type Data = Title;
    const TYPE: &'static str = "todoCreated";

    event_accessors!();

    fn apply(&self, aggregate: Option<Todos>) -> Option<Todos> {
        let mut todos = aggregate.unwrap_or(Todos {
            id: self.aggregate_id.clone(),
            todos: Vec::new(),
        });
        todos.todos.push(Todo {
            title: self.data.0.clone(),
            state: State::Todo,
        });
        Some(todos)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Move {
    index: usize,
    state: State,
}

#[derive(Clone, Debug)]
struct TodoStateChanged {
    aggregate_id: String,
    data: Move,
    created_at: DateTime<Utc>,
}

impl Event for TodoStateChanged {
    type Aggregate = Todos;
    type Data = Move;
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

// Decisions
#[derive(Error, Debug)]
enum TodoError {
    #[error("no todo at index {0}")]
    Missing(usize),

    #[error("todo {0} is already {1:?}")]
    Unchanged(usize, State),
}

fn move_todo(
    todos: Option<&Todos>,
    index: usize,
    state: State,
) -> Result<Option<TodoStateChanged>, TodoError> {
    let todos = todos.ok_or(TodoError::Missing(index))?;
    let todo = todos.todos.get(index).ok_or(TodoError::Missing(index))?;
    if todo.state == state {
        return Err(TodoError::Unchanged(index, state));
    }
    Ok(Some(TodoStateChanged {
        aggregate_id: todos.id.clone(),
        data: Move { index, state },
        created_at: Utc::now(),
    }))
}

fn created(user: &str, title: &str) -> TodoCreated {
    TodoCreated {
        aggregate_id: user.to_string(),
        data: Title(title.to_string()),
        created_at: Utc::now(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config: RepositoryConfig = serde_json::from_str(r#"{ "snapshot_every": 2 }"#)?;
    let repository = RepositoryBuilder::new(InMemoryBackend::new())
        .config(config)
        .subscribe::<TodoCreated>()
        .subscribe::<TodoStateChanged>()
        .build();

    let alice = "alice".to_string();
    let bob = "bob".to_string();

    repository
        .command::<TodoCreated, _>(&alice, |_| Some(created("alice", "write the report")))
        .await?;
    repository
        .command::<TodoCreated, _>(&bob, |_| Some(created("bob", "book the venue")))
        .await?;
    repository
        .command::<TodoCreated, _>(&alice, |_| Some(created("alice", "review the budget")))
        .await?;
    repository
        .try_command::<TodoStateChanged, _, _>(&alice, |todos| move_todo(todos, 0, State::Doing))
        .await?;
    repository
        .try_command::<TodoStateChanged, _, _>(&bob, |todos| move_todo(todos, 0, State::Done))
        .await?;

    if let Err(err) = repository
        .try_command::<TodoStateChanged, _, _>(&bob, |todos| move_todo(todos, 0, State::Done))
        .await
    {
        info!(error = %err, "command rejected");
    }

    repository.quiesce().await;

    let replay = repository.replay::<Todos>(&alice).await?;
    info!(
        last_step = replay.last_step,
        snapshot_step = ?replay.snapshot_step(),
        todos = ?replay.aggregate,
        "alice's list"
    );

    let board = repository
        .query(BTreeMap::<State, usize>::new())
        .pipe::<TodoCreated, _>(|mut board, _| {
            *board.entry(State::Todo).or_default() += 1;
            board
        })
        .pipe::<TodoStateChanged, _>(|mut board, event| {
            *board.entry(event.data.state).or_default() += 1;
            board
        })
        .build()
        .await?;
    info!(?board, "board summary");

    Ok(())
}
