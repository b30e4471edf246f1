use std::{
    convert::Infallible,
    fmt::{self, Debug, Formatter},
    sync::{Arc, Mutex, PoisonError},
};

use tokio::task::JoinHandle;

use crate::{
    Aggregate, DispatchTable, EsError, Event, EventRecord, IdOf, JsonCodec, PayloadCodec,
    QueryBuilder, RepositoryConfig, Result, SnapshotRecord, Uuid,
    backend::{EventQuery, StorageBackend, StorageError},
};

/// Configures a [`Repository`]: codec, config and the event types it can replay.
///
/// Registration happens here, before the repository exists, so the dispatch
/// table is read-only by the time any command or query can run.
///
/// ```rust,ignore
/// let repository = RepositoryBuilder::new(InMemoryBackend::new())
///     .subscribe::<TodoCreated>()
///     .subscribe::<TodoStateChanged>()
///     .build();
/// ```
pub struct RepositoryBuilder<B, C = JsonCodec> {
    backend: B,
    codec: C,
    dispatch: DispatchTable<C>,
    config: RepositoryConfig,
}

impl<B: StorageBackend> RepositoryBuilder<B, JsonCodec> {
    pub fn new(backend: B) -> Self {
        Self::with_codec(backend, JsonCodec)
    }
}

impl<B, C> RepositoryBuilder<B, C>
where
    B: StorageBackend,
    C: PayloadCodec,
{
    pub fn with_codec(backend: B, codec: C) -> Self {
        Self {
            backend,
            codec,
            dispatch: DispatchTable::new(),
            config: RepositoryConfig::default(),
        }
    }

    #[must_use]
    pub fn config(mut self, config: RepositoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers `E` in the dispatch table so stored events of its type can be replayed.
    #[must_use]
    pub fn subscribe<E: Event>(mut self) -> Self {
        self.dispatch.register::<E>();
        self
    }

    pub fn build(self) -> Repository<B, C> {
        Repository {
            backend: Arc::new(self.backend),
            codec: self.codec,
            dispatch: Arc::new(self.dispatch),
            config: self.config,
            refreshes: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// The event store.
///
/// Derives aggregates by replaying their events from the latest snapshot,
/// appends new events under optimistic concurrency, and hands out
/// [`QueryBuilder`]s for read-side folds. Cloning is cheap: every clone shares
/// the backend, the dispatch table and the pending snapshot refreshes.
pub struct Repository<B, C = JsonCodec> {
    pub(crate) backend: Arc<B>,
    pub(crate) codec: C,
    dispatch: Arc<DispatchTable<C>>,
    config: RepositoryConfig,
    refreshes: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<B, C: Clone> Clone for Repository<B, C> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            codec: self.codec.clone(),
            dispatch: Arc::clone(&self.dispatch),
            config: self.config.clone(),
            refreshes: Arc::clone(&self.refreshes),
        }
    }
}

impl<B, C> Debug for Repository<B, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("dispatch", &self.dispatch)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The outcome of replaying one aggregate.
#[derive(Clone, Debug, PartialEq)]
pub struct Replay<A> {
    /// The derived aggregate, `None` if it has no snapshot and no events.
    pub aggregate: Option<A>,

    /// Step of the last event folded in, or of the snapshot when no newer events exist.
    pub last_step: u64,

    snapshot: Option<SnapshotRecord>,
}

impl<A> Replay<A> {
    /// The step of the snapshot the replay started from, if one was used.
    pub fn snapshot_step(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|snapshot| snapshot.last_step)
    }
}

impl<B, C> Repository<B, C>
where
    B: StorageBackend,
    C: PayloadCodec,
{
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn dispatch_table(&self) -> &DispatchTable<C> {
        &self.dispatch
    }

    /// Loads the aggregate, lets `transition` decide on a new event and appends it.
    ///
    /// Returns the appended event, or `None` when the transition declined
    /// (nothing is written in that case). A lost race against another writer
    /// for the same step yields [`EsError::AppendConflict`].
    pub async fn command<E, F>(&self, aggregate_id: &IdOf<E>, transition: F) -> Result<Option<E>>
    where
        E: Event,
        F: FnOnce(Option<&E::Aggregate>) -> Option<E>,
    {
        self.try_command(aggregate_id, |aggregate| {
            Ok::<_, Infallible>(transition(aggregate))
        })
        .await
    }

    /// Like [`command`](Self::command), for transitions that can reject the command.
    ///
    /// A rejection surfaces as [`EsError::Transition`].
    pub async fn try_command<E, F, X>(
        &self,
        aggregate_id: &IdOf<E>,
        transition: F,
    ) -> Result<Option<E>>
    where
        E: Event,
        F: FnOnce(Option<&E::Aggregate>) -> std::result::Result<Option<E>, X>,
        X: Into<anyhow::Error>,
    {
        let aggregate_key = <E::Aggregate as Aggregate>::KEY;
        let Replay {
            aggregate,
            last_step,
            snapshot,
        } = self.replay::<E::Aggregate>(aggregate_id).await?;

        let event = match transition(aggregate.as_ref()) {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::debug!(
                    aggregate_key,
                    aggregate_id = %aggregate_id,
                    "transition declined, nothing appended"
                );
                return Ok(None);
            }
            Err(err) => return Err(EsError::Transition(err.into())),
        };

        if event.aggregate_id() != aggregate_id {
            return Err(EsError::EventAggregateMismatch {
                expected: aggregate_id.to_string(),
                found: event.aggregate_id().to_string(),
            });
        }

        let step = last_step + 1;
        let record = EventRecord::from_event(&event, step, &self.codec)?;
        match self.backend.insert_event(record).await {
            Ok(()) => {}
            Err(StorageError::UniqueViolation { .. }) => {
                tracing::debug!(
                    aggregate_key,
                    aggregate_id = %aggregate_id,
                    step,
                    "lost append race"
                );
                return Err(EsError::AppendConflict {
                    aggregate_key,
                    aggregate_id: aggregate_id.to_string(),
                    step,
                });
            }
            Err(err) => return Err(err.into()),
        }

        tracing::debug!(
            aggregate_key,
            aggregate_id = %aggregate_id,
            event_type = E::TYPE,
            step,
            "appended event"
        );

        self.refresh_snapshot(
            snapshot.map(|snapshot| snapshot.id),
            event.apply(aggregate),
            step,
        );

        Ok(Some(event))
    }

    /// Derives the current state of an aggregate, `None` if it has no snapshot and no events.
    pub async fn find_aggregate<A: Aggregate>(&self, aggregate_id: &A::Id) -> Result<Option<A>> {
        Ok(self.replay::<A>(aggregate_id).await?.aggregate)
    }

    /// Loads the snapshot, then folds every later event through the dispatch table in step order.
    pub async fn replay<A: Aggregate>(&self, aggregate_id: &A::Id) -> Result<Replay<A>> {
        let id = aggregate_id.to_string();
        let snapshot = self.backend.find_snapshot(A::KEY, &id).await?;
        let snapshot_step = snapshot.as_ref().map_or(0, |snapshot| snapshot.last_step);

        let records = self
            .backend
            .find_events(&EventQuery::stream(A::KEY, &id, snapshot_step))
            .await?;

        let mut aggregate = snapshot
            .as_ref()
            .map(|snapshot| snapshot.to_aggregate::<A, C>(&self.codec))
            .transpose()?;
        let mut last_step = snapshot_step;
        for record in &records {
            aggregate = self.dispatch.replay_step(&self.codec, record, aggregate)?;
            last_step = record.step;
        }

        tracing::debug!(
            aggregate_key = A::KEY,
            aggregate_id = %id,
            snapshot_step,
            replayed = records.len(),
            last_step,
            "replayed aggregate"
        );

        Ok(Replay {
            aggregate,
            last_step,
            snapshot,
        })
    }

    /// Starts a read-side fold over the event log.
    pub fn query<R>(&self, initial: R) -> QueryBuilder<B, C, R>
    where
        R: Send + 'static,
    {
        QueryBuilder::new(self.clone(), initial)
    }

    /// Waits until every snapshot refresh spawned so far has finished.
    pub async fn quiesce(&self) {
        let pending = std::mem::take(
            &mut *self
                .refreshes
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for handle in pending {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "snapshot refresh task did not complete");
            }
        }
    }

    // Runs detached from the command: its failure is logged, never returned.
    // Outside a tokio runtime there is nothing to run it on, so it is skipped.
    fn refresh_snapshot<A: Aggregate>(
        &self,
        previous: Option<Uuid>,
        aggregate: Option<A>,
        last_step: u64,
    ) {
        if !self.config.should_snapshot(last_step) {
            return;
        }
        let Some(aggregate) = aggregate else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                aggregate_key = A::KEY,
                last_step,
                "no tokio runtime, snapshot refresh skipped"
            );
            return;
        };

        let next = match SnapshotRecord::from_aggregate(&aggregate, last_step, &self.codec) {
            Ok(next) => next,
            Err(err) => {
                tracing::warn!(aggregate_key = A::KEY, error = %err, "cannot encode snapshot");
                return;
            }
        };

        let backend = Arc::clone(&self.backend);
        let handle = runtime.spawn(async move {
            let aggregate_id = next.aggregate_id.clone();
            match backend.replace_snapshot(previous, next).await {
                Ok(()) => tracing::debug!(
                    aggregate_key = A::KEY,
                    aggregate_id = %aggregate_id,
                    last_step,
                    "refreshed snapshot"
                ),
                Err(err) => tracing::warn!(
                    aggregate_key = A::KEY,
                    aggregate_id = %aggregate_id,
                    last_step,
                    error = %err,
                    "snapshot refresh failed"
                ),
            }
        });

        let mut refreshes = self
            .refreshes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        refreshes.retain(|pending| !pending.is_finished());
        refreshes.push(handle);
    }
}
