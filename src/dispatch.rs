use std::{
    any::{Any, type_name},
    collections::HashMap,
    fmt::{self, Debug, Formatter},
};

use crate::{Aggregate, EsError, Event, EventRecord, PayloadCodec, Result};

/// An aggregate whose concrete type has been erased.
///
/// This is what flows through the [`DispatchTable`], so the table can hold
/// handlers for events of unrelated aggregate types side by side.
pub struct ErasedAggregate {
    type_name: &'static str,
    inner: Box<dyn Any + Send + Sync>,
}

impl ErasedAggregate {
    pub fn new<A: Aggregate>(aggregate: A) -> Self {
        Self {
            type_name: type_name::<A>(),
            inner: Box::new(aggregate),
        }
    }

    /// Name of the concrete aggregate type held.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recovers the concrete aggregate, failing with
    /// [`EsError::AggregateTypeMismatch`] when it is of another type.
    pub fn downcast<A: Aggregate>(self) -> Result<A> {
        let found = self.type_name;
        self.inner
            .downcast::<A>()
            .map(|aggregate| *aggregate)
            .map_err(|_| EsError::AggregateTypeMismatch {
                expected: type_name::<A>(),
                found,
            })
    }
}

impl Debug for ErasedAggregate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedAggregate")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

type ApplyFn<C> = Box<
    dyn Fn(&C, &EventRecord, Option<ErasedAggregate>) -> Result<Option<ErasedAggregate>>
        + Send
        + Sync,
>;

/// Maps event type tags to type-erased replay functions.
///
/// Each handler is captured per concrete event type at registration time, so
/// an event can only ever be applied to the aggregate type it declares. The
/// table starts empty and is filled by the caller before the repository is
/// built; afterwards it is shared read-only.
pub struct DispatchTable<C> {
    handlers: HashMap<&'static str, ApplyFn<C>>,
}

impl<C: PayloadCodec> DispatchTable<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers the replay function for `E`, replacing any previous handler for `E::TYPE`.
    pub fn register<E: Event>(&mut self) {
        let apply: ApplyFn<C> = Box::new(
            |codec: &C, record: &EventRecord, aggregate: Option<ErasedAggregate>| {
                let event = record.to_event::<E, C>(codec)?;
                let prior = aggregate
                    .map(ErasedAggregate::downcast::<E::Aggregate>)
                    .transpose()?;
                Ok(event.apply(prior).map(ErasedAggregate::new))
            },
        );

        if self.handlers.insert(E::TYPE, apply).is_some() {
            tracing::warn!(event_type = E::TYPE, "replaced existing event handler");
        }
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Applies a stored event to a type-erased aggregate.
    ///
    /// This is the only place an unregistered event type is detected.
    pub fn apply(
        &self,
        codec: &C,
        record: &EventRecord,
        aggregate: Option<ErasedAggregate>,
    ) -> Result<Option<ErasedAggregate>> {
        let handler =
            self.handlers
                .get(record.event_type.as_str())
                .ok_or_else(|| EsError::UnknownEventType {
                    event_type: record.event_type.clone(),
                })?;
        handler(codec, record, aggregate)
    }

    /// Typed wrapper around [`apply`](Self::apply) used by single-aggregate replay.
    pub fn replay_step<A: Aggregate>(
        &self,
        codec: &C,
        record: &EventRecord,
        aggregate: Option<A>,
    ) -> Result<Option<A>> {
        self.apply(codec, record, aggregate.map(ErasedAggregate::new))?
            .map(ErasedAggregate::downcast::<A>)
            .transpose()
    }
}

impl<C: PayloadCodec> Default for DispatchTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Debug for DispatchTable<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut event_types: Vec<&str> = self.handlers.keys().copied().collect();
        event_types.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("event_types", &event_types)
            .finish()
    }
}
