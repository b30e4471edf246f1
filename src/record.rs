use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Aggregate, EsError, Event, PayloadCodec, Result, Uuid};

/// The `EventRecord` struct is the persisted, type-erased form of an [`Event`].
///
/// Within one stream, i.e. one `(aggregate_key, aggregate_id)` pair, `step`
/// values start at 1 and are unique: the writer assigns "last known step + 1"
/// and the storage uniqueness constraint rejects a concurrent writer that
/// computed the same step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// The ID of the record.
    pub id: Uuid,

    /// The type tag of the event ([`Event::TYPE`]).
    pub event_type: String,

    /// The key of the aggregate type the event belongs to ([`Aggregate::KEY`]).
    pub aggregate_key: String,

    /// The aggregate ID in its string form.
    pub aggregate_id: String,

    /// The position of the event within its stream.
    pub step: u64,

    /// The encoded event data.
    pub payload: Vec<u8>,

    /// The creation time of the event.
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Creates the record for `event` at `step`.
    pub fn from_event<E, C>(event: &E, step: u64, codec: &C) -> Result<Self>
    where
        E: Event,
        C: PayloadCodec,
    {
        let payload = codec
            .encode(event.data())
            .map_err(|source| EsError::PayloadEncode {
                kind: E::TYPE.to_string(),
                source,
            })?;

        Ok(Self {
            id: Uuid::new_v4(),
            event_type: E::TYPE.to_string(),
            aggregate_key: <E::Aggregate as Aggregate>::KEY.to_string(),
            aggregate_id: event.aggregate_id().to_string(),
            step,
            payload,
            created_at: event.created_at(),
        })
    }

    /// Decodes the record into the typed event.
    ///
    /// Fails with [`EsError::AggregateIdParse`] when the stored id does not
    /// parse, and with [`EsError::PayloadDecode`] when the payload does not
    /// decode into `E::Data`.
    pub fn to_event<E, C>(&self, codec: &C) -> Result<E>
    where
        E: Event,
        C: PayloadCodec,
    {
        let aggregate_id = parse_id::<E::Aggregate>(&self.aggregate_id)?;
        let data = codec
            .decode::<E::Data>(&self.payload)
            .map_err(|source| EsError::PayloadDecode {
                kind: self.event_type.clone(),
                source,
            })?;

        Ok(E::from_parts(aggregate_id, data, self.created_at))
    }
}

/// The `SnapshotRecord` struct is a cached aggregate state at a known step.
///
/// At most one snapshot exists per `(aggregate_key, aggregate_id)`. Deleting
/// it never changes what replay produces, only how many events it reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// The ID of the record.
    pub id: Uuid,

    pub aggregate_key: String,

    pub aggregate_id: String,

    /// The step of the last event folded into the payload.
    pub last_step: u64,

    /// The encoded aggregate state.
    pub payload: Vec<u8>,
}

impl SnapshotRecord {
    /// Creates a snapshot of `aggregate` taken after `last_step`.
    pub fn from_aggregate<A, C>(aggregate: &A, last_step: u64, codec: &C) -> Result<Self>
    where
        A: Aggregate,
        C: PayloadCodec,
    {
        let payload = codec
            .encode(aggregate)
            .map_err(|source| EsError::PayloadEncode {
                kind: A::KEY.to_string(),
                source,
            })?;

        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_key: A::KEY.to_string(),
            aggregate_id: aggregate.id().to_string(),
            last_step,
            payload,
        })
    }

    /// Gets the aggregate from the snapshot.
    pub fn to_aggregate<A, C>(&self, codec: &C) -> Result<A>
    where
        A: Aggregate,
        C: PayloadCodec,
    {
        parse_id::<A>(&self.aggregate_id)?;
        codec
            .decode::<A>(&self.payload)
            .map_err(|source| EsError::PayloadDecode {
                kind: self.aggregate_key.clone(),
                source,
            })
    }
}

fn parse_id<A: Aggregate>(raw: &str) -> Result<A::Id> {
    raw.parse::<A::Id>().map_err(|_| EsError::AggregateIdParse {
        aggregate_key: A::KEY.to_string(),
        aggregate_id: raw.to_string(),
    })
}

/// Orders records for folding by `(step, created_at, event_type, id)`.
///
/// Steps within one aggregate are unique and increasing, so every aggregate's
/// events keep their step order, and events of one type are folded in step
/// order across aggregates. The result is deterministic for a fixed set of
/// records.
pub fn fold_order(mut records: Vec<EventRecord>) -> Vec<EventRecord> {
    records.sort_by(|a, b| {
        a.step
            .cmp(&b.step)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.event_type.cmp(&b.event_type))
            .then_with(|| a.id.cmp(&b.id))
    });
    records
}
