use std::{fmt::Debug, fmt::Display, hash::Hash, str::FromStr};

use serde::{Serialize, de::DeserializeOwned};

/// A trait representing an event-sourced aggregate.
///
/// Aggregates are never the object of record: their state is *derived* by
/// folding the events that target them, optionally starting from a cached
/// snapshot. Because snapshots are stored as serialized state, an aggregate
/// must be serializable, and because replay must be observably deterministic,
/// two instances compare equal iff their observable fields are equal.
///
/// An aggregate:
/// - Has a stable identifier (`Id`) that survives a round trip through its
///   string form, since ids are persisted as text.
/// - Declares a type-level `KEY` that partitions its events and snapshots from
///   those of other aggregate types in storage.
///
/// # Example
///
/// ```rust
/// use eskit::Aggregate;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// struct Todos {
///     id: String,
///     titles: Vec<String>,
/// }
///
/// impl Aggregate for Todos {
///     type Id = String;
///     const KEY: &'static str = "todos";
///
///     fn id(&self) -> &Self::Id {
///         &self.id
///     }
/// }
/// ```
pub trait Aggregate:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The type representing the unique identifier of this aggregate.
    type Id: AggregateId;

    /// Storage partition tag for this aggregate type. Must be unique within the system.
    const KEY: &'static str;

    /// Gets the unique identifier of the aggregate.
    fn id(&self) -> &Self::Id;
}

/// Requirements for an aggregate identifier.
///
/// Ids are stored as their `Display` form and parsed back with `FromStr`;
/// a stored id that fails to parse is reported as
/// [`EsError::AggregateIdParse`](crate::EsError::AggregateIdParse).
pub trait AggregateId:
    Clone + Debug + Display + FromStr + Eq + Hash + Send + Sync + 'static
{
}

impl<T> AggregateId for T where T: Clone + Debug + Display + FromStr + Eq + Hash + Send + Sync + 'static
{}
