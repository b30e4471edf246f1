use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};

use crate::Aggregate;

/// Shorthand for the id type of the aggregate an event targets.
pub type IdOf<E> = <<E as Event>::Aggregate as Aggregate>::Id;

/// The `Event` trait describes an immutable fact about exactly one aggregate type.
///
/// An event carries the id of the aggregate it targets, a serializable data
/// payload and its creation time. Its `TYPE` tag must be unique within the
/// system: it is what the dispatch table and queries key on.
///
/// `apply` is the pure state transition used during replay. It is called
/// exactly once per stored event, in step order, with the state produced by
/// the previous event (or `None` when the aggregate does not exist yet).
///
/// Events laid out as `{ aggregate_id, data, created_at }` can use
/// [`event_accessors!`](crate::event_accessors) for the accessor boilerplate.
pub trait Event: Clone + Debug + Send + Sync + 'static {
    /// The aggregate this event applies to.
    type Aggregate: Aggregate;

    /// The persisted payload of the event.
    type Data: Serialize + DeserializeOwned + Clone + Debug + Send + Sync;

    /// Type tag, unique within the system.
    const TYPE: &'static str;

    fn aggregate_id(&self) -> &IdOf<Self>;

    fn data(&self) -> &Self::Data;

    fn created_at(&self) -> DateTime<Utc>;

    /// Rebuilds an event from its persisted parts.
    fn from_parts(aggregate_id: IdOf<Self>, data: Self::Data, created_at: DateTime<Utc>) -> Self;

    /// Applies the event to the prior state of its aggregate.
    fn apply(&self, aggregate: Option<Self::Aggregate>) -> Option<Self::Aggregate>;
}

/// The `event_accessors!` macro implements the plumbing half of [`Event`] for
/// structs with `aggregate_id`, `data` and `created_at` fields.
///
/// Use it inside the `impl Event for ...` block, next to the associated types
/// and `apply`.
///
/// ```rust
/// use eskit::{Aggregate, DateTime, Event, Utc, event_accessors};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// struct Counter {
///     id: String,
///     value: u32,
/// }
///
/// impl Aggregate for Counter {
///     type Id = String;
///     const KEY: &'static str = "counter";
///
///     fn id(&self) -> &String {
///         &self.id
///     }
/// }
///
/// #[derive(Clone, Debug)]
/// struct Incremented {
///     aggregate_id: String,
///     data: u32,
///     created_at: DateTime<Utc>,
/// }
///
/// impl Event for Incremented {
///     type Aggregate = Counter;
///     type Data = u32;
///     const TYPE: &'static str = "incremented";
///
///     event_accessors!();
///
///     fn apply(&self, aggregate: Option<Counter>) -> Option<Counter> {
///         let mut counter = aggregate.unwrap_or(Counter {
///             id: self.aggregate_id.clone(),
///             value: 0,
///         });
///         counter.value += self.data;
///         Some(counter)
///     }
/// }
/// ```
#[macro_export]
macro_rules! event_accessors {
    () => {
        fn aggregate_id(&self) -> &$crate::IdOf<Self> {
            &self.aggregate_id
        }

        fn data(&self) -> &Self::Data {
            &self.data
        }

        fn created_at(&self) -> $crate::DateTime<$crate::Utc> {
            self.created_at
        }

        fn from_parts(
            aggregate_id: $crate::IdOf<Self>,
            data: Self::Data,
            created_at: $crate::DateTime<$crate::Utc>,
        ) -> Self {
            Self {
                aggregate_id,
                data,
                created_at,
            }
        }
    };
}
