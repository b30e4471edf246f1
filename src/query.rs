use std::{
    collections::HashMap,
    convert::Infallible,
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use crate::{
    Aggregate, EsError, Event, EventRecord, IdOf, PayloadCodec, Repository, Result,
    backend::{EventQuery, Field, Predicate, SortKey, StorageBackend},
    record::fold_order,
};

type FoldFn<C, R> = Arc<dyn Fn(R, &C, &EventRecord) -> Result<R> + Send + Sync>;

struct Subscription<C, R> {
    aggregate_key: &'static str,
    aggregate_id: Option<String>,
    fold: FoldFn<C, R>,
}

impl<C, R> Subscription<C, R> {
    fn filter(&self, event_type: &str) -> Vec<Predicate> {
        let mut group = vec![
            Predicate::Equals(Field::EventType, event_type.to_string()),
            Predicate::Equals(Field::AggregateKey, self.aggregate_key.to_string()),
        ];
        if let Some(aggregate_id) = &self.aggregate_id {
            group.push(Predicate::Equals(Field::AggregateId, aggregate_id.clone()));
        }
        group
    }
}

impl<C, R> Clone for Subscription<C, R> {
    fn clone(&self) -> Self {
        Self {
            aggregate_key: self.aggregate_key,
            aggregate_id: self.aggregate_id.clone(),
            fold: Arc::clone(&self.fold),
        }
    }
}

/// Folds a declared set of event subscriptions into one read-model value.
///
/// Builders are values: `subscribe` consumes the builder and returns an
/// updated one, and the subscription map is copy-on-write, so a partially
/// built query can be cloned and extended along different branches without
/// either branch seeing the other's subscriptions.
///
/// At most one subscription exists per event type; subscribing the same type
/// again replaces the previous one.
pub struct QueryBuilder<B, C, R> {
    repository: Repository<B, C>,
    initial: R,
    subscriptions: Arc<HashMap<&'static str, Subscription<C, R>>>,
}

impl<B, C, R> QueryBuilder<B, C, R>
where
    B: StorageBackend,
    C: PayloadCodec,
    R: Send + 'static,
{
    pub(crate) fn new(repository: Repository<B, C>, initial: R) -> Self {
        Self {
            repository,
            initial,
            subscriptions: Arc::new(HashMap::new()),
        }
    }

    /// Folds events of type `E` into the result, optionally only those of one aggregate.
    #[must_use]
    pub fn subscribe<E, F>(self, aggregate_id: Option<&IdOf<E>>, fold: F) -> Self
    where
        E: Event,
        F: Fn(R, E) -> R + Send + Sync + 'static,
    {
        self.try_subscribe::<E, _, Infallible>(aggregate_id, move |result, event| {
            Ok(fold(result, event))
        })
    }

    /// Like [`subscribe`](Self::subscribe), for folds that can fail.
    ///
    /// The first failure stops [`build`](Self::build) with [`EsError::Fold`].
    #[must_use]
    pub fn try_subscribe<E, F, X>(mut self, aggregate_id: Option<&IdOf<E>>, fold: F) -> Self
    where
        E: Event,
        F: Fn(R, E) -> std::result::Result<R, X> + Send + Sync + 'static,
        X: Into<anyhow::Error>,
    {
        let fold: FoldFn<C, R> = Arc::new(move |result: R, codec: &C, record: &EventRecord| {
            let event = record.to_event::<E, C>(codec)?;
            fold(result, event).map_err(|err| EsError::Fold {
                event_type: E::TYPE.to_string(),
                source: err.into(),
            })
        });

        Arc::make_mut(&mut self.subscriptions).insert(
            E::TYPE,
            Subscription {
                aggregate_key: <E::Aggregate as Aggregate>::KEY,
                aggregate_id: aggregate_id.map(ToString::to_string),
                fold,
            },
        );
        self
    }

    /// Folds events of type `E` from every aggregate.
    #[must_use]
    pub fn pipe<E, F>(self, fold: F) -> Self
    where
        E: Event,
        F: Fn(R, E) -> R + Send + Sync + 'static,
    {
        self.subscribe::<E, F>(None, fold)
    }

    /// Fallible form of [`pipe`](Self::pipe).
    #[must_use]
    pub fn try_pipe<E, F, X>(self, fold: F) -> Self
    where
        E: Event,
        F: Fn(R, E) -> std::result::Result<R, X> + Send + Sync + 'static,
        X: Into<anyhow::Error>,
    {
        self.try_subscribe::<E, F, X>(None, fold)
    }

    /// Subscribed event types, sorted.
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut event_types: Vec<&'static str> = self.subscriptions.keys().copied().collect();
        event_types.sort_unstable();
        event_types
    }

    /// Fetches every matching event in one query and folds them in order.
    ///
    /// Records of a type without a subscription are skipped.
    pub async fn build(self) -> Result<R> {
        if self.subscriptions.is_empty() {
            return Ok(self.initial);
        }

        let query = EventQuery::any_of(
            self.subscriptions
                .iter()
                .map(|(event_type, subscription)| subscription.filter(event_type)),
        )
        .sorted_by([
            SortKey::Step,
            SortKey::CreatedAt,
            SortKey::EventType,
            SortKey::RecordId,
        ]);
        let records = self.repository.backend.find_events(&query).await?;
        tracing::debug!(
            event_types = ?self.event_types(),
            records = records.len(),
            "folding query"
        );

        let mut result = self.initial;
        for record in fold_order(records) {
            let Some(subscription) = self.subscriptions.get(record.event_type.as_str()) else {
                continue;
            };
            result = (subscription.fold)(result, &self.repository.codec, &record)?;
        }
        Ok(result)
    }
}

impl<B, C, R> Clone for QueryBuilder<B, C, R>
where
    C: Clone,
    R: Clone,
{
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            initial: self.initial.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
        }
    }
}

impl<B, C, R: Debug> Debug for QueryBuilder<B, C, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut event_types: Vec<&str> = self.subscriptions.keys().copied().collect();
        event_types.sort_unstable();
        f.debug_struct("QueryBuilder")
            .field("initial", &self.initial)
            .field("event_types", &event_types)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{InMemoryBackend, RepositoryBuilder, event_accessors};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Tab {
        id: String,
        total: u32,
    }

    impl Aggregate for Tab {
        type Id = String;
        const KEY: &'static str = "tab";

        fn id(&self) -> &String {
            &self.id
        }
    }

    #[derive(Clone, Debug)]
    struct Ordered {
        aggregate_id: String,
        data: u32,
        created_at: DateTime<Utc>,
    }

    impl Event for Ordered {
        type Aggregate = Tab;
        type Data = u32;
        const TYPE: &'static str = "ordered";

        event_accessors!();

        fn apply(&self, aggregate: Option<Tab>) -> Option<Tab> {
            let mut tab = aggregate.unwrap_or(Tab {
                id: self.aggregate_id.clone(),
                total: 0,
            });
            tab.total += self.data;
            Some(tab)
        }
    }

    #[derive(Clone, Debug)]
    struct Paid {
        aggregate_id: String,
        data: (),
        created_at: DateTime<Utc>,
    }

    impl Event for Paid {
        type Aggregate = Tab;
        type Data = ();
        const TYPE: &'static str = "paid";

        event_accessors!();

        fn apply(&self, _aggregate: Option<Tab>) -> Option<Tab> {
            None
        }
    }

    #[test]
    fn branches_do_not_share_subscriptions() {
        let repository = RepositoryBuilder::new(InMemoryBackend::new()).build();
        let base = repository
            .query(0u32)
            .pipe::<Ordered, _>(|total, event| total + event.data);
        let extended = base.clone().pipe::<Paid, _>(|_, _| 0);

        assert_eq!(base.event_types(), vec!["ordered"]);
        assert_eq!(extended.event_types(), vec!["ordered", "paid"]);
    }

    #[tokio::test]
    async fn empty_query_returns_the_initial_value() {
        let repository = RepositoryBuilder::new(InMemoryBackend::new()).build();
        let result = repository.query(vec![1, 2]).build().await.unwrap();
        assert_eq!(result, vec![1, 2]);
    }

    #[tokio::test]
    async fn folds_every_aggregate_when_not_scoped() {
        let repository = RepositoryBuilder::new(InMemoryBackend::new())
            .subscribe::<Ordered>()
            .build();
        for (tab, amount) in [("a", 3), ("b", 4), ("a", 5)] {
            repository
                .command::<Ordered, _>(&tab.to_string(), |_| {
                    Some(Ordered {
                        aggregate_id: tab.to_string(),
                        data: amount,
                        created_at: Utc::now(),
                    })
                })
                .await
                .unwrap();
        }

        let total = repository
            .query(0u32)
            .pipe::<Ordered, _>(|total, event| total + event.data)
            .build()
            .await
            .unwrap();
        assert_eq!(total, 12);

        let only_a = repository
            .query(0u32)
            .subscribe::<Ordered, _>(Some(&"a".to_string()), |total, event| {
                total + event.data
            })
            .build()
            .await
            .unwrap();
        assert_eq!(only_a, 8);
    }
}
