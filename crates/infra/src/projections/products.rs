use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use catalog_events::{ApplyOutcome, Projection, ProjectionError, CURRENT_SCHEMA_VERSION};
use catalog_products::{ProductEnvelope, ProductId, ProductSnapshot};

use crate::projections::dead_letter::{DeadLetterError, DeadLetterStore};
use crate::read_model::{ReadChange, ReadStore, ReadStoreError};

/// Name used when none is configured; doubles as the default consumer group.
pub const DEFAULT_PROJECTION_NAME: &str = "products.read_model";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

/// Counts from a rebuild.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebuildStats {
    pub applied: usize,
    pub stale: usize,
}

/// Builds the product read model from product events.
///
/// The version gate lives in [`ReadStore::apply`]; this type validates the
/// envelope, turns it into a [`ReadChange`], and classifies failures.
#[derive(Debug)]
pub struct ProductProjection<R> {
    store: R,
    name: String,
}

impl<R> ProductProjection<R>
where
    R: ReadStore,
{
    pub fn new(store: R) -> Self {
        Self::with_name(store, DEFAULT_PROJECTION_NAME)
    }

    pub fn with_name(store: R, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn store(&self) -> &R {
        &self.store
    }

    fn to_change(envelope: &ProductEnvelope) -> Result<ReadChange, ProjectionError> {
        if envelope.schema_version() > CURRENT_SCHEMA_VERSION {
            return Err(ProjectionError::Rejected(format!(
                "unsupported schema version {} (max {})",
                envelope.schema_version(),
                CURRENT_SCHEMA_VERSION
            )));
        }

        let snapshot: &ProductSnapshot = envelope.payload();
        if snapshot.id != ProductId::new(envelope.entity_id()) {
            return Err(ProjectionError::Rejected(format!(
                "payload id {} does not match entity id {}",
                snapshot.id,
                envelope.entity_id()
            )));
        }

        Ok(ReadChange {
            snapshot: snapshot.clone(),
            version: envelope.version(),
            deleted: envelope.event_type().is_terminal(),
        })
    }

    /// Take a parked event and offer it to the read model again.
    ///
    /// Returns `None` if `id` is not parked. If the apply fails the entry is
    /// parked again with one more attempt recorded.
    pub async fn replay_dead_letter<D>(
        &self,
        dead_letters: &D,
        id: Uuid,
    ) -> Result<Option<ApplyOutcome>, ReplayError>
    where
        D: DeadLetterStore + ?Sized,
    {
        let Some(mut entry) = dead_letters.take(id).await? else {
            return Ok(None);
        };

        let applied = match entry.body.decode() {
            Ok(envelope) => self.apply(&envelope).await,
            Err(e) => Err(ProjectionError::Rejected(format!("undecodable body: {e}"))),
        };

        match applied {
            Ok(outcome) => {
                debug!(dead_letter_id = %id, offset = entry.offset, ?outcome, "dead letter replayed");
                Ok(Some(outcome))
            }
            Err(e) => {
                warn!(dead_letter_id = %id, error = %e, "dead letter replay failed; parking again");
                entry.attempts += 1;
                entry.reason = e.to_string();
                entry.failed_at = chrono::Utc::now();
                dead_letters.park(entry).await?;
                Err(e.into())
            }
        }
    }

    /// Clear the read store and replay `events`, per entity in version order.
    pub async fn rebuild_from<I>(&self, events: I) -> Result<RebuildStats, ProjectionError>
    where
        I: IntoIterator<Item = ProductEnvelope>,
    {
        self.store.clear().await.map_err(classify)?;

        let mut by_entity: BTreeMap<ProductId, Vec<ProductEnvelope>> = BTreeMap::new();
        for envelope in events {
            by_entity
                .entry(ProductId::new(envelope.entity_id()))
                .or_default()
                .push(envelope);
        }

        let mut stats = RebuildStats::default();
        for (_, mut stream) in by_entity {
            stream.sort_by_key(|e| e.version());
            for envelope in &stream {
                match self.apply(envelope).await? {
                    ApplyOutcome::Applied => stats.applied += 1,
                    ApplyOutcome::Stale { .. } => stats.stale += 1,
                }
            }
        }
        Ok(stats)
    }
}

fn classify(err: ReadStoreError) -> ProjectionError {
    match err {
        ReadStoreError::Unavailable(msg) => ProjectionError::Transient(msg),
        ReadStoreError::Serialization(msg) => ProjectionError::Rejected(msg),
    }
}

#[async_trait::async_trait]
impl<R> Projection<ProductSnapshot> for ProductProjection<R>
where
    R: ReadStore,
{
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        skip(self, envelope),
        fields(
            entity_id = %envelope.entity_id(),
            event_id = %envelope.event_id(),
            version = envelope.version(),
            event_type = %envelope.event_type()
        ),
        err
    )]
    async fn apply(&self, envelope: &ProductEnvelope) -> Result<ApplyOutcome, ProjectionError> {
        let change = Self::to_change(envelope)?;
        let outcome = self.store.apply(change).await.map_err(classify)?;
        if let ApplyOutcome::Stale { current } = outcome {
            debug!(current, "stale or duplicate event ignored");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    use catalog_core::EventId;
    use catalog_events::{EventEnvelope, EventKind};

    use crate::projections::dead_letter::{DeadLetter, InMemoryDeadLetterStore};
    use crate::read_model::InMemoryReadStore;

    fn event(id: ProductId, kind: EventKind, version: u64, name: &str) -> ProductEnvelope {
        EventEnvelope::new(
            EventId::new(),
            id.0,
            kind,
            version,
            Utc::now(),
            ProductSnapshot {
                id,
                name: name.to_string(),
                description: None,
                price: 9.99,
                stock: 10,
            },
        )
    }

    fn projection() -> ProductProjection<InMemoryReadStore> {
        ProductProjection::new(InMemoryReadStore::new())
    }

    #[tokio::test]
    async fn applying_the_same_event_twice_is_idempotent() {
        let p = projection();
        let id = ProductId::generate();
        let created = event(id, EventKind::Created, 0, "Widget");

        assert_eq!(p.apply(&created).await.unwrap(), ApplyOutcome::Applied);
        let once = p.store().get(id).await.unwrap();

        assert_eq!(p.apply(&created).await.unwrap(), ApplyOutcome::Stale { current: 0 });
        assert_eq!(p.store().get(id).await.unwrap(), once);
    }

    #[tokio::test]
    async fn redelivered_create_after_update_is_stale() {
        let p = projection();
        let id = ProductId::generate();
        let created = event(id, EventKind::Created, 0, "Widget");

        p.apply(&created).await.unwrap();
        p.apply(&event(id, EventKind::Updated, 1, "Widget v2")).await.unwrap();
        assert_eq!(p.apply(&created).await.unwrap(), ApplyOutcome::Stale { current: 1 });

        let record = p.store().get(id).await.unwrap().unwrap();
        assert_eq!(record.last_applied_version, 1);
        assert_eq!(record.product.name, "Widget v2");
    }

    #[tokio::test]
    async fn update_arriving_first_is_applied_and_create_is_then_stale() {
        let p = projection();
        let id = ProductId::generate();

        p.apply(&event(id, EventKind::Updated, 1, "newer")).await.unwrap();
        let outcome = p.apply(&event(id, EventKind::Created, 0, "older")).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Stale { current: 1 });
        assert_eq!(p.store().get(id).await.unwrap().unwrap().product.name, "newer");
    }

    #[tokio::test]
    async fn delete_is_terminal() {
        let p = projection();
        let id = ProductId::generate();
        p.apply(&event(id, EventKind::Created, 0, "Widget")).await.unwrap();
        p.apply(&event(id, EventKind::Deleted, 1, "Widget")).await.unwrap();

        assert_eq!(p.store().get(id).await.unwrap(), None);
        for (kind, version) in [(EventKind::Created, 0), (EventKind::Deleted, 1)] {
            assert_eq!(
                p.apply(&event(id, kind, version, "Widget")).await.unwrap(),
                ApplyOutcome::Stale { current: 1 }
            );
        }
        assert_eq!(p.store().get(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn future_schema_versions_are_rejected() {
        let p = projection();
        let id = ProductId::generate();
        let envelope = event(id, EventKind::Created, 0, "Widget").with_schema_version(CURRENT_SCHEMA_VERSION + 1);

        let err = p.apply(&envelope).await.unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(p.store().get(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn payload_for_another_entity_is_rejected() {
        let p = projection();
        let envelope = EventEnvelope::new(
            EventId::new(),
            ProductId::generate().0,
            EventKind::Created,
            0,
            Utc::now(),
            event(ProductId::generate(), EventKind::Created, 0, "x").into_payload(),
        );

        assert!(matches!(p.apply(&envelope).await, Err(ProjectionError::Rejected(_))));
    }

    #[tokio::test]
    async fn replaying_a_dead_letter_applies_it_and_removes_it() {
        let p = projection();
        let dead_letters = InMemoryDeadLetterStore::new();
        let id = ProductId::generate();
        let parked = DeadLetter::new("g", 0, 0, event(id, EventKind::Created, 0, "Widget"), "store down", 5);
        let parked_id = parked.id;
        dead_letters.park(parked).await.unwrap();

        let outcome = p.replay_dead_letter(&dead_letters, parked_id).await.unwrap();

        assert_eq!(outcome, Some(ApplyOutcome::Applied));
        assert!(p.store().get(id).await.unwrap().is_some());
        assert!(dead_letters.list(10).await.unwrap().is_empty());
        assert_eq!(p.replay_dead_letter(&dead_letters, parked_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_replay_parks_the_event_again() {
        let p = projection();
        let dead_letters = InMemoryDeadLetterStore::new();
        let envelope = event(ProductId::generate(), EventKind::Created, 0, "Widget")
            .with_schema_version(CURRENT_SCHEMA_VERSION + 1);
        let parked = DeadLetter::new("g", 0, 0, envelope, "bad schema", 1);
        let parked_id = parked.id;
        dead_letters.park(parked).await.unwrap();

        assert!(p.replay_dead_letter(&dead_letters, parked_id).await.is_err());

        let remaining = dead_letters.list(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].attempts, 2);
    }

    #[tokio::test]
    async fn raw_dead_letters_are_decoded_on_replay() {
        let p = projection();
        let dead_letters = InMemoryDeadLetterStore::new();
        let id = ProductId::generate();
        let raw = serde_json::to_string(&event(id, EventKind::Created, 0, "Widget")).unwrap();
        let readable = DeadLetter::undecodable("g", 0, 0, raw, "decoder was older");
        let garbage = DeadLetter::undecodable("g", 0, 1, "{not json", "eof");
        let (readable_id, garbage_id) = (readable.id, garbage.id);
        dead_letters.park(readable).await.unwrap();
        dead_letters.park(garbage).await.unwrap();

        let outcome = p.replay_dead_letter(&dead_letters, readable_id).await.unwrap();
        assert_eq!(outcome, Some(ApplyOutcome::Applied));
        assert!(p.store().get(id).await.unwrap().is_some());

        assert!(matches!(
            p.replay_dead_letter(&dead_letters, garbage_id).await,
            Err(ReplayError::Projection(ProjectionError::Rejected(_)))
        ));
        let remaining = dead_letters.list(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, garbage_id);
        assert_eq!(remaining[0].attempts, 2);
    }

    #[tokio::test]
    async fn rebuild_clears_and_replays_to_the_latest_state() {
        let p = projection();
        let kept = ProductId::generate();
        let removed = ProductId::generate();
        let stray = ProductId::generate();
        p.apply(&event(stray, EventKind::Created, 0, "stray")).await.unwrap();

        let history = vec![
            event(kept, EventKind::Updated, 1, "kept v1"),
            event(removed, EventKind::Created, 0, "removed"),
            event(kept, EventKind::Created, 0, "kept v0"),
            event(removed, EventKind::Deleted, 1, "removed"),
            event(kept, EventKind::Updated, 1, "kept v1"),
        ];

        let stats = p.rebuild_from(history).await.unwrap();

        assert_eq!(stats, RebuildStats { applied: 4, stale: 1 });
        assert_eq!(p.store().get(stray).await.unwrap(), None);
        assert_eq!(p.store().get(removed).await.unwrap(), None);
        assert_eq!(p.store().get(kept).await.unwrap().unwrap().product.name, "kept v1");
    }

    proptest! {
        // Any permutation of versions 0..n (with duplicates) ends at version n-1's state.
        #[test]
        fn final_state_is_independent_of_delivery_order(
            (n, order) in (2u64..8).prop_flat_map(|n| {
                (Just(n), Just((0..n).chain(0..n).collect::<Vec<_>>()).prop_shuffle())
            })
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let p = projection();
                let id = ProductId::generate();
                for v in &order {
                    let kind = if *v == 0 { EventKind::Created } else { EventKind::Updated };
                    p.apply(&event(id, kind, *v, &format!("v{v}"))).await.unwrap();
                }

                let record = p.store().get(id).await.unwrap().unwrap();
                prop_assert_eq!(record.last_applied_version, n - 1);
                prop_assert_eq!(record.product.name, format!("v{}", n - 1));
                Ok(())
            })?;
        }
    }
}
