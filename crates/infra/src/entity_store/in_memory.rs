use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use catalog_core::{Entity, EventId};
use catalog_products::{Product, ProductEnvelope, ProductId};

use super::r#trait::{EntityStore, EntityStoreError, OutboxEntry, WriteChange};

#[derive(Debug, Default)]
struct State {
    records: HashMap<ProductId, Product>,
    /// Unpublished entries keyed by sequence; published ones are dropped.
    pending: BTreeMap<u64, OutboxEntry>,
    by_event: HashMap<EventId, u64>,
    next_sequence: u64,
}

/// In-memory entity store.
///
/// Intended for tests/dev. Record and outbox share one lock, so `commit` is atomic.
#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    state: RwLock<State>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outbox entries not yet marked published.
    pub fn pending_len(&self) -> usize {
        self.state.read().map(|s| s.pending.len()).unwrap_or_default()
    }
}

fn poisoned() -> EntityStoreError {
    EntityStoreError::Unavailable("lock poisoned".to_string())
}

fn check_live(
    current: Option<&Product>,
    id: ProductId,
    expected: catalog_core::ExpectedVersion,
) -> Result<(), EntityStoreError> {
    let current = match current {
        Some(p) if p.is_live() => p,
        _ => return Err(EntityStoreError::NotFound(id)),
    };
    if !expected.matches(current.version()) {
        return Err(EntityStoreError::Concurrency(format!(
            "expected {expected:?}, found {}",
            current.version()
        )));
    }
    Ok(())
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn load(&self, id: ProductId) -> Result<Option<Product>, EntityStoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.records.get(&id).cloned())
    }

    async fn commit(
        &self,
        change: WriteChange,
        event: ProductEnvelope,
    ) -> Result<OutboxEntry, EntityStoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        let id = change.product_id();

        match &change {
            WriteChange::Insert(_) => {
                if state.records.contains_key(&id) {
                    return Err(EntityStoreError::Conflict(id));
                }
            }
            WriteChange::Update { expected, .. } | WriteChange::Delete { expected, .. } => {
                check_live(state.records.get(&id), id, *expected)?;
            }
        }

        let record = match change {
            WriteChange::Insert(record) => record,
            WriteChange::Update { record, .. } => record,
            WriteChange::Delete { record, .. } => record,
        };
        state.records.insert(id, record);

        let entry = OutboxEntry {
            sequence: state.next_sequence,
            envelope: event,
            published: false,
        };
        state.next_sequence += 1;
        state.by_event.insert(entry.envelope.event_id(), entry.sequence);
        state.pending.insert(entry.sequence, entry.clone());
        Ok(entry)
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, EntityStoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.pending.values().take(limit).cloned().collect())
    }

    async fn mark_published(&self, event_id: EventId) -> Result<(), EntityStoreError> {
        let mut state = self.state.write().map_err(|_| poisoned())?;
        if let Some(sequence) = state.by_event.remove(&event_id) {
            state.pending.remove(&sequence);
        }
        Ok(())
    }

    /// Only unpublished entries are held, so a released id reads as `None`.
    async fn outbox_entry(&self, event_id: EventId) -> Result<Option<OutboxEntry>, EntityStoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state
            .by_event
            .get(&event_id)
            .and_then(|sequence| state.pending.get(sequence))
            .cloned())
    }
}
