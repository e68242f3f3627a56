use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use catalog_core::{ExpectedVersion, EventId};
use catalog_products::{Product, ProductEnvelope, ProductId};

use crate::retry::TransientError;

/// A single write-record change, committed atomically with its event.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteChange {
    /// First write for an id. Fails with `Conflict` if any record (live or
    /// tombstoned) exists.
    Insert(Product),
    /// Replace a live record at `expected` version with `record`.
    Update {
        record: Product,
        expected: ExpectedVersion,
    },
    /// Tombstone a live record at `expected` version. `record` carries the
    /// terminal version and `is_deleted() == true`.
    Delete {
        record: Product,
        expected: ExpectedVersion,
    },
}

impl WriteChange {
    pub fn record(&self) -> &Product {
        match self {
            WriteChange::Insert(record) => record,
            WriteChange::Update { record, .. } => record,
            WriteChange::Delete { record, .. } => record,
        }
    }

    pub fn product_id(&self) -> ProductId {
        self.record().id_typed()
    }
}

/// An event persisted alongside its write, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// Store-assigned, strictly increasing commit sequence.
    pub sequence: u64,
    pub envelope: ProductEnvelope,
    pub published: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum EntityStoreError {
    #[error("product {0} already exists")]
    Conflict(ProductId),

    #[error("product {0} not found")]
    NotFound(ProductId),

    /// The record moved since it was loaded.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("entity store unavailable: {0}")]
    Unavailable(String),

    #[error("entity store serialization error: {0}")]
    Serialization(String),
}

impl TransientError for EntityStoreError {
    fn is_transient(&self) -> bool {
        matches!(self, EntityStoreError::Unavailable(_))
    }

    fn timed_out(after: Duration) -> Self {
        EntityStoreError::Unavailable(format!("timed out after {}ms", after.as_millis()))
    }
}

/// Durable keyed storage for products plus the pending-event outbox.
///
/// Implementations must make `commit` atomic: either the record change and the
/// outbox entry are both durable, or neither is.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Current record, including tombstones. `None` if the id was never created.
    async fn load(&self, id: ProductId) -> Result<Option<Product>, EntityStoreError>;

    async fn commit(
        &self,
        change: WriteChange,
        event: ProductEnvelope,
    ) -> Result<OutboxEntry, EntityStoreError>;

    /// Unpublished outbox entries in commit order.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, EntityStoreError>;

    /// Mark an outbox entry published. Unknown or already-published ids are a no-op.
    async fn mark_published(&self, event_id: EventId) -> Result<(), EntityStoreError>;

    /// The outbox entry committed under `event_id`, if the store still holds it.
    async fn outbox_entry(&self, event_id: EventId) -> Result<Option<OutboxEntry>, EntityStoreError>;
}

#[async_trait]
impl<S> EntityStore for Arc<S>
where
    S: EntityStore + ?Sized,
{
    async fn load(&self, id: ProductId) -> Result<Option<Product>, EntityStoreError> {
        (**self).load(id).await
    }

    async fn commit(
        &self,
        change: WriteChange,
        event: ProductEnvelope,
    ) -> Result<OutboxEntry, EntityStoreError> {
        (**self).commit(change, event).await
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, EntityStoreError> {
        (**self).pending_outbox(limit).await
    }

    async fn mark_published(&self, event_id: EventId) -> Result<(), EntityStoreError> {
        (**self).mark_published(event_id).await
    }

    async fn outbox_entry(&self, event_id: EventId) -> Result<Option<OutboxEntry>, EntityStoreError> {
        (**self).outbox_entry(event_id).await
    }
}
