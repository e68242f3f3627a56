//! Product read store: the query-side materialization of the catalog.
//!
//! The read store is disposable. It can be cleared and rebuilt by replaying
//! the event channel from offset 0.
//!
//! ## Version gate
//!
//! [`ReadStore::apply`] is the single read-modify-write the projector relies on:
//! a change is written only if the id has no record yet, or if its version is
//! strictly greater than the record's `last_applied_version`. Otherwise the
//! call returns [`ApplyOutcome::Stale`] and nothing changes.
//!
//! Deleted products keep a tombstone (version only, invisible to queries) so
//! that a late redelivery of an older event cannot resurrect them.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use catalog_events::ApplyOutcome;
use catalog_products::{ProductId, ProductSnapshot};

use crate::retry::TransientError;

pub use in_memory::InMemoryReadStore;
pub use postgres::PostgresReadStore;

/// Largest page `list_page` will return.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Clamp a requested page size into `1..=MAX_PAGE_SIZE`.
pub fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_PAGE_SIZE)
}

/// Queryable product record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRecord {
    #[serde(flatten)]
    pub product: ProductSnapshot,
    pub last_applied_version: u64,
}

/// A versioned change offered to the read store.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadChange {
    pub snapshot: ProductSnapshot,
    pub version: u64,
    /// Leave a tombstone instead of a visible record.
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<ReadRecord>,
    /// Visible records in the whole store, not just this page.
    pub total: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadStoreError {
    #[error("read store unavailable: {0}")]
    Unavailable(String),

    #[error("read store serialization error: {0}")]
    Serialization(String),
}

impl TransientError for ReadStoreError {
    fn is_transient(&self) -> bool {
        matches!(self, ReadStoreError::Unavailable(_))
    }

    fn timed_out(after: Duration) -> Self {
        ReadStoreError::Unavailable(format!("timed out after {}ms", after.as_millis()))
    }
}

#[async_trait]
pub trait ReadStore: Send + Sync {
    /// Visible record for `id`; `None` if absent or deleted.
    async fn get(&self, id: ProductId) -> Result<Option<ReadRecord>, ReadStoreError>;

    /// Last applied version for `id`, tombstones included.
    async fn applied_version(&self, id: ProductId) -> Result<Option<u64>, ReadStoreError>;

    /// Atomic version-gated upsert.
    async fn apply(&self, change: ReadChange) -> Result<ApplyOutcome, ReadStoreError>;

    /// All visible records ordered by `name`, then `id`.
    async fn list_all(&self) -> Result<Vec<ReadRecord>, ReadStoreError>;

    /// One page of visible records ordered by `name`, then `id`, plus the total
    /// count. `limit` is clamped with [`clamp_limit`].
    async fn list_page(&self, limit: u32, offset: u64) -> Result<Page, ReadStoreError>;

    /// Drop every record and tombstone (rebuild support).
    async fn clear(&self) -> Result<(), ReadStoreError>;
}

#[async_trait]
impl<S> ReadStore for Arc<S>
where
    S: ReadStore + ?Sized,
{
    async fn get(&self, id: ProductId) -> Result<Option<ReadRecord>, ReadStoreError> {
        (**self).get(id).await
    }

    async fn applied_version(&self, id: ProductId) -> Result<Option<u64>, ReadStoreError> {
        (**self).applied_version(id).await
    }

    async fn apply(&self, change: ReadChange) -> Result<ApplyOutcome, ReadStoreError> {
        (**self).apply(change).await
    }

    async fn list_all(&self) -> Result<Vec<ReadRecord>, ReadStoreError> {
        (**self).list_all().await
    }

    async fn list_page(&self, limit: u32, offset: u64) -> Result<Page, ReadStoreError> {
        (**self).list_page(limit, offset).await
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        (**self).clear().await
    }
}
