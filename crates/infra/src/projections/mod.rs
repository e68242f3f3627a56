//! Projection implementations (read model builders) and their bookkeeping.
//!
//! Projections consume product events and build the query-side read model.
//! They are:
//! - **Rebuildable**: can be reconstructed by replaying the channel
//! - **Idempotent**: safe for at-least-once, out-of-order delivery
//! - **Isolated**: a poisoned event is parked, never blocks its partition

pub mod dead_letter;
pub mod offset_store;
pub mod products;

use std::time::Duration;

use catalog_events::ProjectionError;

use crate::retry::TransientError;

pub use dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterStore, InMemoryDeadLetterStore, ParkedBody, PostgresDeadLetterStore,
};
pub use offset_store::{InMemoryOffsetStore, OffsetStore, OffsetStoreError, PostgresOffsetStore};
pub use products::{ProductProjection, RebuildStats, ReplayError, DEFAULT_PROJECTION_NAME};

impl TransientError for ProjectionError {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }

    fn timed_out(after: Duration) -> Self {
        ProjectionError::Transient(format!("timed out after {}ms", after.as_millis()))
    }
}
