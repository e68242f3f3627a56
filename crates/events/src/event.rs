use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use catalog_core::EntityId;

/// Kind of accepted change an event describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "Created",
            EventKind::Updated => "Updated",
            EventKind::Deleted => "Deleted",
        }
    }

    /// A `Deleted` event is terminal for its entity.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::Deleted)
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned per entity** (`version` strictly increases for a fixed entity)
/// - **self-contained** (the payload is a full snapshot, never a diff)
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Snapshot type carried on the wire.
    type Payload: Clone + core::fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> EventKind;

    /// Partition/ordering key.
    fn entity_id(&self) -> EntityId;

    /// Per-entity version assigned by the command side.
    fn version(&self) -> u64;

    /// When the change was accepted (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    /// Full entity snapshot at the time of the change.
    fn payload(&self) -> Self::Payload;
}
