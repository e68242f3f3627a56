use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use catalog_core::{EntityId, EventId};

use crate::event::{Event, EventKind};

/// Schema version written by this build. Consumers reject anything newer.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Wire form of a domain event.
///
/// This is the unit the outbox persists and the channel transports:
/// `{event_id, entity_id, event_type, version, occurred_at, schema_version, payload}`.
///
/// Notes:
/// - `event_id` is globally unique and survives redelivery unchanged.
/// - `entity_id` is the partition key; events for one entity stay ordered.
/// - `version` strictly increases per `entity_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<P> {
    event_id: EventId,
    entity_id: EntityId,
    event_type: EventKind,
    version: u64,
    occurred_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    payload: P,
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

impl<P> EventEnvelope<P> {
    pub fn new(
        event_id: EventId,
        entity_id: EntityId,
        event_type: EventKind,
        version: u64,
        occurred_at: DateTime<Utc>,
        payload: P,
    ) -> Self {
        Self {
            event_id,
            entity_id,
            event_type,
            version,
            occurred_at,
            schema_version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }

    /// Wrap a typed domain event under a fresh or supplied event id.
    pub fn wrap<E>(event_id: EventId, event: &E) -> Self
    where
        E: Event<Payload = P>,
    {
        Self::new(
            event_id,
            event.entity_id(),
            event.kind(),
            event.version(),
            event.occurred_at(),
            event.payload(),
        )
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn event_type(&self) -> EventKind {
        self.event_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }
}
