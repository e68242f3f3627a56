//! Domain events, their wire envelope, and the event channel abstraction.
//!
//! Nothing here knows about a concrete entity type or storage engine: the
//! command side wraps its typed events into [`EventEnvelope`]s, publishes them
//! through an [`EventChannel`], and consumers apply them through a
//! [`Projection`].

pub mod channel;
pub mod envelope;
pub mod event;
pub mod in_memory_channel;
pub mod partition;
pub mod projection;

pub use channel::{Appended, ChannelError, Delivery, EventChannel};
pub use envelope::{EventEnvelope, CURRENT_SCHEMA_VERSION};
pub use event::{Event, EventKind};
pub use in_memory_channel::InMemoryEventChannel;
pub use partition::partition_for;
pub use projection::{ApplyOutcome, Projection, ProjectionError};
