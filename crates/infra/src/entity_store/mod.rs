//! Authoritative write store with a transactional outbox.
//!
//! Every accepted mutation is committed together with the event describing
//! it. The command handler publishes the event right away; the outbox relay
//! republishes whatever is still pending after a publish failure or a crash.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEntityStore;
pub use postgres::PostgresEntityStore;
pub use r#trait::{EntityStore, EntityStoreError, OutboxEntry, WriteChange};
