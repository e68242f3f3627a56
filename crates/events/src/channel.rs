//! Event channel abstraction (mechanics only).
//!
//! The channel is the transport between the command side and projectors:
//!
//! ```text
//! Command handler ─┐                      ┌─ Projector (group A, partition 0..N)
//! Outbox relay ────┴─ publish ─► [ p0 | p1 | … | pN ] ─ fetch ─┴─ Projector (group B, …)
//! ```
//!
//! ## Guarantees
//!
//! - **Partitioned by entity**: `publish` appends to `partition_for(entity_id)`,
//!   so events of one entity are observed in publish order by any consumer.
//! - **Durable, offset-addressed**: each partition is an append-only log with
//!   dense offsets starting at 0. Consumers keep their own cursor (see the
//!   offset store in the infrastructure layer) and re-read from it after a
//!   restart.
//! - **At-least-once**: the same `event_id` may be appended more than once
//!   (relay retries) and any entry may be fetched more than once (consumer
//!   restarts). Consumers must be idempotent.
//! - Cross-partition ordering is unspecified.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::EventEnvelope;

/// Position assigned to a published event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Appended {
    pub partition: u32,
    pub offset: u64,
}

/// An event read from a partition at a given offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<P> {
    pub partition: u32,
    pub offset: u64,
    pub envelope: EventEnvelope<P>,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Backend unreachable, timed out, or otherwise failed; safe to retry.
    #[error("event channel unavailable: {0}")]
    Unavailable(String),

    #[error("event serialization failed: {0}")]
    Serialization(String),

    #[error("unknown partition {0}")]
    UnknownPartition(u32),

    /// The entry at `offset` exists but will never decode into an envelope.
    /// `raw` is the stored body (empty if the body itself is missing).
    #[error("undecodable entry at partition {partition} offset {offset}: {reason}")]
    Undecodable {
        partition: u32,
        offset: u64,
        reason: String,
        raw: String,
    },
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Unavailable(_))
    }
}

/// Durable, partitioned, multi-consumer event log.
///
/// Implementations must be `Send + Sync`; publishers and every partition
/// consumer share one instance.
#[async_trait]
pub trait EventChannel<P>: Send + Sync
where
    P: Send + Sync + 'static,
{
    /// Number of partitions. Fixed for the lifetime of the channel.
    fn partitions(&self) -> u32;

    /// Append `envelope` to the partition of its `entity_id`.
    ///
    /// Returns only once the channel has durably accepted the event.
    async fn publish(&self, envelope: EventEnvelope<P>) -> Result<Appended, ChannelError>;

    /// Read up to `max` entries of `partition` starting at `from_offset`.
    ///
    /// Returns an empty batch when the consumer is caught up. Entries are
    /// decoded one by one: a batch stops short of the first undecodable entry,
    /// and a fetch that starts on one fails with [`ChannelError::Undecodable`]
    /// so the consumer can set it aside and continue after it.
    async fn fetch(
        &self,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> Result<Vec<Delivery<P>>, ChannelError>;

    /// Offset the next append to `partition` will receive.
    async fn end_offset(&self, partition: u32) -> Result<u64, ChannelError>;
}

#[async_trait]
impl<P, C> EventChannel<P> for Arc<C>
where
    C: EventChannel<P> + ?Sized,
    P: Send + Sync + 'static,
{
    fn partitions(&self) -> u32 {
        (**self).partitions()
    }

    async fn publish(&self, envelope: EventEnvelope<P>) -> Result<Appended, ChannelError> {
        (**self).publish(envelope).await
    }

    async fn fetch(
        &self,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> Result<Vec<Delivery<P>>, ChannelError> {
        (**self).fetch(partition, from_offset, max).await
    }

    async fn end_offset(&self, partition: u32) -> Result<u64, ChannelError> {
        (**self).end_offset(partition).await
    }
}
