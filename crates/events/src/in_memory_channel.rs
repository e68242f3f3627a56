//! In-memory event channel for tests/dev.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::channel::{Appended, ChannelError, Delivery, EventChannel};
use crate::envelope::EventEnvelope;
use crate::partition::partition_for;

/// In-memory partitioned log.
///
/// - Durable for the lifetime of the process (nothing is ever removed)
/// - Entries are never acknowledged away; consumers track their own offsets
/// - Duplicate appends of the same `event_id` are kept (at-least-once)
#[derive(Debug)]
pub struct InMemoryEventChannel<P> {
    partitions: Vec<RwLock<Vec<EventEnvelope<P>>>>,
}

impl<P> InMemoryEventChannel<P> {
    pub fn new(partitions: u32) -> Self {
        let count = partitions.max(1) as usize;
        Self {
            partitions: (0..count).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    fn log(&self, partition: u32) -> Result<&RwLock<Vec<EventEnvelope<P>>>, ChannelError> {
        self.partitions
            .get(partition as usize)
            .ok_or(ChannelError::UnknownPartition(partition))
    }
}

impl<P> Default for InMemoryEventChannel<P> {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl<P> EventChannel<P> for InMemoryEventChannel<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn publish(&self, envelope: EventEnvelope<P>) -> Result<Appended, ChannelError> {
        let partition = partition_for(envelope.entity_id(), self.partitions());
        let mut log = self
            .log(partition)?
            .write()
            .map_err(|_| ChannelError::Unavailable("lock poisoned".to_string()))?;

        let offset = log.len() as u64;
        log.push(envelope);
        Ok(Appended { partition, offset })
    }

    async fn fetch(
        &self,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> Result<Vec<Delivery<P>>, ChannelError> {
        let log = self
            .log(partition)?
            .read()
            .map_err(|_| ChannelError::Unavailable("lock poisoned".to_string()))?;

        Ok(log
            .iter()
            .enumerate()
            .skip(from_offset as usize)
            .take(max)
            .map(|(offset, envelope)| Delivery {
                partition,
                offset: offset as u64,
                envelope: envelope.clone(),
            })
            .collect())
    }

    async fn end_offset(&self, partition: u32) -> Result<u64, ChannelError> {
        let log = self
            .log(partition)?
            .read()
            .map_err(|_| ChannelError::Unavailable("lock poisoned".to_string()))?;
        Ok(log.len() as u64)
    }
}
