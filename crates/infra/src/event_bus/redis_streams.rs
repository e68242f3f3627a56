//! Redis Streams-backed event channel (durable, partitioned, offset-addressed).
//!
//! ## Layout
//!
//! - **Partition stream**: `{prefix}:p{n}`, one Redis stream per partition
//! - **Offset counter**: `{prefix}:p{n}:seq`, number of entries ever appended
//! - **Entry id**: `0-{offset + 1}`, so offsets are dense and start at 0
//!
//! `publish` runs a Lua script that increments the counter and appends with
//! the explicit id in one step. Consumers track their own offsets; reads are
//! plain `XRANGE` scans starting at the requested offset. No consumer-group
//! state is kept in Redis.

use async_trait::async_trait;
use redis::streams::{StreamId, StreamRangeReply};
use redis::AsyncCommands;
use tracing::instrument;

use catalog_events::{partition_for, Appended, ChannelError, Delivery, EventChannel};
use catalog_products::{ProductEnvelope, ProductSnapshot};

/// Default key prefix for partition streams.
const DEFAULT_PREFIX: &str = "catalog:products";

/// INCR the partition counter and XADD with the derived id; returns the offset.
const APPEND_SCRIPT: &str = r#"
local n = redis.call('INCR', KEYS[2])
redis.call('XADD', KEYS[1], '0-' .. n, 'event_id', ARGV[1], 'entity_id', ARGV[2], 'envelope', ARGV[3])
return n - 1
"#;

#[derive(Debug, Clone)]
pub struct RedisStreamsEventChannel {
    client: redis::Client,
    prefix: String,
    partitions: u32,
    append: redis::Script,
}

impl RedisStreamsEventChannel {
    /// Open a channel over `partitions` streams under `prefix` (default `catalog:products`).
    pub fn new(
        redis_url: impl AsRef<str>,
        prefix: Option<String>,
        partitions: u32,
    ) -> Result<Self, ChannelError> {
        if partitions == 0 {
            return Err(ChannelError::UnknownPartition(0));
        }
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ChannelError::Unavailable(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            partitions,
            append: redis::Script::new(APPEND_SCRIPT),
        })
    }

    fn stream_key(&self, partition: u32) -> String {
        format!("{}:p{}", self.prefix, partition)
    }

    fn counter_key(&self, partition: u32) -> String {
        format!("{}:p{}:seq", self.prefix, partition)
    }

    fn check_partition(&self, partition: u32) -> Result<(), ChannelError> {
        if partition >= self.partitions {
            return Err(ChannelError::UnknownPartition(partition));
        }
        Ok(())
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection, ChannelError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_error)
    }
}

fn redis_error(err: redis::RedisError) -> ChannelError {
    ChannelError::Unavailable(err.to_string())
}

/// `0-{n}` -> offset `n - 1`.
fn offset_from_entry_id(id: &str) -> Option<u64> {
    let (_, seq) = id.split_once('-')?;
    seq.parse::<u64>().ok()?.checked_sub(1)
}

fn entry_id_for_offset(offset: u64) -> String {
    format!("0-{}", offset.saturating_add(1))
}

fn decode_entry(partition: u32, entry: &StreamId) -> Result<Delivery<ProductSnapshot>, ChannelError> {
    let offset = offset_from_entry_id(&entry.id)
        .ok_or_else(|| ChannelError::Serialization(format!("unexpected stream entry id {}", entry.id)))?;
    let undecodable = |reason: String, raw: String| ChannelError::Undecodable {
        partition,
        offset,
        reason,
        raw,
    };

    let body: String = entry
        .get("envelope")
        .ok_or_else(|| undecodable("entry has no envelope field".to_string(), String::new()))?;
    match serde_json::from_str::<ProductEnvelope>(&body) {
        Ok(envelope) => Ok(Delivery {
            partition,
            offset,
            envelope,
        }),
        Err(e) => Err(undecodable(e.to_string(), body)),
    }
}

/// Decode entries in order, stopping before the first bad one.
///
/// Only a bad entry at the head of the range is reported as an error; any
/// later one is left for the next fetch, which then starts on it.
fn decode_batch(partition: u32, entries: Vec<StreamId>) -> Result<Vec<Delivery<ProductSnapshot>>, ChannelError> {
    let mut batch = Vec::with_capacity(entries.len());
    for entry in &entries {
        match decode_entry(partition, entry) {
            Ok(delivery) => batch.push(delivery),
            Err(e) if batch.is_empty() => return Err(e),
            Err(_) => break,
        }
    }
    Ok(batch)
}

#[async_trait]
impl EventChannel<ProductSnapshot> for RedisStreamsEventChannel {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    #[instrument(
        skip(self, envelope),
        fields(
            entity_id = %envelope.entity_id(),
            event_id = %envelope.event_id(),
            version = envelope.version()
        ),
        err
    )]
    async fn publish(&self, envelope: ProductEnvelope) -> Result<Appended, ChannelError> {
        let partition = partition_for(envelope.entity_id(), self.partitions);
        let body = serde_json::to_string(&envelope)
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;

        let mut conn = self.get_conn().await?;
        let offset: u64 = self
            .append
            .key(self.stream_key(partition))
            .key(self.counter_key(partition))
            .arg(envelope.event_id().to_string())
            .arg(envelope.entity_id().to_string())
            .arg(body)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        Ok(Appended { partition, offset })
    }

    async fn fetch(
        &self,
        partition: u32,
        from_offset: u64,
        max: usize,
    ) -> Result<Vec<Delivery<ProductSnapshot>>, ChannelError> {
        self.check_partition(partition)?;
        if max == 0 {
            return Ok(vec![]);
        }

        let mut conn = self.get_conn().await?;
        let reply: StreamRangeReply = conn
            .xrange_count(self.stream_key(partition), entry_id_for_offset(from_offset), "+", max)
            .await
            .map_err(redis_error)?;

        decode_batch(partition, reply.ids)
    }

    async fn end_offset(&self, partition: u32) -> Result<u64, ChannelError> {
        self.check_partition(partition)?;
        let mut conn = self.get_conn().await?;
        let count: Option<u64> = conn
            .get(self.counter_key(partition))
            .await
            .map_err(redis_error)?;
        Ok(count.unwrap_or(0))
    }
}
