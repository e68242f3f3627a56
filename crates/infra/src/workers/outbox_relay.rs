//! Outbox relay: republishes committed events the command path failed to publish.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use catalog_events::EventChannel;
use catalog_products::ProductSnapshot;

use crate::config::AppConfig;
use crate::entity_store::{EntityStore, EntityStoreError};
use crate::retry::{retry_transient, with_timeout, RetryPolicy};
use crate::workers::{idle, WorkerHandle};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub published: usize,
    /// A publish failed; remaining entries wait for the next pass.
    pub interrupted: bool,
}

pub struct OutboxRelay<S, C> {
    store: S,
    channel: C,
    batch_size: usize,
    poll_interval: Duration,
    retry: RetryPolicy,
    store_timeout: Duration,
}

impl<S, C> OutboxRelay<S, C>
where
    S: EntityStore,
    C: EventChannel<ProductSnapshot>,
{
    pub fn new(store: S, channel: C) -> Self {
        Self {
            store,
            channel,
            batch_size: 64,
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            store_timeout: Duration::from_secs(2),
        }
    }

    pub fn configured(store: S, channel: C, config: &AppConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            retry: config.retry.clone(),
            store_timeout: config.store_timeout,
            ..Self::new(store, channel)
        }
    }

    /// Publish every pending entry in commit order.
    ///
    /// Stops at the first publish failure so one entity's events are never
    /// published out of commit order by the relay itself.
    pub async fn run_once(&self) -> Result<RelayStats, EntityStoreError> {
        let mut stats = RelayStats::default();
        loop {
            let pending = retry_transient(&self.retry, self.store_timeout, "outbox.pending", || {
                self.store.pending_outbox(self.batch_size)
            })
            .await?;

            if pending.is_empty() {
                return Ok(stats);
            }

            for entry in pending {
                let event_id = entry.envelope.event_id();
                match with_timeout(self.store_timeout, self.channel.publish(entry.envelope)).await {
                    Ok(appended) => {
                        debug!(
                            event_id = %event_id,
                            sequence = entry.sequence,
                            partition = appended.partition,
                            offset = appended.offset,
                            "outbox entry relayed"
                        );
                    }
                    Err(e) => {
                        warn!(event_id = %event_id, sequence = entry.sequence, error = %e, "relay publish failed");
                        stats.interrupted = true;
                        return Ok(stats);
                    }
                }

                retry_transient(&self.retry, self.store_timeout, "outbox.mark_published", || {
                    self.store.mark_published(event_id)
                })
                .await?;
                stats.published += 1;
            }
        }
    }

    /// Run `run_once` every poll interval until shut down.
    pub fn spawn(self) -> WorkerHandle
    where
        S: 'static,
        C: 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let relay = Arc::new(self);

        let task = tokio::spawn(async move {
            loop {
                match relay.run_once().await {
                    Ok(stats) if stats.published > 0 => {
                        info!(published = stats.published, "outbox relay pass");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "outbox relay pass failed"),
                }
                if idle(&mut shutdown_rx, relay.poll_interval).await {
                    break;
                }
            }
            info!("outbox relay stopped");
        });

        WorkerHandle::new("outbox_relay", shutdown_tx, vec![task])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use catalog_core::EventId;
    use catalog_events::{Appended, ChannelError, Delivery, EventEnvelope, EventKind, InMemoryEventChannel};
    use catalog_products::{Product, ProductEnvelope, ProductId};

    use crate::entity_store::{InMemoryEntityStore, WriteChange};

    #[derive(Default)]
    struct GatedChannel {
        inner: InMemoryEventChannel<ProductSnapshot>,
        down: AtomicBool,
    }

    #[async_trait]
    impl EventChannel<ProductSnapshot> for GatedChannel {
        fn partitions(&self) -> u32 {
            self.inner.partitions()
        }

        async fn publish(&self, envelope: ProductEnvelope) -> Result<Appended, ChannelError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(ChannelError::Unavailable("down".to_string()));
            }
            self.inner.publish(envelope).await
        }

        async fn fetch(&self, partition: u32, from: u64, max: usize) -> Result<Vec<Delivery<ProductSnapshot>>, ChannelError> {
            self.inner.fetch(partition, from, max).await
        }

        async fn end_offset(&self, partition: u32) -> Result<u64, ChannelError> {
            self.inner.end_offset(partition).await
        }
    }

    async fn commit_created(store: &InMemoryEntityStore) -> EventId {
        let id = ProductId::generate();
        let envelope = EventEnvelope::new(
            EventId::new(),
            id.0,
            EventKind::Created,
            0,
            Utc::now(),
            ProductSnapshot {
                id,
                name: "Widget".to_string(),
                description: None,
                price: 1.0,
                stock: 1,
            },
        );
        let record = Product::restore(envelope.payload().clone(), 0, false);
        let event_id = envelope.event_id();
        store.commit(WriteChange::Insert(record), envelope).await.unwrap();
        event_id
    }

    fn relay(store: Arc<InMemoryEntityStore>, channel: Arc<GatedChannel>) -> OutboxRelay<Arc<InMemoryEntityStore>, Arc<GatedChannel>> {
        let mut relay = OutboxRelay::new(store, channel);
        relay.batch_size = 2;
        relay.retry = RetryPolicy::fixed(2, Duration::from_millis(1));
        relay.poll_interval = Duration::from_millis(5);
        relay
    }

    #[tokio::test]
    async fn pending_entries_are_published_in_commit_order() {
        let store = Arc::new(InMemoryEntityStore::new());
        let channel = Arc::new(GatedChannel::default());
        let mut expected = Vec::new();
        for _ in 0..5 {
            expected.push(commit_created(&store).await);
        }

        let stats = relay(store.clone(), channel.clone()).run_once().await.unwrap();

        assert_eq!(stats, RelayStats { published: 5, interrupted: false });
        assert!(store.pending_outbox(10).await.unwrap().is_empty());
        let relayed: Vec<EventId> = channel
            .fetch(0, 0, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.envelope.event_id())
            .collect();
        assert_eq!(relayed, expected);
    }

    #[tokio::test]
    async fn publish_failure_leaves_entries_pending_for_the_next_pass() {
        let store = Arc::new(InMemoryEntityStore::new());
        let channel = Arc::new(GatedChannel::default());
        commit_created(&store).await;
        commit_created(&store).await;
        let relay = relay(store.clone(), channel.clone());

        channel.down.store(true, Ordering::SeqCst);
        let stats = relay.run_once().await.unwrap();
        assert_eq!(stats, RelayStats { published: 0, interrupted: true });
        assert_eq!(store.pending_outbox(10).await.unwrap().len(), 2);

        channel.down.store(false, Ordering::SeqCst);
        assert_eq!(relay.run_once().await.unwrap().published, 2);
        assert_eq!(channel.end_offset(0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn spawned_relay_drains_the_outbox_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryEntityStore::new());
        let channel = Arc::new(GatedChannel::default());
        commit_created(&store).await;

        let handle = relay(store.clone(), channel.clone()).spawn();
        for _ in 0..200 {
            if store.pending_outbox(10).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("relay did not stop");

        assert!(store.pending_outbox(10).await.unwrap().is_empty());
        assert_eq!(channel.end_offset(0).await.unwrap(), 1);
    }
}
