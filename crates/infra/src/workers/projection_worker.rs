//! Projector: drains every channel partition into a projection.
//!
//! One tokio task per partition. Within a partition deliveries are handled
//! strictly in offset order:
//!
//! 1. apply through the projection (store timeout, bounded retries with backoff)
//! 2. if still failing, or rejected outright, park the event as a dead letter
//! 3. commit `offset + 1` for the consumer group
//!
//! An entry the channel cannot decode is parked with its raw body and skipped
//! the same way, so it never stalls the partition behind it.
//!
//! A crash between 1 and 3 re-delivers the event on restart; the version gate
//! turns that into a no-op. Shutdown is observed between deliveries, so the
//! in-flight event is always settled and committed before a task exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use catalog_events::{ChannelError, Delivery, EventChannel, Projection};
use catalog_products::ProductSnapshot;

use crate::config::AppConfig;
use crate::projections::{DeadLetter, DeadLetterStore, OffsetStore};
use crate::retry::{retry_transient, with_timeout, RetryPolicy};
use crate::workers::{idle, WorkerHandle};

pub type ProjectorHandle = WorkerHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectorSettings {
    /// Offset namespace; independent groups each see every event.
    pub consumer_group: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub store_timeout: Duration,
}

impl Default for ProjectorSettings {
    fn default() -> Self {
        Self {
            consumer_group: crate::projections::DEFAULT_PROJECTION_NAME.to_string(),
            batch_size: 64,
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl ProjectorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            consumer_group: config.consumer_group.clone(),
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            retry: config.retry.clone(),
            store_timeout: config.store_timeout,
        }
    }
}

struct Shared<C, P, O, D> {
    channel: C,
    projection: P,
    offsets: O,
    dead_letters: D,
    settings: ProjectorSettings,
}

/// Whether a delivery reached a final state (applied, stale, or parked).
enum Settled {
    Yes,
    /// Parking failed and shutdown was requested; leave the offset uncommitted.
    No,
}

#[derive(Debug)]
pub struct ProjectorWorker;

impl ProjectorWorker {
    /// Spawn one task per channel partition.
    pub fn spawn<C, P, O, D>(
        channel: C,
        projection: P,
        offsets: O,
        dead_letters: D,
        settings: ProjectorSettings,
    ) -> ProjectorHandle
    where
        C: EventChannel<ProductSnapshot> + 'static,
        P: Projection<ProductSnapshot> + 'static,
        O: OffsetStore + 'static,
        D: DeadLetterStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let partitions = channel.partitions();
        let shared = Arc::new(Shared {
            channel,
            projection,
            offsets,
            dead_letters,
            settings,
        });

        let tasks = (0..partitions)
            .map(|partition| {
                let shared = shared.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { run_partition(shared, partition, shutdown).await })
            })
            .collect();

        info!(
            group = %shared.settings.consumer_group,
            partitions,
            "projector started"
        );
        WorkerHandle::new("projector", shutdown_tx, tasks)
    }
}

async fn run_partition<C, P, O, D>(
    shared: Arc<Shared<C, P, O, D>>,
    partition: u32,
    mut shutdown: watch::Receiver<bool>,
) where
    C: EventChannel<ProductSnapshot>,
    P: Projection<ProductSnapshot>,
    O: OffsetStore,
    D: DeadLetterStore,
{
    let settings = &shared.settings;
    let group = settings.consumer_group.as_str();

    let mut next = loop {
        match retry_transient(&settings.retry, settings.store_timeout, "offsets.load", || {
            shared.offsets.load(group, partition)
        })
        .await
        {
            Ok(offset) => break offset.unwrap_or(0),
            Err(e) => {
                error!(group, partition, error = %e, "cannot load consumer offset");
                if idle(&mut shutdown, settings.poll_interval).await {
                    return;
                }
            }
        }
    };
    debug!(group, partition, offset = next, "partition consumer resuming");

    'consume: loop {
        if *shutdown.borrow() {
            break;
        }

        let batch = match with_timeout(
            settings.store_timeout,
            shared.channel.fetch(partition, next, settings.batch_size),
        )
        .await
        {
            Ok(batch) => batch,
            Err(ChannelError::Undecodable {
                offset, reason, raw, ..
            }) if offset >= next => {
                error!(group, partition, offset, error = %reason, "undecodable entry, parking it");
                let entry = DeadLetter::undecodable(group, partition, offset, raw, reason);
                if let Settled::No = park(&shared, entry, &mut shutdown).await {
                    break;
                }
                next = offset + 1;
                commit_offset(&shared, partition, next).await;
                continue;
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(group, partition, offset = next, error = %e, "fetch failed");
                } else {
                    error!(group, partition, offset = next, error = %e, "fetch failed permanently; partition stalled");
                }
                if idle(&mut shutdown, settings.poll_interval).await {
                    break;
                }
                continue;
            }
        };

        if batch.is_empty() {
            if idle(&mut shutdown, settings.poll_interval).await {
                break;
            }
            continue;
        }

        for delivery in batch {
            if delivery.offset < next {
                continue;
            }

            if let Settled::No = settle(&shared, &delivery, &mut shutdown).await {
                break 'consume;
            }

            next = delivery.offset + 1;
            commit_offset(&shared, partition, next).await;

            if *shutdown.borrow() {
                break 'consume;
            }
        }
    }

    info!(group, partition, offset = next, "partition consumer stopped");
}

async fn commit_offset<C, P, O, D>(shared: &Shared<C, P, O, D>, partition: u32, next: u64)
where
    O: OffsetStore,
{
    let settings = &shared.settings;
    let group = settings.consumer_group.as_str();
    if let Err(e) = retry_transient(&settings.retry, settings.store_timeout, "offsets.commit", || {
        shared.offsets.commit(group, partition, next)
    })
    .await
    {
        // Later commits supersede this one; a restart re-delivers and the gate absorbs it.
        error!(group, partition, offset = next, error = %e, "offset commit failed");
    }
}

/// Apply with retries; park on exhaustion or rejection.
async fn settle<C, P, O, D>(
    shared: &Shared<C, P, O, D>,
    delivery: &Delivery<ProductSnapshot>,
    shutdown: &mut watch::Receiver<bool>,
) -> Settled
where
    P: Projection<ProductSnapshot>,
    D: DeadLetterStore,
{
    let settings = &shared.settings;
    let envelope = &delivery.envelope;
    let mut attempt = 0u32;

    let failure = loop {
        attempt += 1;
        match with_timeout(settings.store_timeout, shared.projection.apply(envelope)).await {
            Ok(outcome) => {
                debug!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    event_id = %envelope.event_id(),
                    ?outcome,
                    "delivery applied"
                );
                return Settled::Yes;
            }
            Err(e) if e.is_retryable() && settings.retry.should_retry(attempt) => {
                let delay = settings.retry.delay_for_attempt(attempt);
                warn!(
                    partition = delivery.partition,
                    offset = delivery.offset,
                    entity_id = %envelope.entity_id(),
                    attempt,
                    error = %e,
                    "apply failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => break e,
        }
    };

    error!(
        partition = delivery.partition,
        offset = delivery.offset,
        entity_id = %envelope.entity_id(),
        event_id = %envelope.event_id(),
        version = envelope.version(),
        attempt,
        error = %failure,
        "apply failed permanently, parking event"
    );

    let entry = DeadLetter::new(
        settings.consumer_group.clone(),
        delivery.partition,
        delivery.offset,
        envelope.clone(),
        failure.to_string(),
        attempt,
    );
    park(shared, entry, shutdown).await
}

/// Park `entry`, blocking the partition until the store accepts it.
async fn park<C, P, O, D>(
    shared: &Shared<C, P, O, D>,
    entry: DeadLetter,
    shutdown: &mut watch::Receiver<bool>,
) -> Settled
where
    D: DeadLetterStore,
{
    let settings = &shared.settings;
    loop {
        match retry_transient(&settings.retry, settings.store_timeout, "dead_letters.park", || {
            shared.dead_letters.park(entry.clone())
        })
        .await
        {
            Ok(()) => return Settled::Yes,
            Err(e) => {
                error!(
                    partition = entry.partition,
                    offset = entry.offset,
                    error = %e,
                    "cannot park event; partition blocked"
                );
                if idle(shutdown, settings.poll_interval).await {
                    return Settled::No;
                }
            }
        }
    }
}
