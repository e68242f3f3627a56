//! Command execution pipeline for products.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load current write record (retry on transient failure, per-call timeout)
//!   ↓
//! 2. Decide (pure `Product::handle`, produces exactly one event)
//!   ↓
//! 3. Commit record change + outbox entry atomically
//!   ↓
//! 4. Publish to the event channel (single attempt, bounded by a timeout)
//!   ↓
//! 5. Mark the outbox entry published
//! ```
//!
//! A successful return means step 3 is durable. If step 4 fails the caller
//! gets a degraded success (`published == false`) and the outbox relay
//! publishes the event later.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use catalog_core::{Aggregate, DomainError, Entity, EventId, ExpectedVersion};
use catalog_events::{EventChannel, EventEnvelope};
use catalog_products::{
    CreateProduct, DeleteProduct, Product, ProductCommand, ProductEnvelope, ProductId, ProductSnapshot,
    UpdateProduct,
};

use crate::entity_store::{EntityStore, EntityStoreError, WriteChange};
use crate::retry::{retry_transient, with_timeout, RetryPolicy};

/// Result of an accepted command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub product_id: ProductId,
    pub event_id: EventId,
    pub version: u64,
    /// The event reached the channel before returning.
    pub published: bool,
    /// Why publication failed; the write is committed regardless.
    pub publish_error: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("product {0} not found")]
    NotFound(ProductId),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The entity store kept failing after local retries.
    #[error("entity store failure: {0}")]
    TransientStore(String),
}

impl CommandError {
    fn from_domain(err: DomainError, id: ProductId) -> Self {
        match err {
            DomainError::Validation(msg) => CommandError::Validation(msg),
            DomainError::InvariantViolation(msg) => CommandError::Validation(msg),
            DomainError::InvalidId(msg) => CommandError::Validation(msg),
            DomainError::NotFound => CommandError::NotFound(id),
            DomainError::Conflict(msg) => CommandError::Conflict(msg),
        }
    }
}

impl From<EntityStoreError> for CommandError {
    fn from(value: EntityStoreError) -> Self {
        match value {
            EntityStoreError::Conflict(id) => CommandError::Conflict(format!("product {id} already exists")),
            EntityStoreError::NotFound(id) => CommandError::NotFound(id),
            EntityStoreError::Concurrency(msg) => CommandError::Conflict(msg),
            EntityStoreError::Unavailable(msg) => CommandError::TransientStore(msg),
            EntityStoreError::Serialization(msg) => CommandError::TransientStore(msg),
        }
    }
}

/// Validates and executes product commands against the entity store.
///
/// Generic over the store and channel so tests run fully in memory and
/// production wires Postgres + Redis without touching this code.
pub struct ProductCommandHandler<S, C> {
    store: S,
    channel: C,
    retry: RetryPolicy,
    store_timeout: Duration,
    publish_timeout: Duration,
}

impl<S, C> ProductCommandHandler<S, C>
where
    S: EntityStore,
    C: EventChannel<ProductSnapshot>,
{
    pub fn new(store: S, channel: C) -> Self {
        Self {
            store,
            channel,
            retry: RetryPolicy::default(),
            store_timeout: Duration::from_secs(2),
            publish_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, store_timeout: Duration, publish_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn create(&self, cmd: CreateProduct) -> Result<CommandOutcome, CommandError> {
        self.execute(ProductCommand::Create(cmd)).await
    }

    pub async fn update(&self, cmd: UpdateProduct) -> Result<CommandOutcome, CommandError> {
        self.execute(ProductCommand::Update(cmd)).await
    }

    pub async fn delete(&self, cmd: DeleteProduct) -> Result<CommandOutcome, CommandError> {
        self.execute(ProductCommand::Delete(cmd)).await
    }

    #[instrument(skip(self, command), fields(entity_id = %command.product_id()), err)]
    pub async fn execute(&self, command: ProductCommand) -> Result<CommandOutcome, CommandError> {
        let id = command.product_id();
        let envelope = self.commit(id, &command).await?;

        let mut outcome = CommandOutcome {
            product_id: id,
            event_id: envelope.event_id(),
            version: envelope.version(),
            published: false,
            publish_error: None,
        };

        match with_timeout(self.publish_timeout, self.channel.publish(envelope)).await {
            Ok(appended) => {
                outcome.published = true;
                debug!(
                    event_id = %outcome.event_id,
                    partition = appended.partition,
                    offset = appended.offset,
                    "event published"
                );
                let event_id = outcome.event_id;
                if let Err(e) = retry_transient(&self.retry, self.store_timeout, "outbox.mark_published", || {
                    self.store.mark_published(event_id)
                })
                .await
                {
                    // The relay will publish it again; the projector absorbs the duplicate.
                    warn!(event_id = %event_id, error = %e, "failed to mark outbox entry published");
                }
            }
            Err(e) => {
                warn!(
                    event_id = %outcome.event_id,
                    version = outcome.version,
                    error = %e,
                    "publish failed after commit; event left in outbox"
                );
                outcome.publish_error = Some(e.to_string());
            }
        }

        info!(version = outcome.version, published = outcome.published, "command accepted");
        Ok(outcome)
    }

    /// Steps 1-3. Reloads and re-decides when the record moved underneath us.
    async fn commit(&self, id: ProductId, command: &ProductCommand) -> Result<ProductEnvelope, CommandError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let current = retry_transient(&self.retry, self.store_timeout, "entity_store.load", || {
                self.store.load(id)
            })
            .await?
            .unwrap_or_else(|| Product::empty(id));

            let event = current
                .handle(command)
                .map_err(|e| CommandError::from_domain(e, id))?;

            let mut next = current.clone();
            next.apply(&event);

            let expected = ExpectedVersion::Exact(current.version());
            let change = match command {
                ProductCommand::Create(_) => WriteChange::Insert(next),
                ProductCommand::Update(_) => WriteChange::Update { record: next, expected },
                ProductCommand::Delete(_) => WriteChange::Delete { record: next, expected },
            };
            let envelope = EventEnvelope::wrap(EventId::new(), &event);

            let committed = retry_transient(&self.retry, self.store_timeout, "entity_store.commit", || {
                self.store.commit(change.clone(), envelope.clone())
            })
            .await;

            match committed {
                Ok(entry) => return Ok(entry.envelope),
                Err(EntityStoreError::Conflict(_)) if matches!(change, WriteChange::Insert(_)) => {
                    // An earlier attempt may have committed before its reply was lost.
                    return self.recover_insert(id, envelope).await;
                }
                Err(EntityStoreError::Concurrency(msg)) if self.retry.should_retry(attempt) => {
                    debug!(attempt, reason = %msg, "concurrent modification, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// An insert conflict is our own write when the outbox holds this attempt's event id.
    async fn recover_insert(&self, id: ProductId, envelope: ProductEnvelope) -> Result<ProductEnvelope, CommandError> {
        let event_id = envelope.event_id();
        let found = retry_transient(&self.retry, self.store_timeout, "entity_store.outbox_entry", || {
            self.store.outbox_entry(event_id)
        })
        .await?;
        match found {
            Some(entry) => {
                info!(event_id = %event_id, "insert had already committed; treating retry as success");
                Ok(entry.envelope)
            }
            None => Err(EntityStoreError::Conflict(id).into()),
        }
    }
}
