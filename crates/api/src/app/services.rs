//! Backend wiring: picks the stores and channel, starts the background
//! workers, and exposes the command/query handlers to the routes.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use catalog_events::{EventChannel, InMemoryEventChannel};
use catalog_infra::{
    config::{AppConfig, Backend},
    entity_store::{EntityStore, InMemoryEntityStore},
    projections::{DeadLetterStore, InMemoryDeadLetterStore, InMemoryOffsetStore, OffsetStore, ProductProjection},
    read_model::{InMemoryReadStore, ReadStore},
    workers::{OutboxRelay, ProjectorHandle, ProjectorSettings, ProjectorWorker, WorkerHandle},
    ProductCommandHandler, ProductQueryHandler,
};
use catalog_products::ProductSnapshot;

pub type SharedEntityStore = Arc<dyn EntityStore>;
pub type SharedChannel = Arc<dyn EventChannel<ProductSnapshot>>;
pub type SharedReadStore = Arc<dyn ReadStore>;
pub type SharedDeadLetters = Arc<dyn DeadLetterStore>;
type SharedOffsets = Arc<dyn OffsetStore>;

pub type CommandHandler = ProductCommandHandler<SharedEntityStore, SharedChannel>;
pub type QueryHandler = ProductQueryHandler<SharedReadStore>;
pub type CatalogProjection = ProductProjection<SharedReadStore>;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("DATABASE_URL must be set for the persistent backend")]
    MissingDatabaseUrl,

    #[error("persistent backend requires the `redis` feature")]
    RedisDisabled,

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event channel: {0}")]
    Channel(#[from] catalog_events::ChannelError),
}

/// Handlers and stores shared by every request.
pub struct AppServices {
    commands: CommandHandler,
    queries: QueryHandler,
    projection: Arc<CatalogProjection>,
    dead_letters: SharedDeadLetters,
}

impl AppServices {
    pub fn commands(&self) -> &CommandHandler {
        &self.commands
    }

    pub fn queries(&self) -> &QueryHandler {
        &self.queries
    }

    pub fn projection(&self) -> &CatalogProjection {
        &self.projection
    }

    pub fn dead_letters(&self) -> &dyn DeadLetterStore {
        self.dead_letters.as_ref()
    }
}

/// Running backend: request-facing services plus the workers behind them.
pub struct Runtime {
    services: Arc<AppServices>,
    projector: ProjectorHandle,
    relay: WorkerHandle,
}

impl Runtime {
    pub fn services(&self) -> Arc<AppServices> {
        self.services.clone()
    }

    /// Stop the relay, then the projector. Each finishes its in-flight item.
    pub async fn shutdown(self) {
        self.relay.shutdown().await;
        self.projector.shutdown().await;
        info!("workers stopped");
    }
}

struct Backends {
    store: SharedEntityStore,
    channel: SharedChannel,
    read_store: SharedReadStore,
    offsets: SharedOffsets,
    dead_letters: SharedDeadLetters,
}

fn in_memory_backends(config: &AppConfig) -> Backends {
    Backends {
        store: Arc::new(InMemoryEntityStore::new()),
        channel: Arc::new(InMemoryEventChannel::<ProductSnapshot>::new(config.partitions)),
        read_store: Arc::new(InMemoryReadStore::new()),
        offsets: Arc::new(InMemoryOffsetStore::new()),
        dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
    }
}

#[cfg(feature = "redis")]
async fn persistent_backends(config: &AppConfig) -> Result<Backends, BootstrapError> {
    use catalog_infra::{
        db,
        entity_store::PostgresEntityStore,
        event_bus::RedisStreamsEventChannel,
        projections::{PostgresDeadLetterStore, PostgresOffsetStore},
        read_model::PostgresReadStore,
    };

    let database_url = config
        .database_url
        .as_deref()
        .ok_or(BootstrapError::MissingDatabaseUrl)?;
    let pool = db::connect(database_url).await?;
    db::ensure_schema(&pool).await?;

    let channel = RedisStreamsEventChannel::new(&config.redis_url, None, config.partitions)?;

    Ok(Backends {
        store: Arc::new(PostgresEntityStore::new(pool.clone())),
        channel: Arc::new(channel),
        read_store: Arc::new(PostgresReadStore::new(pool.clone())),
        offsets: Arc::new(PostgresOffsetStore::new(pool.clone())),
        dead_letters: Arc::new(PostgresDeadLetterStore::new(pool)),
    })
}

#[cfg(not(feature = "redis"))]
async fn persistent_backends(_config: &AppConfig) -> Result<Backends, BootstrapError> {
    Err(BootstrapError::RedisDisabled)
}

/// Build the configured backend, reconcile the outbox once, and start the
/// projector and relay.
pub async fn bootstrap(config: &AppConfig) -> Result<Runtime, BootstrapError> {
    let backends = match config.backend {
        Backend::Memory => in_memory_backends(config),
        Backend::Persistent => persistent_backends(config).await?,
    };
    Ok(start(backends, config).await)
}

async fn start(backends: Backends, config: &AppConfig) -> Runtime {
    let Backends {
        store,
        channel,
        read_store,
        offsets,
        dead_letters,
    } = backends;

    // Events committed before a crash may never have reached the channel.
    let relay = OutboxRelay::configured(store.clone(), channel.clone(), config);
    match relay.run_once().await {
        Ok(stats) => info!(
            published = stats.published,
            interrupted = stats.interrupted,
            "outbox reconciled"
        ),
        Err(e) => warn!(error = %e, "outbox reconciliation failed; relay will keep trying"),
    }

    let projection = Arc::new(ProductProjection::with_name(
        read_store.clone(),
        config.consumer_group.clone(),
    ));
    let projector = ProjectorWorker::spawn(
        channel.clone(),
        projection.clone(),
        offsets,
        dead_letters.clone(),
        ProjectorSettings::from_config(config),
    );
    let relay = relay.spawn();

    let commands = ProductCommandHandler::new(store, channel)
        .with_retry(config.retry.clone())
        .with_timeouts(config.store_timeout, config.store_timeout);
    let queries = ProductQueryHandler::new(read_store).with_retry(config.retry.clone(), config.store_timeout);

    Runtime {
        services: Arc::new(AppServices {
            commands,
            queries,
            projection,
            dead_letters,
        }),
        projector,
        relay,
    }
}
