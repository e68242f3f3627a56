//! Postgres pool and schema bootstrap shared by the persistent stores.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Idempotent DDL for every table the persistent backend touches.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        price DOUBLE PRECISION NOT NULL CHECK (price >= 0),
        stock BIGINT NOT NULL CHECK (stock >= 0),
        version BIGINT NOT NULL,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS product_outbox (
        sequence BIGSERIAL PRIMARY KEY,
        event_id UUID NOT NULL UNIQUE,
        entity_id UUID NOT NULL,
        envelope JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        published_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS product_outbox_pending
        ON product_outbox (sequence) WHERE published_at IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS product_read_model (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        price DOUBLE PRECISION NOT NULL,
        stock BIGINT NOT NULL,
        last_applied_version BIGINT NOT NULL,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "DROP INDEX IF EXISTS product_read_model_by_name",
    r#"
    CREATE INDEX IF NOT EXISTS product_read_model_by_name_bytes
        ON product_read_model ((name COLLATE "C"), id) WHERE NOT deleted
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projection_offsets (
        consumer_group TEXT NOT NULL,
        partition INTEGER NOT NULL,
        next_offset BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (consumer_group, partition)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projection_dead_letters (
        id UUID PRIMARY KEY,
        consumer_group TEXT NOT NULL,
        partition INTEGER NOT NULL,
        channel_offset BIGINT NOT NULL,
        envelope JSONB,
        raw_body TEXT,
        reason TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        failed_at TIMESTAMPTZ NOT NULL,
        CHECK (envelope IS NOT NULL OR raw_body IS NOT NULL)
    )
    "#,
    "ALTER TABLE projection_dead_letters ADD COLUMN IF NOT EXISTS raw_body TEXT",
    "ALTER TABLE projection_dead_letters ALTER COLUMN envelope DROP NOT NULL",
];

pub async fn connect(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Create missing tables and indexes. Safe to run on every start.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(tables = 5, "database schema ensured");
    Ok(())
}

/// Whether a sqlx error is worth retrying (connectivity rather than data).
pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
    )
}

/// Postgres unique-violation SQLSTATE.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
