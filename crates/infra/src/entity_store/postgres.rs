//! Postgres-backed entity store.
//!
//! The `products` row and its `product_outbox` entry are written in one
//! transaction. Deleted products stay as rows with `deleted = TRUE`.
//!
//! ## Error Mapping
//!
//! | SQLx error | EntityStoreError |
//! |------------|------------------|
//! | I/O, pool timeout/closed, TLS | `Unavailable` (retried by callers) |
//! | Existing id on insert | `Conflict` |
//! | Unique violation | `Concurrency` |
//! | Anything else | `Serialization` |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use tracing::instrument;

use catalog_core::{Entity, EntityId, EventId, ExpectedVersion};
use catalog_products::{Product, ProductEnvelope, ProductId, ProductSnapshot};

use super::r#trait::{EntityStore, EntityStoreError, OutboxEntry, WriteChange};
use crate::db;

#[derive(Debug, Clone)]
pub struct PostgresEntityStore {
    pool: Arc<PgPool>,
}

impl PostgresEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn insert(
        tx: &mut Transaction<'_, Postgres>,
        record: &Product,
    ) -> Result<(), EntityStoreError> {
        let id = record.id_typed();
        let result = sqlx::query(
            r#"
            INSERT INTO products (id, name, description, price, stock, version, deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id.0.as_uuid())
        .bind(record.name())
        .bind(record.description())
        .bind(record.price())
        .bind(record.stock())
        .bind(record.version() as i64)
        .bind(record.is_deleted())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        if result.rows_affected() == 0 {
            return Err(EntityStoreError::Conflict(id));
        }
        Ok(())
    }

    async fn replace(
        tx: &mut Transaction<'_, Postgres>,
        record: &Product,
        expected: ExpectedVersion,
    ) -> Result<(), EntityStoreError> {
        let id = record.id_typed();
        let current = sqlx::query("SELECT version, deleted FROM products WHERE id = $1 FOR UPDATE")
            .bind(id.0.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_row", e))?;

        let current_version = match current {
            None => return Err(EntityStoreError::NotFound(id)),
            Some(row) => {
                let deleted: bool = row.try_get("deleted").map_err(decode_error)?;
                if deleted {
                    return Err(EntityStoreError::NotFound(id));
                }
                row.try_get::<i64, _>("version").map_err(decode_error)? as u64
            }
        };

        if !expected.matches(current_version) {
            return Err(EntityStoreError::Concurrency(format!(
                "expected {expected:?}, found {current_version}"
            )));
        }

        sqlx::query(
            r#"
            UPDATE products
            SET name = $2, description = $3, price = $4, stock = $5,
                version = $6, deleted = $7, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.0.as_uuid())
        .bind(record.name())
        .bind(record.description())
        .bind(record.price())
        .bind(record.stock())
        .bind(record.version() as i64)
        .bind(record.is_deleted())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        Ok(())
    }
}

#[async_trait]
impl EntityStore for PostgresEntityStore {
    #[instrument(skip(self), fields(entity_id = %id), err)]
    async fn load(&self, id: ProductId) -> Result<Option<Product>, EntityStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, price, stock, version, deleted
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(id.0.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        row.map(|r| product_from_row(&r)).transpose()
    }

    #[instrument(
        skip(self, change, event),
        fields(entity_id = %change.product_id(), version = event.version()),
        err
    )]
    async fn commit(
        &self,
        change: WriteChange,
        event: ProductEnvelope,
    ) -> Result<OutboxEntry, EntityStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        match &change {
            WriteChange::Insert(record) => Self::insert(&mut tx, record).await?,
            WriteChange::Update { record, expected } | WriteChange::Delete { record, expected } => {
                Self::replace(&mut tx, record, *expected).await?
            }
        }

        let payload = serde_json::to_value(&event)
            .map_err(|e| EntityStoreError::Serialization(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO product_outbox (event_id, entity_id, envelope)
            VALUES ($1, $2, $3)
            RETURNING sequence
            "#,
        )
        .bind(event.event_id().as_uuid())
        .bind(event.entity_id().as_uuid())
        .bind(payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_outbox", e))?;

        let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(OutboxEntry {
            sequence: sequence as u64,
            envelope: event,
            published: false,
        })
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, EntityStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, envelope
            FROM product_outbox
            WHERE published_at IS NULL
            ORDER BY sequence ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pending_outbox", e))?;

        rows.iter()
            .map(|row| {
                let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;
                let Json(envelope): Json<ProductEnvelope> =
                    row.try_get("envelope").map_err(decode_error)?;
                Ok(OutboxEntry {
                    sequence: sequence as u64,
                    envelope,
                    published: false,
                })
            })
            .collect()
    }

    async fn mark_published(&self, event_id: EventId) -> Result<(), EntityStoreError> {
        sqlx::query(
            r#"
            UPDATE product_outbox
            SET published_at = NOW()
            WHERE event_id = $1 AND published_at IS NULL
            "#,
        )
        .bind(event_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?;
        Ok(())
    }

    async fn outbox_entry(&self, event_id: EventId) -> Result<Option<OutboxEntry>, EntityStoreError> {
        let row = sqlx::query(
            r#"
            SELECT sequence, envelope, published_at IS NOT NULL AS published
            FROM product_outbox
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_entry", e))?;

        row.map(|row| {
            let sequence: i64 = row.try_get("sequence").map_err(decode_error)?;
            let Json(envelope): Json<ProductEnvelope> = row.try_get("envelope").map_err(decode_error)?;
            let published: bool = row.try_get("published").map_err(decode_error)?;
            Ok(OutboxEntry {
                sequence: sequence as u64,
                envelope,
                published,
            })
        })
        .transpose()
    }
}

fn product_from_row(row: &PgRow) -> Result<Product, EntityStoreError> {
    let id: uuid::Uuid = row.try_get("id").map_err(decode_error)?;
    let version: i64 = row.try_get("version").map_err(decode_error)?;
    let snapshot = ProductSnapshot {
        id: ProductId::new(EntityId::from_uuid(id)),
        name: row.try_get("name").map_err(decode_error)?,
        description: row.try_get("description").map_err(decode_error)?,
        price: row.try_get("price").map_err(decode_error)?,
        stock: row.try_get("stock").map_err(decode_error)?,
    };
    let deleted: bool = row.try_get("deleted").map_err(decode_error)?;
    Ok(Product::restore(snapshot, version as u64, deleted))
}

fn decode_error(err: sqlx::Error) -> EntityStoreError {
    EntityStoreError::Serialization(format!("failed to decode row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EntityStoreError {
    if db::is_transient(&err) {
        EntityStoreError::Unavailable(format!("{operation}: {err}"))
    } else if db::is_unique_violation(&err) {
        EntityStoreError::Concurrency(format!("{operation}: {err}"))
    } else {
        EntityStoreError::Serialization(format!("{operation}: {err}"))
    }
}
