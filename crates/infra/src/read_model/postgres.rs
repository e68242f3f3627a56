//! Postgres-backed read store (`product_read_model` table).
//!
//! The version gate is enforced by the upsert itself:
//! `ON CONFLICT (id) DO UPDATE ... WHERE last_applied_version < EXCLUDED.last_applied_version`.
//! Zero affected rows means the change was stale.
//!
//! Names sort with `COLLATE "C"` (byte order) so listings match the
//! in-memory store regardless of the database locale.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use catalog_core::EntityId;
use catalog_events::ApplyOutcome;
use catalog_products::{ProductId, ProductSnapshot};

use super::{clamp_limit, Page, ReadChange, ReadRecord, ReadStore, ReadStoreError};
use crate::db;

#[derive(Debug, Clone)]
pub struct PostgresReadStore {
    pool: Arc<PgPool>,
}

impl PostgresReadStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl ReadStore for PostgresReadStore {
    async fn get(&self, id: ProductId) -> Result<Option<ReadRecord>, ReadStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, price, stock, last_applied_version
            FROM product_read_model
            WHERE id = $1 AND NOT deleted
            "#,
        )
        .bind(id.0.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    async fn applied_version(&self, id: ProductId) -> Result<Option<u64>, ReadStoreError> {
        let row = sqlx::query("SELECT last_applied_version FROM product_read_model WHERE id = $1")
            .bind(id.0.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("applied_version", e))?;

        row.map(|r| {
            r.try_get::<i64, _>("last_applied_version")
                .map(|v| v as u64)
                .map_err(decode_error)
        })
        .transpose()
    }

    #[instrument(skip(self, change), fields(entity_id = %change.snapshot.id, version = change.version), err)]
    async fn apply(&self, change: ReadChange) -> Result<ApplyOutcome, ReadStoreError> {
        let s = &change.snapshot;
        let result = sqlx::query(
            r#"
            INSERT INTO product_read_model (
                id, name, description, price, stock, last_applied_version, deleted
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                price = EXCLUDED.price,
                stock = EXCLUDED.stock,
                last_applied_version = EXCLUDED.last_applied_version,
                deleted = EXCLUDED.deleted,
                updated_at = NOW()
            WHERE product_read_model.last_applied_version < EXCLUDED.last_applied_version
            "#,
        )
        .bind(s.id.0.as_uuid())
        .bind(&s.name)
        .bind(s.description.as_deref())
        .bind(s.price)
        .bind(s.stock)
        .bind(change.version as i64)
        .bind(change.deleted)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("apply", e))?;

        if result.rows_affected() > 0 {
            return Ok(ApplyOutcome::Applied);
        }

        let current = self.applied_version(s.id).await?.unwrap_or(change.version);
        Ok(ApplyOutcome::Stale { current })
    }

    async fn list_all(&self) -> Result<Vec<ReadRecord>, ReadStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, description, price, stock, last_applied_version
            FROM product_read_model
            WHERE NOT deleted
            ORDER BY name COLLATE "C" ASC, id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_all", e))?;

        rows.iter().map(record_from_row).collect()
    }

    async fn list_page(&self, limit: u32, offset: u64) -> Result<Page, ReadStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM product_read_model WHERE NOT deleted")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("count", e))?
            .try_get("total")
            .map_err(decode_error)?;

        let rows = sqlx::query(
            r#"
            SELECT id, name, description, price, stock, last_applied_version
            FROM product_read_model
            WHERE NOT deleted
            ORDER BY name COLLATE "C" ASC, id ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::from(clamp_limit(limit)))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("list_page", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        Ok(Page {
            items: rows.iter().map(record_from_row).collect::<Result<_, _>>()?,
            total: total as u64,
        })
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        sqlx::query("TRUNCATE product_read_model")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear", e))?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<ReadRecord, ReadStoreError> {
    let id: uuid::Uuid = row.try_get("id").map_err(decode_error)?;
    let version: i64 = row.try_get("last_applied_version").map_err(decode_error)?;
    Ok(ReadRecord {
        product: ProductSnapshot {
            id: ProductId::new(EntityId::from_uuid(id)),
            name: row.try_get("name").map_err(decode_error)?,
            description: row.try_get("description").map_err(decode_error)?,
            price: row.try_get("price").map_err(decode_error)?,
            stock: row.try_get("stock").map_err(decode_error)?,
        },
        last_applied_version: version as u64,
    })
}

fn decode_error(err: sqlx::Error) -> ReadStoreError {
    ReadStoreError::Serialization(format!("failed to decode row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ReadStoreError {
    if db::is_transient(&err) {
        ReadStoreError::Unavailable(format!("{operation}: {err}"))
    } else {
        ReadStoreError::Serialization(format!("{operation}: {err}"))
    }
}
