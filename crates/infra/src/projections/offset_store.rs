//! Consumer offset persistence.
//!
//! One cursor per `(consumer group, partition)`: the next offset to read.
//! Offsets are committed only after the delivery at `next_offset - 1` has
//! been applied (or parked), so a crash re-delivers at most the in-flight
//! event. Commits are monotonic; an older offset never overwrites a newer one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;

use crate::db;
use crate::retry::TransientError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OffsetStoreError {
    #[error("offset store unavailable: {0}")]
    Unavailable(String),

    #[error("offset store error: {0}")]
    Storage(String),
}

impl TransientError for OffsetStoreError {
    fn is_transient(&self) -> bool {
        matches!(self, OffsetStoreError::Unavailable(_))
    }

    fn timed_out(after: Duration) -> Self {
        OffsetStoreError::Unavailable(format!("timed out after {}ms", after.as_millis()))
    }
}

#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Next offset to read, or `None` if the group never committed.
    async fn load(&self, group: &str, partition: u32) -> Result<Option<u64>, OffsetStoreError>;

    async fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), OffsetStoreError>;

    /// Forget every cursor of `group` (rebuild from offset 0).
    async fn reset(&self, group: &str) -> Result<(), OffsetStoreError>;
}

#[async_trait]
impl<S> OffsetStore for Arc<S>
where
    S: OffsetStore + ?Sized,
{
    async fn load(&self, group: &str, partition: u32) -> Result<Option<u64>, OffsetStoreError> {
        (**self).load(group, partition).await
    }

    async fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), OffsetStoreError> {
        (**self).commit(group, partition, next_offset).await
    }

    async fn reset(&self, group: &str) -> Result<(), OffsetStoreError> {
        (**self).reset(group).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOffsetStore {
    offsets: RwLock<HashMap<(String, u32), u64>>,
}

impl InMemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> OffsetStoreError {
    OffsetStoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn load(&self, group: &str, partition: u32) -> Result<Option<u64>, OffsetStoreError> {
        let offsets = self.offsets.read().map_err(|_| poisoned())?;
        Ok(offsets.get(&(group.to_string(), partition)).copied())
    }

    async fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), OffsetStoreError> {
        let mut offsets = self.offsets.write().map_err(|_| poisoned())?;
        let slot = offsets.entry((group.to_string(), partition)).or_insert(next_offset);
        *slot = (*slot).max(next_offset);
        Ok(())
    }

    async fn reset(&self, group: &str) -> Result<(), OffsetStoreError> {
        let mut offsets = self.offsets.write().map_err(|_| poisoned())?;
        offsets.retain(|(g, _), _| g != group);
        Ok(())
    }
}

/// Postgres-backed offset store (`projection_offsets` table).
#[derive(Debug, Clone)]
pub struct PostgresOffsetStore {
    pool: Arc<PgPool>,
}

impl PostgresOffsetStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OffsetStoreError {
    if db::is_transient(&err) {
        OffsetStoreError::Unavailable(format!("{operation}: {err}"))
    } else {
        OffsetStoreError::Storage(format!("{operation}: {err}"))
    }
}

#[async_trait]
impl OffsetStore for PostgresOffsetStore {
    async fn load(&self, group: &str, partition: u32) -> Result<Option<u64>, OffsetStoreError> {
        let row = sqlx::query(
            r#"
            SELECT next_offset
            FROM projection_offsets
            WHERE consumer_group = $1 AND partition = $2
            "#,
        )
        .bind(group)
        .bind(partition as i32)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_offset", e))?;

        match row {
            Some(row) => {
                let offset: i64 = row
                    .try_get("next_offset")
                    .map_err(|e| map_sqlx_error("decode_offset", e))?;
                Ok(Some(offset as u64))
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, group: &str, partition: u32, next_offset: u64) -> Result<(), OffsetStoreError> {
        sqlx::query(
            r#"
            INSERT INTO projection_offsets (consumer_group, partition, next_offset)
            VALUES ($1, $2, $3)
            ON CONFLICT (consumer_group, partition)
            DO UPDATE SET
                next_offset = GREATEST(projection_offsets.next_offset, EXCLUDED.next_offset),
                updated_at = NOW()
            "#,
        )
        .bind(group)
        .bind(partition as i32)
        .bind(next_offset as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("commit_offset", e))?;
        Ok(())
    }

    async fn reset(&self, group: &str) -> Result<(), OffsetStoreError> {
        sqlx::query("DELETE FROM projection_offsets WHERE consumer_group = $1")
            .bind(group)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset_offsets", e))?;
        Ok(())
    }
}
