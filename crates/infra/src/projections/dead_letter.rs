//! Parking lot for events a projector could not apply.
//!
//! Parked events no longer block their partition. Operators inspect them with
//! `list` and hand them back to the projection with `take` +
//! `ProductProjection::replay_dead_letter`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use catalog_products::ProductEnvelope;

use crate::db;
use crate::retry::TransientError;

/// What was parked.
#[derive(Debug, Clone, PartialEq)]
pub enum ParkedBody {
    /// A decoded event the projection could not apply.
    Event(ProductEnvelope),
    /// Stored body of a channel entry that did not decode.
    Undecodable(String),
}

impl ParkedBody {
    pub fn envelope(&self) -> Option<&ProductEnvelope> {
        match self {
            ParkedBody::Event(envelope) => Some(envelope),
            ParkedBody::Undecodable(_) => None,
        }
    }

    /// The envelope, decoding a raw body again if needed.
    pub fn decode(&self) -> Result<ProductEnvelope, serde_json::Error> {
        match self {
            ParkedBody::Event(envelope) => Ok(envelope.clone()),
            ParkedBody::Undecodable(raw) => serde_json::from_str(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: Uuid,
    pub consumer_group: String,
    pub partition: u32,
    pub offset: u64,
    pub body: ParkedBody,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        consumer_group: impl Into<String>,
        partition: u32,
        offset: u64,
        envelope: ProductEnvelope,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            consumer_group: consumer_group.into(),
            partition,
            offset,
            body: ParkedBody::Event(envelope),
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    /// Park a channel entry that could not be decoded.
    pub fn undecodable(
        consumer_group: impl Into<String>,
        partition: u32,
        offset: u64,
        raw: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            consumer_group: consumer_group.into(),
            partition,
            offset,
            body: ParkedBody::Undecodable(raw.into()),
            reason: reason.into(),
            attempts: 1,
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    #[error("dead letter store unavailable: {0}")]
    Unavailable(String),

    #[error("dead letter store error: {0}")]
    Storage(String),
}

impl TransientError for DeadLetterError {
    fn is_transient(&self) -> bool {
        matches!(self, DeadLetterError::Unavailable(_))
    }

    fn timed_out(after: Duration) -> Self {
        DeadLetterError::Unavailable(format!("timed out after {}ms", after.as_millis()))
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn park(&self, entry: DeadLetter) -> Result<(), DeadLetterError>;

    /// Oldest first.
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError>;

    /// Remove and return an entry for manual replay.
    async fn take(&self, id: Uuid) -> Result<Option<DeadLetter>, DeadLetterError>;
}

#[async_trait]
impl<S> DeadLetterStore for Arc<S>
where
    S: DeadLetterStore + ?Sized,
{
    async fn park(&self, entry: DeadLetter) -> Result<(), DeadLetterError> {
        (**self).park(entry).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        (**self).list(limit).await
    }

    async fn take(&self, id: Uuid) -> Result<Option<DeadLetter>, DeadLetterError> {
        (**self).take(id).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> DeadLetterError {
    DeadLetterError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn park(&self, entry: DeadLetter) -> Result<(), DeadLetterError> {
        self.entries.write().map_err(|_| poisoned())?.push(entry);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.iter().take(limit).cloned().collect())
    }

    async fn take(&self, id: Uuid) -> Result<Option<DeadLetter>, DeadLetterError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(entries
            .iter()
            .position(|e| e.id == id)
            .map(|idx| entries.remove(idx)))
    }
}

/// Postgres-backed dead letters (`projection_dead_letters` table).
#[derive(Debug, Clone)]
pub struct PostgresDeadLetterStore {
    pool: Arc<PgPool>,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DeadLetterError {
    if db::is_transient(&err) {
        DeadLetterError::Unavailable(format!("{operation}: {err}"))
    } else {
        DeadLetterError::Storage(format!("{operation}: {err}"))
    }
}

fn dead_letter_from_row(row: &sqlx::postgres::PgRow) -> Result<DeadLetter, DeadLetterError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_dead_letter", e);
    let envelope: Option<Json<ProductEnvelope>> = row.try_get("envelope").map_err(decode)?;
    let raw: Option<String> = row.try_get("raw_body").map_err(decode)?;
    let body = match envelope {
        Some(Json(envelope)) => ParkedBody::Event(envelope),
        None => ParkedBody::Undecodable(raw.unwrap_or_default()),
    };
    Ok(DeadLetter {
        id: row.try_get("id").map_err(decode)?,
        consumer_group: row.try_get("consumer_group").map_err(decode)?,
        partition: row.try_get::<i32, _>("partition").map_err(decode)? as u32,
        offset: row.try_get::<i64, _>("channel_offset").map_err(decode)? as u64,
        body,
        reason: row.try_get("reason").map_err(decode)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(decode)? as u32,
        failed_at: row.try_get("failed_at").map_err(decode)?,
    })
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn park(&self, entry: DeadLetter) -> Result<(), DeadLetterError> {
        let (envelope, raw) = match &entry.body {
            ParkedBody::Event(envelope) => {
                let value = serde_json::to_value(envelope).map_err(|e| DeadLetterError::Storage(e.to_string()))?;
                (Some(value), None)
            }
            ParkedBody::Undecodable(raw) => (None, Some(raw.as_str())),
        };

        sqlx::query(
            r#"
            INSERT INTO projection_dead_letters (
                id, consumer_group, partition, channel_offset, envelope, raw_body, reason, attempts, failed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(&entry.consumer_group)
        .bind(entry.partition as i32)
        .bind(entry.offset as i64)
        .bind(envelope)
        .bind(raw)
        .bind(&entry.reason)
        .bind(entry.attempts as i32)
        .bind(entry.failed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("park", e))?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let rows = sqlx::query(
            r#"
            SELECT id, consumer_group, partition, channel_offset, envelope, raw_body, reason, attempts, failed_at
            FROM projection_dead_letters
            ORDER BY failed_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn take(&self, id: Uuid) -> Result<Option<DeadLetter>, DeadLetterError> {
        let row = sqlx::query(
            r#"
            DELETE FROM projection_dead_letters
            WHERE id = $1
            RETURNING id, consumer_group, partition, channel_offset, envelope, raw_body, reason, attempts, failed_at
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("take_dead_letter", e))?;

        row.as_ref().map(dead_letter_from_row).transpose()
    }
}
