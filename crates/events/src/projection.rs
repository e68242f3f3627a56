use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::EventEnvelope;

/// Result of offering one event to a projection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The read model now reflects this event.
    Applied,
    /// The read model was already at `current >= event.version`; nothing changed.
    Stale { current: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    /// Read store failure (I/O, timeout). Worth retrying.
    #[error("transient projection failure: {0}")]
    Transient(String),

    /// The event itself cannot be applied (bad payload, unsupported schema).
    /// Retrying will not help.
    #[error("event rejected: {0}")]
    Rejected(String),
}

impl ProjectionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProjectionError::Transient(_))
    }
}

/// A projection builds a read model from the event channel.
///
/// ## Idempotency
///
/// `apply` must be idempotent and order-tolerant within the channel's
/// per-entity ordering guarantee: redelivering an event, or delivering an
/// older version after a newer one, must leave the read model unchanged and
/// return [`ApplyOutcome::Stale`].
///
/// ## Disposability
///
/// Read models can be cleared and rebuilt by replaying the log from offset 0.
#[async_trait]
pub trait Projection<P>: Send + Sync
where
    P: Send + Sync + 'static,
{
    /// Stable name; used as the consumer group for offset tracking.
    fn name(&self) -> &str;

    /// Apply a single event to the read model.
    async fn apply(&self, envelope: &EventEnvelope<P>) -> Result<ApplyOutcome, ProjectionError>;
}

#[async_trait]
impl<P, T> Projection<P> for Arc<T>
where
    T: Projection<P> + ?Sized,
    P: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn apply(&self, envelope: &EventEnvelope<P>) -> Result<ApplyOutcome, ProjectionError> {
        (**self).apply(envelope).await
    }
}
