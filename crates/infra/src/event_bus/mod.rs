//! Infrastructure event channel implementations.
//!
//! The channel abstraction lives in `catalog-events` as pure mechanics. This
//! module provides the Redis-backed implementation and the retry glue.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsEventChannel;

use std::time::Duration;

use catalog_events::ChannelError;

use crate::retry::TransientError;

impl TransientError for ChannelError {
    fn is_transient(&self) -> bool {
        ChannelError::is_transient(self)
    }

    fn timed_out(after: Duration) -> Self {
        ChannelError::Unavailable(format!("timed out after {}ms", after.as_millis()))
    }
}
