//! Process configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

pub use catalog_observability::LogFormat;

use crate::retry::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("{0} must be set for the persistent backend")]
    Missing(&'static str),
}

/// Storage and transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// In-process stores and channel; state is lost on exit.
    Memory,
    /// Postgres stores plus Redis Streams channel.
    Persistent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub http_addr: SocketAddr,
    pub backend: Backend,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub partitions: u32,
    pub consumer_group: String,
    pub store_timeout: Duration,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backend: Backend::Memory,
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            partitions: 8,
            consumer_group: "products.read_model".to_string(),
            store_timeout: Duration::from_millis(2000),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(100),
            batch_size: 64,
            log_format: LogFormat::Json,
        }
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let http_addr = parse_or(&lookup, "CATALOG_HTTP_ADDR", defaults.http_addr)?;

        let backend = match lookup("CATALOG_BACKEND").as_deref().map(str::trim) {
            None | Some("") | Some("memory") => Backend::Memory,
            Some("persistent") => Backend::Persistent,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "CATALOG_BACKEND",
                    reason: format!("expected `memory` or `persistent`, got `{other}`"),
                });
            }
        };

        let database_url = lookup("DATABASE_URL").filter(|s| !s.trim().is_empty());
        if backend == Backend::Persistent && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let redis_url = lookup("REDIS_URL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.redis_url);

        let partitions: u32 = parse_or(&lookup, "CATALOG_PARTITIONS", defaults.partitions)?;
        if partitions == 0 {
            return Err(ConfigError::Invalid {
                var: "CATALOG_PARTITIONS",
                reason: "must be at least 1".to_string(),
            });
        }

        let consumer_group = lookup("CATALOG_CONSUMER_GROUP")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.consumer_group);

        let store_timeout = Duration::from_millis(parse_or(&lookup, "CATALOG_STORE_TIMEOUT_MS", 2000u64)?);

        let max_attempts: u32 = parse_or(&lookup, "CATALOG_RETRY_MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "CATALOG_RETRY_MAX_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        let retry = RetryPolicy::exponential(
            max_attempts,
            Duration::from_millis(parse_or(&lookup, "CATALOG_RETRY_BASE_DELAY_MS", 50u64)?),
            Duration::from_millis(parse_or(&lookup, "CATALOG_RETRY_MAX_DELAY_MS", 2000u64)?),
        );

        let poll_interval = Duration::from_millis(parse_or(&lookup, "CATALOG_POLL_INTERVAL_MS", 100u64)?);

        let batch_size: usize = parse_or(&lookup, "CATALOG_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "CATALOG_BATCH_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }

        let log_format = match lookup("CATALOG_LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "CATALOG_LOG_FORMAT",
                    reason: format!("expected `json` or `pretty`, got `{other}`"),
                });
            }
        };

        Ok(Self {
            http_addr,
            backend,
            database_url,
            redis_url,
            partitions,
            consumer_group,
            store_timeout,
            retry,
            poll_interval,
            batch_size,
            log_format,
        })
    }
}

fn parse_or<T, F>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
    }
}
