//! Infrastructure layer: stores, event channel backends, command/query
//! handlers, the projector, and configuration.

pub mod command_handler;
pub mod config;
pub mod db;
pub mod entity_store;
pub mod event_bus;
pub mod projections;
pub mod query_handler;
pub mod read_model;
pub mod retry;
pub mod workers;


pub use command_handler::{CommandError, CommandOutcome, ProductCommandHandler};
pub use config::{AppConfig, Backend, ConfigError, LogFormat};
pub use query_handler::{PageResult, ProductQueryHandler, QueryError};
pub use retry::RetryPolicy;
