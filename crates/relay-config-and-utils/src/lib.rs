//! Core types, configuration, and utilities for the outbox relay.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{parse_consumer_timeouts, RelayConfig, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level, LogFormat};
pub use paths::Paths;
