//! Relay error types.

use thiserror::Error;

/// Error raised by a relay component.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] relay_store::StoreError),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// A per-message publish task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),
}

/// Result type alias using RelayError.
pub type RelayResult<T> = Result<T, RelayError>;

/// Why a single publish attempt did not reach the broker.
#[derive(Error, Debug)]
pub enum PublishError {
    /// Transport-level HTTP failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The broker answered but refused the message
    #[error("Broker rejected message: {0}")]
    Rejected(String),

    /// The message was accepted but no queue was bound to the routing key
    #[error("Message to {0} was not routed")]
    Unroutable(String),

    /// The publish did not finish within its timeout
    #[error("Publish timed out after {0}ms")]
    Timeout(u64),

    /// Publisher misconfiguration
    #[error("Publisher config error: {0}")]
    Config(String),
}
