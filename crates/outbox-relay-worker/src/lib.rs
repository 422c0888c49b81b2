//! Reliable outbox relay.
//!
//! This crate provides:
//! - OutboxRelay: claims due outbox messages and publishes them with retry
//!   and backoff, escalating exhausted messages to their unit of work
//! - OutboxReaper / InboxReaper: return stale leases to PENDING
//! - RetentionSweeper: deletes terminal records past the retention window
//! - RelayManager: runs all of the above against one store until shutdown
//!
//! Delivery is at-least-once and unordered. The only exclusivity guarantee
//! is per message id, enforced by the store's atomic claim.

pub mod backoff;
pub mod error;
pub mod events;
pub mod inbox_reaper;
pub mod interval;
pub mod manager;
pub mod outbox_reaper;
pub mod publisher;
pub mod relay;
pub mod retention;
pub mod schedule;

#[cfg(test)]
mod tests;

pub use backoff::BackoffPolicy;
pub use error::{PublishError, RelayError, RelayResult};
pub use events::{NullSink, RecordingSink, RelayEvent, RelayEventSink, TracingSink};
pub use inbox_reaper::{InboxReapReport, InboxReaper, InboxTimeoutPolicy};
pub use interval::AdaptiveInterval;
pub use manager::RelayManager;
pub use outbox_reaper::OutboxReaper;
pub use publisher::{BrokerPublisher, HttpBrokerPublisher, LogPublisher, PublishOptions};
pub use relay::{CycleReport, OutboxRelay, RelaySettings};
pub use retention::{RetentionReport, RetentionSweeper};
