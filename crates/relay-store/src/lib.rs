//! Persistence layer for the outbox relay.
//!
//! This crate provides:
//! - Model types for outbox messages, inbox records and units of work
//! - The store contracts the relay core consumes (`OutboxStore`,
//!   `InboxStore`, `UnitOfWorkStore`)
//! - `SqliteStore`: async SQLite implementation on a dedicated executor thread
//! - `InMemoryStore`: single-mutex implementation for tests and embedding
//!
//! # Claim semantics
//!
//! A message is claimable while it is PENDING or FAILED and its
//! `next_attempt_at` has elapsed. Claiming flips it to PROCESSING and stamps
//! `locked_by`/`locked_at` in one conditional write, so two relay instances
//! can never hold the same message at once.
//!
//! ```ignore
//! let store = SqliteStore::open(&path).await?;
//! let batch = store.claim_batch(50, "relay-a").await?;
//! ```

mod error;
mod memory;
mod migrations;
mod models;
mod queries;
mod sqlite;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use models::{
    Destination, ErrorClassification, InboxBegin, InboxMessage, InboxStatus, JobStatus,
    JobUpdate, MessageEnvelope, NewOutboxMessage, NewUnitOfWork, OutboxMessage, OutboxStatus,
    UnitOfWork,
};
pub use sqlite::SqliteStore;
pub use store::{InboxStore, OutboxStore, UnitOfWorkStore};
