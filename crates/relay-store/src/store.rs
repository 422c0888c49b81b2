//! Store contracts consumed by the relay core.
//!
//! Implementations must make `claim_batch` atomic with respect to other
//! callers: a message claimed by one instance is invisible to every other
//! claim until it leaves PROCESSING.

use crate::{
    InboxBegin, InboxMessage, JobUpdate, NewOutboxMessage, NewUnitOfWork, OutboxMessage,
    StoreResult, UnitOfWork,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable outbox of messages awaiting publication.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new PENDING message.
    async fn enqueue(&self, message: NewOutboxMessage) -> StoreResult<OutboxMessage>;

    /// Fetch a message by id.
    async fn get_message(&self, id: &str) -> StoreResult<Option<OutboxMessage>>;

    /// Atomically claim up to `limit` due messages for `instance_id`.
    ///
    /// Claimed rows move to PROCESSING with `locked_by`/`locked_at` set,
    /// oldest `next_attempt_at` first.
    async fn claim_batch(&self, limit: usize, instance_id: &str)
        -> StoreResult<Vec<OutboxMessage>>;

    /// Move a message leased to `instance_id` to SENT.
    ///
    /// The three outcome writes only apply while the row is PROCESSING and
    /// `locked_by == instance_id`; otherwise they return `NotFound` and
    /// change nothing.
    async fn mark_as_sent(&self, id: &str, instance_id: &str) -> StoreResult<()>;

    /// Record a failed attempt and schedule the next one.
    async fn mark_as_failed(
        &self,
        id: &str,
        instance_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Record the final failed attempt; the message is never retried.
    async fn mark_as_permanently_failed(
        &self,
        id: &str,
        instance_id: &str,
        error: &str,
    ) -> StoreResult<()>;

    /// Return PROCESSING messages locked before `older_than` to PENDING.
    async fn reclaim_stale_messages(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    /// Delete SENT/PERMANENTLY_FAILED messages processed before `threshold`.
    ///
    /// Both stores name this operation the same way; on a type implementing
    /// both, call it as `OutboxStore::delete_processed_older_than(&store, ..)`.
    async fn delete_processed_older_than(&self, threshold: DateTime<Utc>) -> StoreResult<u64>;
}

/// Per-consumer idempotency records for received messages.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Try to start processing `message_id` for `consumer_id`.
    ///
    /// A new or previously FAILED/PENDING record moves to PROCESSING and
    /// yields [`InboxBegin::Started`].
    async fn begin(&self, message_id: &str, consumer_id: &str) -> StoreResult<InboxBegin>;

    async fn mark_processed(&self, message_id: &str, consumer_id: &str) -> StoreResult<()>;

    async fn mark_failed(&self, message_id: &str, consumer_id: &str, error: &str)
        -> StoreResult<()>;

    async fn get_record(&self, message_id: &str, consumer_id: &str)
        -> StoreResult<Option<InboxMessage>>;

    /// Distinct consumer ids that currently hold PROCESSING records.
    async fn processing_consumers(&self) -> StoreResult<Vec<String>>;

    /// Return `consumer_id`'s PROCESSING records locked before `older_than`
    /// to PENDING. Other consumers' records are untouched.
    async fn reclaim_stale_messages_by_consumer(
        &self,
        consumer_id: &str,
        older_than: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Delete terminal (PROCESSED or FAILED) records processed before `threshold`.
    async fn delete_processed_older_than(&self, threshold: DateTime<Utc>) -> StoreResult<u64>;
}

/// Jobs that originate outbox messages.
#[async_trait]
pub trait UnitOfWorkStore: Send + Sync {
    async fn insert(&self, job: NewUnitOfWork) -> StoreResult<UnitOfWork>;

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<UnitOfWork>>;

    /// Apply a status change. Errors with `NotFound` for unknown jobs.
    async fn update(&self, job_id: &str, update: JobUpdate) -> StoreResult<()>;
}
