//! In-memory store.
//!
//! Every operation takes the same mutex, which gives `claim_batch` the
//! same exclusivity the SQLite conditional UPDATE provides. Intended for
//! tests and for embedding the relay without a database file.

use crate::store::{InboxStore, OutboxStore, UnitOfWorkStore};
use crate::{
    InboxBegin, InboxMessage, InboxStatus, JobUpdate, NewOutboxMessage, NewUnitOfWork,
    OutboxMessage, OutboxStatus, StoreError, StoreResult, UnitOfWork,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    outbox: HashMap<String, OutboxMessage>,
    inbox: HashMap<(String, String), InboxMessage>,
    jobs: HashMap<String, UnitOfWork>,
}

/// Mutex-guarded store implementing all three contracts.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Connection("in-memory store lock poisoned".to_string()))
    }

    /// Insert or replace an outbox row as-is.
    pub fn put_outbox_message(&self, message: OutboxMessage) -> StoreResult<()> {
        self.lock()?.outbox.insert(message.id.clone(), message);
        Ok(())
    }

    /// Insert or replace an inbox row as-is.
    pub fn put_inbox_message(&self, record: InboxMessage) -> StoreResult<()> {
        let key = (record.message_id.clone(), record.consumer_id.clone());
        self.lock()?.inbox.insert(key, record);
        Ok(())
    }

    /// All outbox rows, ordered by id.
    pub fn outbox_snapshot(&self) -> StoreResult<Vec<OutboxMessage>> {
        let mut rows: Vec<_> = self.lock()?.outbox.values().cloned().collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    /// All inbox rows, ordered by (consumer, message).
    pub fn inbox_snapshot(&self) -> StoreResult<Vec<InboxMessage>> {
        let mut rows: Vec<_> = self.lock()?.inbox.values().cloned().collect();
        rows.sort_by(|a, b| {
            (&a.consumer_id, &a.message_id).cmp(&(&b.consumer_id, &b.message_id))
        });
        Ok(rows)
    }

    /// Apply `f` to an outbox row still leased to `instance_id`.
    fn with_leased_outbox<F>(&self, id: &str, instance_id: &str, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut OutboxMessage),
    {
        let mut state = self.lock()?;
        match state.outbox.get_mut(id) {
            Some(msg)
                if msg.status == OutboxStatus::Processing
                    && msg.locked_by.as_deref() == Some(instance_id) =>
            {
                f(msg);
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!(
                "Outbox message '{id}' is not leased to '{instance_id}'"
            ))),
        }
    }

    fn with_processing_inbox<F>(
        &self,
        message_id: &str,
        consumer_id: &str,
        f: F,
    ) -> StoreResult<()>
    where
        F: FnOnce(&mut InboxMessage),
    {
        let mut state = self.lock()?;
        let key = (message_id.to_string(), consumer_id.to_string());
        match state.inbox.get_mut(&key) {
            Some(record) if record.status == InboxStatus::Processing => {
                f(record);
                Ok(())
            }
            _ => Err(StoreError::NotFound(format!(
                "Inbox record '{message_id}/{consumer_id}' is not processing"
            ))),
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> StoreResult<OutboxMessage> {
        let now = Utc::now();
        let row = OutboxMessage {
            id: message.id,
            destination: message.destination,
            payload: message.payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: message.available_at.unwrap_or(now),
            locked_by: None,
            locked_at: None,
            created_at: now,
            processed_at: None,
        };
        let mut state = self.lock()?;
        if state.outbox.contains_key(&row.id) {
            return Err(StoreError::InvalidData(format!(
                "Outbox message '{}' already exists",
                row.id
            )));
        }
        state.outbox.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<OutboxMessage>> {
        Ok(self.lock()?.outbox.get(id).cloned())
    }

    async fn claim_batch(
        &self,
        limit: usize,
        instance_id: &str,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let now = Utc::now();
        let mut state = self.lock()?;

        let mut due: Vec<&mut OutboxMessage> = state
            .outbox
            .values_mut()
            .filter(|m| m.status.is_claimable() && m.next_attempt_at <= now)
            .collect();
        due.sort_by(|a, b| {
            a.next_attempt_at
                .cmp(&b.next_attempt_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let claimed = due
            .into_iter()
            .take(limit)
            .map(|msg| {
                msg.status = OutboxStatus::Processing;
                msg.locked_by = Some(instance_id.to_string());
                msg.locked_at = Some(now);
                msg.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn mark_as_sent(&self, id: &str, instance_id: &str) -> StoreResult<()> {
        let now = Utc::now();
        self.with_leased_outbox(id, instance_id, |msg| {
            msg.status = OutboxStatus::Sent;
            msg.processed_at = Some(now);
            msg.locked_by = None;
            msg.locked_at = None;
        })
    }

    async fn mark_as_failed(
        &self,
        id: &str,
        instance_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.with_leased_outbox(id, instance_id, |msg| {
            msg.status = OutboxStatus::Failed;
            msg.attempts += 1;
            msg.last_error = Some(error.to_string());
            msg.next_attempt_at = next_attempt_at;
            msg.locked_by = None;
            msg.locked_at = None;
        })
    }

    async fn mark_as_permanently_failed(
        &self,
        id: &str,
        instance_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        let now = Utc::now();
        self.with_leased_outbox(id, instance_id, |msg| {
            msg.status = OutboxStatus::PermanentlyFailed;
            msg.attempts += 1;
            msg.last_error = Some(error.to_string());
            msg.processed_at = Some(now);
            msg.locked_by = None;
            msg.locked_at = None;
        })
    }

    async fn reclaim_stale_messages(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let mut reclaimed = 0;
        for msg in state.outbox.values_mut() {
            let stale = msg.status == OutboxStatus::Processing
                && msg.locked_at.is_some_and(|at| at < older_than);
            if stale {
                msg.status = OutboxStatus::Pending;
                msg.next_attempt_at = now;
                msg.locked_by = None;
                msg.locked_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn delete_processed_older_than(&self, threshold: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let before = state.outbox.len();
        state.outbox.retain(|_, msg| {
            !(msg.status.is_terminal() && msg.processed_at.is_some_and(|at| at < threshold))
        });
        Ok((before - state.outbox.len()) as u64)
    }
}

#[async_trait]
impl InboxStore for InMemoryStore {
    async fn begin(&self, message_id: &str, consumer_id: &str) -> StoreResult<InboxBegin> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let key = (message_id.to_string(), consumer_id.to_string());
        if let Some(record) = state.inbox.get_mut(&key) {
            return match record.status {
                InboxStatus::Processed => Ok(InboxBegin::AlreadyProcessed),
                InboxStatus::Processing => Ok(InboxBegin::InProgress),
                InboxStatus::Pending | InboxStatus::Failed => {
                    record.status = InboxStatus::Processing;
                    record.locked_at = Some(now);
                    record.processed_at = None;
                    Ok(InboxBegin::Started)
                }
            };
        }

        state.inbox.insert(
            key,
            InboxMessage {
                message_id: message_id.to_string(),
                consumer_id: consumer_id.to_string(),
                status: InboxStatus::Processing,
                locked_at: Some(now),
                last_error: None,
                created_at: now,
                processed_at: None,
            },
        );
        Ok(InboxBegin::Started)
    }

    async fn mark_processed(&self, message_id: &str, consumer_id: &str) -> StoreResult<()> {
        let now = Utc::now();
        self.with_processing_inbox(message_id, consumer_id, |record| {
            record.status = InboxStatus::Processed;
            record.processed_at = Some(now);
            record.locked_at = None;
        })
    }

    async fn mark_failed(
        &self,
        message_id: &str,
        consumer_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        let now = Utc::now();
        self.with_processing_inbox(message_id, consumer_id, |record| {
            record.status = InboxStatus::Failed;
            record.last_error = Some(error.to_string());
            record.processed_at = Some(now);
            record.locked_at = None;
        })
    }

    async fn get_record(
        &self,
        message_id: &str,
        consumer_id: &str,
    ) -> StoreResult<Option<InboxMessage>> {
        let key = (message_id.to_string(), consumer_id.to_string());
        Ok(self.lock()?.inbox.get(&key).cloned())
    }

    async fn processing_consumers(&self) -> StoreResult<Vec<String>> {
        let consumers: BTreeSet<String> = self
            .lock()?
            .inbox
            .values()
            .filter(|r| r.status == InboxStatus::Processing)
            .map(|r| r.consumer_id.clone())
            .collect();
        Ok(consumers.into_iter().collect())
    }

    async fn reclaim_stale_messages_by_consumer(
        &self,
        consumer_id: &str,
        older_than: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let mut reclaimed = 0;
        for record in state.inbox.values_mut() {
            let stale = record.consumer_id == consumer_id
                && record.status == InboxStatus::Processing
                && record.locked_at.is_some_and(|at| at < older_than);
            if stale {
                record.status = InboxStatus::Pending;
                record.locked_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn delete_processed_older_than(&self, threshold: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let before = state.inbox.len();
        state.inbox.retain(|_, record| {
            !(record.status.is_terminal() && record.processed_at.is_some_and(|at| at < threshold))
        });
        Ok((before - state.inbox.len()) as u64)
    }
}

#[async_trait]
impl UnitOfWorkStore for InMemoryStore {
    async fn insert(&self, job: NewUnitOfWork) -> StoreResult<UnitOfWork> {
        let now = Utc::now();
        let row = UnitOfWork {
            id: job.id,
            status: job.status,
            error_classification: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.lock()?.jobs.insert(row.id.clone(), row.clone());
        Ok(row)
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<UnitOfWork>> {
        Ok(self.lock()?.jobs.get(job_id).cloned())
    }

    async fn update(&self, job_id: &str, update: JobUpdate) -> StoreResult<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(format!("Unit of work '{job_id}'")))?;
        job.status = update.status;
        job.error_classification = update.error_classification;
        job.last_error = update.last_error;
        job.updated_at = Utc::now();
        Ok(())
    }
}
