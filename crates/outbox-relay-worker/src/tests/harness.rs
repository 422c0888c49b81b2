//! Test harness for relay integration tests.
//!
//! Provides:
//! - ScriptedPublisher: per-message publish behavior, records every call,
//!   optionally hands the lease to another instance mid-publish
//! - FailingUnitOfWorkStore: escalation target that always errors
//! - FlakyInboxStore: inbox whose reclaim fails for chosen consumers, or
//!   whose consumer listing fails
//! - GatedStore: outbox with gated or failing retention deletes and claims
//! - Fixtures for outbox and inbox rows at arbitrary ages

use crate::events::RecordingSink;
use crate::publisher::{BrokerPublisher, PublishOptions};
use crate::relay::{OutboxRelay, RelaySettings};
use crate::{BackoffPolicy, PublishError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_store::{
    Destination, InMemoryStore, InboxBegin, InboxMessage, InboxStatus, InboxStore, JobStatus,
    JobUpdate, MessageEnvelope, NewOutboxMessage, NewUnitOfWork, OutboxMessage, OutboxStatus,
    OutboxStore, StoreError, StoreResult, UnitOfWork, UnitOfWorkStore,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// =============================================================================
// Publisher
// =============================================================================

/// What the scripted publisher does for a message.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Behavior {
    Succeed,
    Fail(String),
    /// Never completes; the relay's timeout must fire.
    Hang,
    Panic,
}

/// A publish call as seen by the broker.
#[derive(Debug, Clone)]
pub struct PublishedCall {
    pub destination: Destination,
    pub options: PublishOptions,
}

pub struct ScriptedPublisher {
    script: Mutex<HashMap<String, Behavior>>,
    default: Mutex<Behavior>,
    calls: Mutex<Vec<PublishedCall>>,
    takeover: Mutex<Option<(Arc<InMemoryStore>, String)>>,
}

impl ScriptedPublisher {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            default: Mutex::new(Behavior::Succeed),
            calls: Mutex::new(Vec::new()),
            takeover: Mutex::new(None),
        }
    }

    /// While each publish is in flight, reclaim every lease in `store` and
    /// let `instance_id` claim the messages, as a reaper plus a second relay
    /// would after this instance stalled.
    pub fn hand_lease_to(&self, store: Arc<InMemoryStore>, instance_id: &str) {
        *self.takeover.lock().unwrap() = Some((store, instance_id.to_string()));
    }

    pub fn set_default(&self, behavior: Behavior) {
        *self.default.lock().unwrap() = behavior;
    }

    pub fn script(&self, message_id: &str, behavior: Behavior) {
        self.script
            .lock()
            .unwrap()
            .insert(message_id.to_string(), behavior);
    }

    pub fn calls(&self) -> Vec<PublishedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn published_ids(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| c.options.message_id)
            .collect()
    }
}

#[async_trait]
impl BrokerPublisher for ScriptedPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        _payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), PublishError> {
        self.calls.lock().unwrap().push(PublishedCall {
            destination: destination.clone(),
            options: options.clone(),
        });

        let behavior = self
            .script
            .lock()
            .unwrap()
            .get(&options.message_id)
            .cloned()
            .unwrap_or_else(|| self.default.lock().unwrap().clone());

        let takeover = self.takeover.lock().unwrap().clone();
        if let Some((store, instance_id)) = takeover {
            store
                .reclaim_stale_messages(Utc::now() + chrono::Duration::seconds(1))
                .await
                .unwrap();
            store.claim_batch(usize::MAX, &instance_id).await.unwrap();
        }

        match behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail(reason) => Err(PublishError::Rejected(reason)),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Behavior::Panic => panic!("scripted publisher panic for {}", options.message_id),
        }
    }
}

// =============================================================================
// Store wrappers
// =============================================================================

/// Unit-of-work store whose writes always fail.
pub struct FailingUnitOfWorkStore;

#[async_trait]
impl UnitOfWorkStore for FailingUnitOfWorkStore {
    async fn insert(&self, _job: NewUnitOfWork) -> StoreResult<UnitOfWork> {
        Err(StoreError::Connection("unit-of-work store offline".to_string()))
    }

    async fn get_job(&self, _job_id: &str) -> StoreResult<Option<UnitOfWork>> {
        Ok(None)
    }

    async fn update(&self, _job_id: &str, _update: JobUpdate) -> StoreResult<()> {
        Err(StoreError::Connection("unit-of-work store offline".to_string()))
    }
}

/// Inbox store that fails reclaim for the listed consumers.
pub struct FlakyInboxStore {
    pub inner: Arc<InMemoryStore>,
    pub broken: HashSet<String>,
    /// `processing_consumers` errors.
    pub fail_listing: bool,
}

#[async_trait]
impl InboxStore for FlakyInboxStore {
    async fn begin(&self, message_id: &str, consumer_id: &str) -> StoreResult<InboxBegin> {
        self.inner.begin(message_id, consumer_id).await
    }

    async fn mark_processed(&self, message_id: &str, consumer_id: &str) -> StoreResult<()> {
        self.inner.mark_processed(message_id, consumer_id).await
    }

    async fn mark_failed(
        &self,
        message_id: &str,
        consumer_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        self.inner.mark_failed(message_id, consumer_id, error).await
    }

    async fn get_record(
        &self,
        message_id: &str,
        consumer_id: &str,
    ) -> StoreResult<Option<InboxMessage>> {
        self.inner.get_record(message_id, consumer_id).await
    }

    async fn processing_consumers(&self) -> StoreResult<Vec<String>> {
        if self.fail_listing {
            return Err(StoreError::Connection("listing consumers failed".to_string()));
        }
        self.inner.processing_consumers().await
    }

    async fn reclaim_stale_messages_by_consumer(
        &self,
        consumer_id: &str,
        older_than: DateTime<Utc>,
    ) -> StoreResult<u64> {
        if self.broken.contains(consumer_id) {
            return Err(StoreError::Connection(format!("reclaim failed for {consumer_id}")));
        }
        self.inner
            .reclaim_stale_messages_by_consumer(consumer_id, older_than)
            .await
    }

    async fn delete_processed_older_than(&self, threshold: DateTime<Utc>) -> StoreResult<u64> {
        InboxStore::delete_processed_older_than(self.inner.as_ref(), threshold).await
    }
}

/// Outbox over an in-memory store with injectable misbehavior:
/// - `gate_delete`: retention delete signals `entered`, then waits for `release`
/// - `fail_delete`: retention delete errors
/// - `fail_claims`: every claim errors; attempts are counted in `claim_calls`
pub struct GatedStore {
    pub inner: Arc<InMemoryStore>,
    pub entered: Notify,
    pub release: Notify,
    pub gate_delete: bool,
    pub fail_delete: bool,
    pub fail_claims: bool,
    pub claim_calls: AtomicUsize,
}

impl GatedStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
            gate_delete: false,
            fail_delete: false,
            fail_claims: false,
            claim_calls: AtomicUsize::new(0),
        }
    }

    pub fn gated(inner: Arc<InMemoryStore>) -> Self {
        Self {
            gate_delete: true,
            ..Self::new(inner)
        }
    }
}

#[async_trait]
impl OutboxStore for GatedStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> StoreResult<OutboxMessage> {
        self.inner.enqueue(message).await
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<OutboxMessage>> {
        self.inner.get_message(id).await
    }

    async fn claim_batch(
        &self,
        limit: usize,
        instance_id: &str,
    ) -> StoreResult<Vec<OutboxMessage>> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_claims {
            return Err(StoreError::Connection("claim failed".to_string()));
        }
        self.inner.claim_batch(limit, instance_id).await
    }

    async fn mark_as_sent(&self, id: &str, instance_id: &str) -> StoreResult<()> {
        self.inner.mark_as_sent(id, instance_id).await
    }

    async fn mark_as_failed(
        &self,
        id: &str,
        instance_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner
            .mark_as_failed(id, instance_id, error, next_attempt_at)
            .await
    }

    async fn mark_as_permanently_failed(
        &self,
        id: &str,
        instance_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        self.inner
            .mark_as_permanently_failed(id, instance_id, error)
            .await
    }

    async fn reclaim_stale_messages(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.inner.reclaim_stale_messages(older_than).await
    }

    async fn delete_processed_older_than(&self, threshold: DateTime<Utc>) -> StoreResult<u64> {
        if self.fail_delete {
            return Err(StoreError::Connection("delete failed".to_string()));
        }
        if self.gate_delete {
            self.entered.notify_one();
            self.release.notified().await;
        }
        OutboxStore::delete_processed_older_than(self.inner.as_ref(), threshold).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn destination() -> Destination {
    Destination::new("jobs", "job.completed")
}

/// Envelope payload naming `job_id` as the originating job.
pub fn envelope_message(id: &str, job_id: Option<&str>) -> NewOutboxMessage {
    let envelope = MessageEnvelope {
        correlation_id: format!("corr-{id}"),
        workflow_type: "invoice".to_string(),
        job_id: job_id.map(str::to_string),
        data: serde_json::json!({ "id": id }),
    };
    NewOutboxMessage::from_envelope(destination(), &envelope)
        .unwrap()
        .with_id(id)
}

/// A claimable outbox row that has already failed `attempts` times.
pub fn outbox_row(id: &str, attempts: u32, job_id: Option<&str>) -> OutboxMessage {
    let new = envelope_message(id, job_id);
    let now = Utc::now();
    OutboxMessage {
        id: new.id,
        destination: new.destination,
        payload: new.payload,
        status: if attempts == 0 {
            OutboxStatus::Pending
        } else {
            OutboxStatus::Failed
        },
        attempts,
        last_error: None,
        next_attempt_at: now - chrono::Duration::seconds(1),
        locked_by: None,
        locked_at: None,
        created_at: now - chrono::Duration::minutes(1),
        processed_at: None,
    }
}

/// An outbox row leased by `relay-dead` `age` ago.
pub fn leased_outbox_row(id: &str, age: chrono::Duration) -> OutboxMessage {
    let mut row = outbox_row(id, 0, None);
    row.status = OutboxStatus::Processing;
    row.locked_by = Some("relay-dead".to_string());
    row.locked_at = Some(Utc::now() - age);
    row
}

/// A terminal outbox row processed `age` ago.
pub fn terminal_outbox_row(id: &str, status: OutboxStatus, age: chrono::Duration) -> OutboxMessage {
    let mut row = outbox_row(id, 1, None);
    row.status = status;
    row.processed_at = Some(Utc::now() - age);
    row
}

/// An inbox record for `consumer_id` in `status`, locked or processed `age` ago.
pub fn inbox_row(
    message_id: &str,
    consumer_id: &str,
    status: InboxStatus,
    age: chrono::Duration,
) -> InboxMessage {
    let at = Utc::now() - age;
    InboxMessage {
        message_id: message_id.to_string(),
        consumer_id: consumer_id.to_string(),
        status,
        locked_at: (status == InboxStatus::Processing).then_some(at),
        last_error: None,
        created_at: at,
        processed_at: status.is_terminal().then_some(at),
    }
}

pub async fn insert_job(store: &InMemoryStore, id: &str) {
    store
        .insert(NewUnitOfWork {
            id: id.to_string(),
            status: JobStatus::InProgress,
        })
        .await
        .unwrap();
}

/// Settings with jitter disabled and short timeouts.
pub fn test_settings() -> RelaySettings {
    RelaySettings {
        instance_id: "relay-test".to_string(),
        batch_size: 50,
        max_attempts: 3,
        publish_timeout: Duration::from_millis(200),
        min_interval: Duration::from_millis(100),
        max_interval: Duration::from_millis(3000),
        backoff: BackoffPolicy {
            jitter_factor: 0.0,
            ..BackoffPolicy::default()
        },
    }
}

/// Relay over an in-memory store with a scripted publisher and recording sink.
pub struct RelayFixture {
    pub store: Arc<InMemoryStore>,
    pub publisher: Arc<ScriptedPublisher>,
    pub sink: Arc<RecordingSink>,
    pub relay: OutboxRelay,
}

impl RelayFixture {
    pub fn new(settings: RelaySettings) -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self::with_jobs(settings, store.clone(), store)
    }

    pub fn with_jobs(
        settings: RelaySettings,
        store: Arc<InMemoryStore>,
        jobs: Arc<dyn UnitOfWorkStore>,
    ) -> Self {
        let publisher = Arc::new(ScriptedPublisher::new());
        let sink = Arc::new(RecordingSink::new());
        let relay = OutboxRelay::new(
            store.clone(),
            jobs,
            publisher.clone(),
            sink.clone(),
            settings,
        )
        .with_seed(7);
        Self {
            store,
            publisher,
            sink,
            relay,
        }
    }

    pub async fn message(&self, id: &str) -> OutboxMessage {
        self.store.get_message(id).await.unwrap().unwrap()
    }

    pub fn statuses(&self) -> BTreeMap<String, OutboxStatus> {
        self.store
            .outbox_snapshot()
            .unwrap()
            .into_iter()
            .map(|m| (m.id, m.status))
            .collect()
    }
}
