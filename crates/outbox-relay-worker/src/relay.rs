//! The outbox relay loop.
//!
//! Each cycle claims a batch, publishes every message on its own task and
//! records the outcome. The loop then sleeps for an adaptive interval: any
//! successful publish snaps the interval back to its minimum, otherwise it
//! doubles toward the maximum.
//!
//! Failure handling per message:
//! - attempts remaining: `FAILED` with `next_attempt_at = now + backoff(attempts)`
//! - attempts exhausted: `PERMANENTLY_FAILED`, then a best-effort escalation
//!   of the originating unit of work to `FAILED`/`PERMANENT`
//!
//! Outcome writes carry this instance's id and only land while it still
//! holds the lease. A rejected write means the message was reclaimed; the
//! outcome is dropped and the job is not escalated. Any other store error
//! leaves the message PROCESSING until the outbox reaper returns it to
//! PENDING.

use crate::backoff::BackoffPolicy;
use crate::events::{RelayEvent, RelayEventSink};
use crate::interval::AdaptiveInterval;
use crate::publisher::{
    BrokerPublisher, PublishOptions, ATTEMPT_HEADER, IDEMPOTENCY_KEY_HEADER, WORKFLOW_TYPE_HEADER,
};
use crate::{PublishError, RelayError, RelayResult};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use relay_config_and_utils::RelayConfig;
use relay_store::{JobUpdate, OutboxMessage, OutboxStore, StoreError, UnitOfWorkStore};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Relay loop settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Stamped into `locked_by` on every claim.
    pub instance_id: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub publish_timeout: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            instance_id: "relay-local".to_string(),
            batch_size: 50,
            max_attempts: 3,
            publish_timeout: Duration::from_millis(15_000),
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(3000),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RelaySettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            batch_size: config.batch_size,
            max_attempts: config.max_attempts,
            publish_timeout: config.publish_timeout(),
            min_interval: config.min_poll_interval(),
            max_interval: config.max_poll_interval(),
            backoff: BackoffPolicy::from_config(config),
        }
    }
}

/// Counts from one relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    /// Published and marked SENT. Drives the adaptive interval.
    pub succeeded: usize,
    pub retried: usize,
    pub permanently_failed: usize,
    /// Outcome could not be recorded, or the publish task died.
    pub errored: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Sent,
    Retried,
    PermanentlyFailed,
    Errored,
}

/// Drains the outbox to the broker.
#[derive(Clone)]
pub struct OutboxRelay {
    outbox: Arc<dyn OutboxStore>,
    jobs: Arc<dyn UnitOfWorkStore>,
    publisher: Arc<dyn BrokerPublisher>,
    sink: Arc<dyn RelayEventSink>,
    settings: RelaySettings,
    rng: Arc<Mutex<StdRng>>,
}

impl OutboxRelay {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        jobs: Arc<dyn UnitOfWorkStore>,
        publisher: Arc<dyn BrokerPublisher>,
        sink: Arc<dyn RelayEventSink>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            outbox,
            jobs,
            publisher,
            sink,
            settings,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Seed the jitter RNG so retry schedules are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Run the loop until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// A cycle already in flight when shutdown arrives finishes its publishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            AdaptiveInterval::new(self.settings.min_interval, self.settings.max_interval);

        info!(
            instance_id = %self.settings.instance_id,
            batch_size = self.settings.batch_size,
            "Outbox relay started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let sleep_for = match self.run_cycle().await {
                Ok(report) => {
                    if report.claimed > 0 {
                        debug!(
                            claimed = report.claimed,
                            succeeded = report.succeeded,
                            retried = report.retried,
                            permanently_failed = report.permanently_failed,
                            errored = report.errored,
                            "Relay cycle complete"
                        );
                    }
                    interval.record(report.succeeded)
                }
                Err(e) => {
                    error!(error = %e, "Relay cycle failed");
                    interval.back_off_fully()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(instance_id = %self.settings.instance_id, "Outbox relay stopped");
    }

    /// Claim one batch and publish it.
    pub async fn run_cycle(&self) -> RelayResult<CycleReport> {
        let batch = self
            .outbox
            .claim_batch(self.settings.batch_size, &self.settings.instance_id)
            .await?;

        let mut report = CycleReport {
            claimed: batch.len(),
            ..CycleReport::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        let mut tasks = JoinSet::new();
        for message in batch {
            let relay = self.clone();
            tasks.spawn(async move { relay.process_message(message).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(MessageOutcome::Sent) => report.succeeded += 1,
                Ok(MessageOutcome::Retried) => report.retried += 1,
                Ok(MessageOutcome::PermanentlyFailed) => report.permanently_failed += 1,
                Ok(MessageOutcome::Errored) => report.errored += 1,
                Err(e) => {
                    let e = RelayError::Task(e.to_string());
                    error!(error = %e, "Publish task did not complete");
                    report.errored += 1;
                }
            }
        }

        Ok(report)
    }

    async fn process_message(&self, message: OutboxMessage) -> MessageOutcome {
        let options = self.publish_options(&message);
        let timeout = self.settings.publish_timeout;

        let published = match tokio::time::timeout(
            timeout,
            self.publisher
                .publish(&message.destination, &message.payload, &options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(timeout.as_millis() as u64)),
        };

        match published {
            Ok(()) => match self
                .outbox
                .mark_as_sent(&message.id, &self.settings.instance_id)
                .await
            {
                Ok(()) => MessageOutcome::Sent,
                Err(e) => self.outcome_not_recorded(&message, "sent", e),
            },
            Err(cause) => self.handle_failure(&message, &cause).await,
        }
    }

    async fn handle_failure(
        &self,
        message: &OutboxMessage,
        cause: &PublishError,
    ) -> MessageOutcome {
        let attempts = message.attempts.saturating_add(1);
        let cause = cause.to_string();

        if attempts < self.settings.max_attempts {
            let delay = self.retry_delay(attempts);
            let now = Utc::now();
            let next_attempt_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            warn!(
                message_id = %message.id,
                attempts,
                max_attempts = self.settings.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %cause,
                "Publish failed, scheduling retry"
            );

            return match self
                .outbox
                .mark_as_failed(
                    &message.id,
                    &self.settings.instance_id,
                    &cause,
                    next_attempt_at,
                )
                .await
            {
                Ok(()) => MessageOutcome::Retried,
                Err(e) => self.outcome_not_recorded(message, "failed", e),
            };
        }

        if let Err(e) = self
            .outbox
            .mark_as_permanently_failed(&message.id, &self.settings.instance_id, &cause)
            .await
        {
            return self.outcome_not_recorded(message, "permanently_failed", e);
        }

        let job_id = message.job_id();
        self.sink.emit(RelayEvent::PermanentlyFailed {
            message_id: message.id.clone(),
            attempts,
            job_id: job_id.clone(),
        });

        if let Some(job_id) = job_id {
            self.escalate(message, &job_id, attempts, &cause).await;
        }

        MessageOutcome::PermanentlyFailed
    }

    /// An outcome write failed. `NotFound` means the lease moved to another
    /// holder; the row belongs to them now and nothing is escalated.
    fn outcome_not_recorded(
        &self,
        message: &OutboxMessage,
        outcome: &'static str,
        e: StoreError,
    ) -> MessageOutcome {
        match e {
            StoreError::NotFound(_) => {
                warn!(
                    message_id = %message.id,
                    instance_id = %self.settings.instance_id,
                    outcome,
                    "Lease lost, discarding outcome"
                );
                self.sink.emit(RelayEvent::LeaseLost {
                    message_id: message.id.clone(),
                    instance_id: self.settings.instance_id.clone(),
                });
            }
            e => {
                error!(
                    message_id = %message.id,
                    outcome,
                    error = %e,
                    "Failed to record publish outcome"
                );
            }
        }
        MessageOutcome::Errored
    }

    /// Mark the originating job as permanently failed. Errors are logged and
    /// reported to the sink, never returned.
    async fn escalate(&self, message: &OutboxMessage, job_id: &str, attempts: u32, cause: &str) {
        let update = JobUpdate::permanent_failure(format!(
            "Outbox publish failed permanently after {attempts} attempts: {cause}"
        ));

        if let Err(e) = self.jobs.update(job_id, update).await {
            error!(
                message_id = %message.id,
                job_id = %job_id,
                error = %e,
                "Unit of work escalation failed"
            );
            self.sink.emit(RelayEvent::EscalationFailed {
                message_id: message.id.clone(),
                job_id: job_id.to_string(),
            });
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        match self.rng.lock() {
            Ok(mut rng) => self.settings.backoff.delay(attempt, &mut *rng),
            Err(_) => self.settings.backoff.base_delay(attempt),
        }
    }

    fn publish_options(&self, message: &OutboxMessage) -> PublishOptions {
        let envelope = message.envelope();
        let correlation_id = envelope
            .as_ref()
            .map(|e| e.correlation_id.clone())
            .unwrap_or_else(|| message.id.clone());

        let mut headers = BTreeMap::new();
        headers.insert(IDEMPOTENCY_KEY_HEADER.to_string(), message.id.clone());
        headers.insert(
            ATTEMPT_HEADER.to_string(),
            message.attempts.saturating_add(1).to_string(),
        );
        if let Some(envelope) = &envelope {
            headers.insert(
                WORKFLOW_TYPE_HEADER.to_string(),
                envelope.workflow_type.clone(),
            );
        }

        PublishOptions {
            message_id: message.id.clone(),
            correlation_id,
            persistent: true,
            timeout: self.settings.publish_timeout,
            headers,
        }
    }
}
