//! Observable relay events.
//!
//! Maintenance tasks and the relay loop report noteworthy outcomes through a
//! [`RelayEventSink`] in addition to logging them. Production wiring uses a
//! sink that forwards to `tracing`; tests record events and assert on them.

use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// The outbox reaper returned stale leases to PENDING.
    OutboxReclaimed { count: u64 },

    /// The inbox reaper returned a consumer's stale records to PENDING.
    InboxReclaimed { consumer_id: String, count: u64 },

    /// One consumer had at least `alert_threshold` records reclaimed in a
    /// single sweep, which points at a crash loop rather than a one-off.
    InboxReclaimSpike {
        consumer_id: String,
        count: u64,
        alert_threshold: u64,
    },

    /// A retention sweep deleted terminal rows.
    RetentionSwept { outbox_deleted: u64, inbox_deleted: u64 },

    /// A retention sweep was skipped because one was already running.
    RetentionSkipped,

    /// A message exhausted its attempts.
    PermanentlyFailed {
        message_id: String,
        attempts: u32,
        job_id: Option<String>,
    },

    /// Escalating a permanent failure to its unit of work failed.
    EscalationFailed { message_id: String, job_id: String },

    /// An outcome write was rejected because this instance no longer holds
    /// the message's lease (it was reclaimed and possibly re-claimed).
    LeaseLost { message_id: String, instance_id: String },
}

pub trait RelayEventSink: Send + Sync {
    fn emit(&self, event: RelayEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl RelayEventSink for NullSink {
    fn emit(&self, _event: RelayEvent) {}
}

/// Forwards events to `tracing` at a level matching their severity.
#[derive(Debug, Default)]
pub struct TracingSink;

impl RelayEventSink for TracingSink {
    fn emit(&self, event: RelayEvent) {
        match event {
            RelayEvent::OutboxReclaimed { count } => {
                info!(count, "Reclaimed stale outbox messages");
            }
            RelayEvent::InboxReclaimed { consumer_id, count } => {
                info!(consumer_id = %consumer_id, count, "Reclaimed stale inbox messages");
            }
            RelayEvent::InboxReclaimSpike {
                consumer_id,
                count,
                alert_threshold,
            } => {
                warn!(
                    consumer_id = %consumer_id,
                    count,
                    alert_threshold,
                    "Inbox reclaim spike, consumer may be crash looping"
                );
            }
            RelayEvent::RetentionSwept {
                outbox_deleted,
                inbox_deleted,
            } => {
                info!(outbox_deleted, inbox_deleted, "Retention sweep complete");
            }
            RelayEvent::RetentionSkipped => {
                warn!("Retention sweep already running, skipping");
            }
            RelayEvent::PermanentlyFailed {
                message_id,
                attempts,
                job_id,
            } => {
                error!(
                    message_id = %message_id,
                    attempts,
                    job_id = ?job_id,
                    "Outbox message permanently failed"
                );
            }
            RelayEvent::EscalationFailed { message_id, job_id } => {
                error!(
                    message_id = %message_id,
                    job_id = %job_id,
                    "Failed to escalate permanent failure to unit of work"
                );
            }
            RelayEvent::LeaseLost {
                message_id,
                instance_id,
            } => {
                warn!(
                    message_id = %message_id,
                    instance_id = %instance_id,
                    "Lease lost before the outcome was recorded"
                );
            }
        }
    }
}

/// Records events for assertions.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RelayEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RelayEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RelayEventSink for RecordingSink {
    fn emit(&self, event: RelayEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
