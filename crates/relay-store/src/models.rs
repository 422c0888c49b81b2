//! Model types for the relay's persisted records.

use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Outbox
// ============================================================================

/// Where a message is published: an exchange plus routing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// JSON envelope carried in an outbox payload.
///
/// The relay treats the payload as opaque bytes; it only peeks at the
/// envelope for the correlation id, the workflow tag and the job that
/// produced the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub correlation_id: String,
    pub workflow_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Outbox message status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    /// Publish failed; claimable again once `next_attempt_at` elapses.
    Failed,
    PermanentlyFailed,
}

impl Default for OutboxStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    /// SENT and PERMANENTLY_FAILED are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::PermanentlyFailed)
    }

    /// Statuses the claim predicate accepts (subject to `next_attempt_at`).
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

impl FromStr for OutboxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            other => Err(StoreError::InvalidData(format!("unknown outbox status '{other}'"))),
        }
    }
}

/// A persisted outbox message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: String,
    pub destination: Destination,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Set when the message reaches a terminal status.
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Decode the payload envelope, if the payload is one.
    pub fn envelope(&self) -> Option<MessageEnvelope> {
        serde_json::from_slice(&self.payload).ok()
    }

    /// Correlation id from the envelope, falling back to the message id.
    pub fn correlation_id(&self) -> String {
        self.envelope()
            .map(|e| e.correlation_id)
            .unwrap_or_else(|| self.id.clone())
    }

    /// The job that originated this message, if the payload names one.
    pub fn job_id(&self) -> Option<String> {
        self.envelope().and_then(|e| e.job_id)
    }
}

/// A new outbox message for insertion.
#[derive(Debug, Clone)]
pub struct NewOutboxMessage {
    pub id: String,
    pub destination: Destination,
    pub payload: Vec<u8>,
    /// First moment the message may be claimed. `None` means now.
    pub available_at: Option<DateTime<Utc>>,
}

impl NewOutboxMessage {
    /// Create a message with raw payload bytes and a fresh id.
    pub fn new(destination: Destination, payload: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            destination,
            payload,
            available_at: None,
        }
    }

    /// Create a message whose payload is the JSON-encoded envelope.
    pub fn from_envelope(
        destination: Destination,
        envelope: &MessageEnvelope,
    ) -> Result<Self, StoreError> {
        let payload = serde_json::to_vec(envelope)?;
        Ok(Self::new(destination, payload))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

// ============================================================================
// Inbox
// ============================================================================

/// Inbox record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }
}

impl FromStr for InboxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidData(format!("unknown inbox status '{other}'"))),
        }
    }
}

/// Per-consumer processing record for a received message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxMessage {
    pub message_id: String,
    pub consumer_id: String,
    pub status: InboxStatus,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Outcome of asking the inbox whether a consumer may process a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxBegin {
    /// The consumer now holds the record in PROCESSING.
    Started,
    /// Already handled; the delivery is a duplicate.
    AlreadyProcessed,
    /// Another delivery holds the lease.
    InProgress,
}

// ============================================================================
// Unit of work
// ============================================================================

/// Status of the job that originated a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidData(format!("unknown job status '{other}'"))),
        }
    }
}

/// Whether a job failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    Transient,
    Permanent,
}

impl ErrorClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl FromStr for ErrorClassification {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            other => Err(StoreError::InvalidData(format!(
                "unknown error classification '{other}'"
            ))),
        }
    }
}

/// A unit of work (job) record.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOfWork {
    pub id: String,
    pub status: JobStatus,
    pub error_classification: Option<ErrorClassification>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A new unit of work for insertion.
#[derive(Debug, Clone)]
pub struct NewUnitOfWork {
    pub id: String,
    pub status: JobStatus,
}

/// Fields written when a job's status changes.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub error_classification: Option<ErrorClassification>,
    pub last_error: Option<String>,
}

impl JobUpdate {
    /// Escalation written when the job's outbox message is permanently failed.
    pub fn permanent_failure(last_error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error_classification: Some(ErrorClassification::Permanent),
            last_error: Some(last_error.into()),
        }
    }
}
