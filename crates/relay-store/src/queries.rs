//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter and runs on
//! the SQLite executor thread. Timestamps are Unix milliseconds.

use crate::{
    Destination, ErrorClassification, InboxBegin, InboxMessage, InboxStatus, JobStatus,
    JobUpdate, NewOutboxMessage, NewUnitOfWork, OutboxMessage, OutboxStatus, StoreError,
    StoreResult, UnitOfWork,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::str::FromStr;
use tracing::debug;

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_column<T>(idx: usize, raw: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = StoreError>,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

// ==========================================
// Outbox
// ==========================================

const OUTBOX_COLUMNS: &str = "id, exchange, routing_key, payload, status, attempts, last_error, \
     next_attempt_at, locked_by, locked_at, created_at, processed_at";

fn outbox_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxMessage> {
    Ok(OutboxMessage {
        id: row.get(0)?,
        destination: Destination {
            exchange: row.get(1)?,
            routing_key: row.get(2)?,
        },
        payload: row.get(3)?,
        status: parse_column(4, row.get(4)?)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        next_attempt_at: from_millis(row.get(7)?),
        locked_by: row.get(8)?,
        locked_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
        created_at: from_millis(row.get(10)?),
        processed_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
    })
}

/// Insert a new PENDING outbox message.
pub fn insert_outbox_message(
    conn: &Connection,
    message: &NewOutboxMessage,
    now: DateTime<Utc>,
) -> StoreResult<OutboxMessage> {
    let available_at = message.available_at.unwrap_or(now);
    conn.execute(
        "INSERT INTO outbox_messages (id, exchange, routing_key, payload, status, attempts, next_attempt_at, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)",
        params![
            message.id,
            message.destination.exchange,
            message.destination.routing_key,
            message.payload,
            to_millis(available_at),
            to_millis(now),
        ],
    )?;
    get_outbox_message(conn, &message.id)?
        .ok_or_else(|| StoreError::NotFound("Outbox message not found after insert".to_string()))
}

/// Get an outbox message by ID.
pub fn get_outbox_message(conn: &Connection, id: &str) -> StoreResult<Option<OutboxMessage>> {
    let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    let message = stmt.query_row(params![id], outbox_from_row).optional()?;
    Ok(message)
}

/// Claim up to `limit` due messages in one conditional UPDATE.
///
/// The inner SELECT and the status flip execute as a single statement, so
/// concurrent claimers on the same database never see the same row.
pub fn claim_outbox_batch(
    conn: &Connection,
    limit: usize,
    instance_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<Vec<OutboxMessage>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let now_ms = to_millis(now);
    let sql = format!(
        "UPDATE outbox_messages
         SET status = 'processing', locked_by = ?1, locked_at = ?2
         WHERE id IN (
             SELECT id FROM outbox_messages
             WHERE status IN ('pending', 'failed') AND next_attempt_at <= ?2
             ORDER BY next_attempt_at ASC, created_at ASC
             LIMIT ?3
         )
         AND status IN ('pending', 'failed')
         RETURNING {OUTBOX_COLUMNS}"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut claimed = stmt
        .query_map(params![instance_id, now_ms, limit as i64], outbox_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    claimed.sort_by(|a, b| {
        a.next_attempt_at
            .cmp(&b.next_attempt_at)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });

    debug!(instance_id, count = claimed.len(), "Claimed outbox batch");
    Ok(claimed)
}

fn expect_one(updated: usize, what: &str, id: &str) -> StoreResult<()> {
    if updated == 0 {
        return Err(StoreError::NotFound(format!(
            "{what} '{id}' is missing or already terminal"
        )));
    }
    Ok(())
}

fn expect_leased(updated: usize, id: &str, instance_id: &str) -> StoreResult<()> {
    if updated == 0 {
        return Err(StoreError::NotFound(format!(
            "Outbox message '{id}' is not leased to '{instance_id}'"
        )));
    }
    Ok(())
}

/// Move a message leased to `instance_id` to SENT.
pub fn mark_outbox_sent(
    conn: &Connection,
    id: &str,
    instance_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE outbox_messages
         SET status = 'sent', processed_at = ?3, locked_by = NULL, locked_at = NULL
         WHERE id = ?1 AND status = 'processing' AND locked_by = ?2",
        params![id, instance_id, to_millis(now)],
    )?;
    expect_leased(updated, id, instance_id)
}

/// Record a failed attempt; the message becomes claimable at `next_attempt_at`.
pub fn mark_outbox_failed(
    conn: &Connection,
    id: &str,
    instance_id: &str,
    error: &str,
    next_attempt_at: DateTime<Utc>,
) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE outbox_messages
         SET status = 'failed', attempts = attempts + 1, last_error = ?3,
             next_attempt_at = ?4, locked_by = NULL, locked_at = NULL
         WHERE id = ?1 AND status = 'processing' AND locked_by = ?2",
        params![id, instance_id, error, to_millis(next_attempt_at)],
    )?;
    expect_leased(updated, id, instance_id)
}

/// Record the final failed attempt.
pub fn mark_outbox_permanently_failed(
    conn: &Connection,
    id: &str,
    instance_id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE outbox_messages
         SET status = 'permanently_failed', attempts = attempts + 1, last_error = ?3,
             processed_at = ?4, locked_by = NULL, locked_at = NULL
         WHERE id = ?1 AND status = 'processing' AND locked_by = ?2",
        params![id, instance_id, error, to_millis(now)],
    )?;
    expect_leased(updated, id, instance_id)
}

/// Return stale PROCESSING messages to PENDING, due immediately.
pub fn reclaim_stale_outbox(
    conn: &Connection,
    older_than: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StoreResult<u64> {
    let reclaimed = conn.execute(
        "UPDATE outbox_messages
         SET status = 'pending', next_attempt_at = ?2, locked_by = NULL, locked_at = NULL
         WHERE status = 'processing' AND locked_at < ?1",
        params![to_millis(older_than), to_millis(now)],
    )?;
    Ok(reclaimed as u64)
}

/// Delete terminal outbox messages processed before `threshold`.
pub fn delete_processed_outbox(conn: &Connection, threshold: DateTime<Utc>) -> StoreResult<u64> {
    let deleted = conn.execute(
        "DELETE FROM outbox_messages
         WHERE status IN ('sent', 'permanently_failed') AND processed_at < ?1",
        params![to_millis(threshold)],
    )?;
    Ok(deleted as u64)
}

// ==========================================
// Inbox
// ==========================================

const INBOX_COLUMNS: &str =
    "message_id, consumer_id, status, locked_at, last_error, created_at, processed_at";

fn inbox_from_row(row: &Row<'_>) -> rusqlite::Result<InboxMessage> {
    Ok(InboxMessage {
        message_id: row.get(0)?,
        consumer_id: row.get(1)?,
        status: parse_column(2, row.get(2)?)?,
        locked_at: row.get::<_, Option<i64>>(3)?.map(from_millis),
        last_error: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        processed_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
    })
}

/// Get an inbox record.
pub fn get_inbox_message(
    conn: &Connection,
    message_id: &str,
    consumer_id: &str,
) -> StoreResult<Option<InboxMessage>> {
    let sql = format!(
        "SELECT {INBOX_COLUMNS} FROM inbox_messages WHERE message_id = ?1 AND consumer_id = ?2"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let record = stmt
        .query_row(params![message_id, consumer_id], inbox_from_row)
        .optional()?;
    Ok(record)
}

/// Start processing a message for a consumer.
///
/// Insert-or-restart is a single upsert guarded on the existing status, so
/// two deliveries racing on the same record cannot both start.
pub fn begin_inbox_message(
    conn: &Connection,
    message_id: &str,
    consumer_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<InboxBegin> {
    let now_ms = to_millis(now);
    let started = conn.execute(
        "INSERT INTO inbox_messages (message_id, consumer_id, status, locked_at, created_at)
         VALUES (?1, ?2, 'processing', ?3, ?3)
         ON CONFLICT (message_id, consumer_id) DO UPDATE
         SET status = 'processing', locked_at = excluded.locked_at, processed_at = NULL
         WHERE inbox_messages.status IN ('pending', 'failed')",
        params![message_id, consumer_id, now_ms],
    )?;
    if started > 0 {
        return Ok(InboxBegin::Started);
    }

    match get_inbox_message(conn, message_id, consumer_id)? {
        Some(record) if record.status == InboxStatus::Processed => Ok(InboxBegin::AlreadyProcessed),
        Some(_) => Ok(InboxBegin::InProgress),
        None => Err(StoreError::NotFound(format!(
            "Inbox record '{message_id}/{consumer_id}' vanished during begin"
        ))),
    }
}

/// Move a PROCESSING record to PROCESSED.
pub fn mark_inbox_processed(
    conn: &Connection,
    message_id: &str,
    consumer_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE inbox_messages
         SET status = 'processed', processed_at = ?3, locked_at = NULL
         WHERE message_id = ?1 AND consumer_id = ?2 AND status = 'processing'",
        params![message_id, consumer_id, to_millis(now)],
    )?;
    expect_one(updated, "Inbox record", &format!("{message_id}/{consumer_id}"))
}

/// Move a PROCESSING record to FAILED.
pub fn mark_inbox_failed(
    conn: &Connection,
    message_id: &str,
    consumer_id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE inbox_messages
         SET status = 'failed', last_error = ?3, processed_at = ?4, locked_at = NULL
         WHERE message_id = ?1 AND consumer_id = ?2 AND status = 'processing'",
        params![message_id, consumer_id, error, to_millis(now)],
    )?;
    expect_one(updated, "Inbox record", &format!("{message_id}/{consumer_id}"))
}

/// Consumers that currently hold PROCESSING records.
pub fn list_processing_consumers(conn: &Connection) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT consumer_id FROM inbox_messages
         WHERE status = 'processing' ORDER BY consumer_id",
    )?;
    let consumers = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(consumers)
}

/// Return one consumer's stale PROCESSING records to PENDING.
pub fn reclaim_stale_inbox_by_consumer(
    conn: &Connection,
    consumer_id: &str,
    older_than: DateTime<Utc>,
) -> StoreResult<u64> {
    let reclaimed = conn.execute(
        "UPDATE inbox_messages
         SET status = 'pending', locked_at = NULL
         WHERE consumer_id = ?1 AND status = 'processing' AND locked_at < ?2",
        params![consumer_id, to_millis(older_than)],
    )?;
    Ok(reclaimed as u64)
}

/// Delete terminal inbox records processed before `threshold`.
pub fn delete_processed_inbox(conn: &Connection, threshold: DateTime<Utc>) -> StoreResult<u64> {
    let deleted = conn.execute(
        "DELETE FROM inbox_messages
         WHERE status IN ('processed', 'failed') AND processed_at < ?1",
        params![to_millis(threshold)],
    )?;
    Ok(deleted as u64)
}

// ==========================================
// Units of work
// ==========================================

fn unit_of_work_from_row(row: &Row<'_>) -> rusqlite::Result<UnitOfWork> {
    let classification: Option<String> = row.get(2)?;
    Ok(UnitOfWork {
        id: row.get(0)?,
        status: parse_column::<JobStatus>(1, row.get(1)?)?,
        error_classification: classification
            .map(|raw| parse_column::<ErrorClassification>(2, raw))
            .transpose()?,
        last_error: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        updated_at: from_millis(row.get(5)?),
    })
}

/// Insert a unit of work.
pub fn insert_unit_of_work(
    conn: &Connection,
    job: &NewUnitOfWork,
    now: DateTime<Utc>,
) -> StoreResult<UnitOfWork> {
    let now_ms = to_millis(now);
    conn.execute(
        "INSERT INTO units_of_work (id, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
        params![job.id, job.status.as_str(), now_ms],
    )?;
    get_unit_of_work(conn, &job.id)?
        .ok_or_else(|| StoreError::NotFound("Unit of work not found after insert".to_string()))
}

/// Get a unit of work by ID.
pub fn get_unit_of_work(conn: &Connection, id: &str) -> StoreResult<Option<UnitOfWork>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, status, error_classification, last_error, created_at, updated_at
         FROM units_of_work WHERE id = ?1",
    )?;
    let job = stmt.query_row(params![id], unit_of_work_from_row).optional()?;
    Ok(job)
}

/// Apply a status change to a unit of work.
pub fn update_unit_of_work(
    conn: &Connection,
    id: &str,
    update: &JobUpdate,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let updated = conn.execute(
        "UPDATE units_of_work
         SET status = ?2, error_classification = ?3, last_error = ?4, updated_at = ?5
         WHERE id = ?1",
        params![
            id,
            update.status.as_str(),
            update.error_classification.map(|c| c.as_str()),
            update.last_error,
            to_millis(now),
        ],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound(format!("Unit of work '{id}'")));
    }
    Ok(())
}
