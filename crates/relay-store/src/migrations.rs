//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.
//! Timestamps are stored as Unix milliseconds so that staleness and due-time
//! predicates compare integers.

use crate::StoreResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_messages(conn)?;
    }
    if current_version < 2 {
        migrate_v2_inbox_messages(conn)?;
    }
    if current_version < 3 {
        migrate_v3_units_of_work(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: outbox messages awaiting publication.
fn migrate_v1_outbox_messages(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_messages (
            id TEXT PRIMARY KEY NOT NULL,
            exchange TEXT NOT NULL,
            routing_key TEXT NOT NULL,
            payload BLOB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'sent', 'failed', 'permanently_failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_attempt_at INTEGER NOT NULL,
            locked_by TEXT,
            locked_at INTEGER,
            created_at INTEGER NOT NULL,
            processed_at INTEGER
        );

        -- Claim scan: due rows in claimable states
        CREATE INDEX IF NOT EXISTS idx_outbox_claim
            ON outbox_messages(status, next_attempt_at);

        -- Reaper scan: leased rows by lock age
        CREATE INDEX IF NOT EXISTS idx_outbox_locked
            ON outbox_messages(status, locked_at);

        -- Retention scan
        CREATE INDEX IF NOT EXISTS idx_outbox_processed
            ON outbox_messages(status, processed_at);
        ",
    )?;

    record_migration(conn, 1, "outbox_messages")?;
    Ok(())
}

/// V2: per-consumer inbox records.
fn migrate_v2_inbox_messages(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS inbox_messages (
            message_id TEXT NOT NULL,
            consumer_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'processing', 'processed', 'failed')),
            locked_at INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            processed_at INTEGER,
            PRIMARY KEY (message_id, consumer_id)
        );

        -- Per-consumer reclaim
        CREATE INDEX IF NOT EXISTS idx_inbox_consumer_locked
            ON inbox_messages(consumer_id, status, locked_at);

        CREATE INDEX IF NOT EXISTS idx_inbox_processed
            ON inbox_messages(status, processed_at);
        ",
    )?;

    record_migration(conn, 2, "inbox_messages")?;
    Ok(())
}

/// V3: units of work escalated on permanent publish failure.
fn migrate_v3_units_of_work(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS units_of_work (
            id TEXT PRIMARY KEY NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'in_progress', 'success', 'failed')),
            error_classification TEXT
                CHECK (error_classification IS NULL OR error_classification IN ('transient', 'permanent')),
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        ",
    )?;

    record_migration(conn, 3, "units_of_work")?;
    Ok(())
}
