//! Async SQLite store using a dedicated executor thread.
//!
//! All statements run on the single `tokio_rusqlite` background thread and
//! are awaited without blocking the runtime. SQLite serializes writes, so
//! the claim statement in [`queries::claim_outbox_batch`] is exclusive
//! across every connection to the same file.
//!
//! ```ignore
//! let store = SqliteStore::open(&paths.database_file()).await?;
//! let batch = store.claim_batch(50, "relay-a").await?;
//! ```

use crate::store::{InboxStore, OutboxStore, UnitOfWorkStore};
use crate::{
    migrations, queries, InboxBegin, InboxMessage, JobUpdate, NewOutboxMessage, NewUnitOfWork,
    OutboxMessage, StoreError, StoreResult, UnitOfWork,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::info;

/// Convert a tokio_rusqlite::Error to StoreError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => StoreError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => StoreError::Connection("Connection closed".to_string()),
        other => StoreError::Connection(other.to_string()),
    }
}

/// SQLite-backed outbox, inbox and unit-of-work store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
    path: String,
}

impl SqliteStore {
    /// Open a store at the given path.
    ///
    /// Creates the file and its parent directory if needed, enables WAL mode
    /// and runs pending migrations.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path_str = path.to_string_lossy().to_string();
        info!(path = %path_str, "Opening relay store");

        let conn = Connection::open(&path_str)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        let store = Self {
            conn,
            path: path_str,
        };
        store.call(|conn| migrations::run_migrations(conn)).await?;

        info!(path = %store.path, "Relay store initialized with WAL mode");
        Ok(store)
    }

    /// Open a private in-memory store.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self {
            conn,
            path: ":memory:".to_string(),
        };
        store.call(|conn| migrations::run_migrations(conn)).await?;
        Ok(store)
    }

    /// Execute a closure on the executor thread.
    ///
    /// Only SQL and lightweight row mapping belong inside the closure; it
    /// holds the single database thread while it runs.
    pub async fn call<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer_result = self
            .conn
            .call(move |conn| {
                let inner_result = f(conn);
                Ok(inner_result)
            })
            .await;

        match outer_result {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Get the database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check that the executor answers a trivial query.
    pub async fn health_check(&self) -> StoreResult<()> {
        self.call(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn enqueue(&self, message: NewOutboxMessage) -> StoreResult<OutboxMessage> {
        self.call(move |conn| queries::insert_outbox_message(conn, &message, Utc::now()))
            .await
    }

    async fn get_message(&self, id: &str) -> StoreResult<Option<OutboxMessage>> {
        let id = id.to_string();
        self.call(move |conn| queries::get_outbox_message(conn, &id))
            .await
    }

    async fn claim_batch(
        &self,
        limit: usize,
        instance_id: &str,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let instance_id = instance_id.to_string();
        self.call(move |conn| queries::claim_outbox_batch(conn, limit, &instance_id, Utc::now()))
            .await
    }

    async fn mark_as_sent(&self, id: &str, instance_id: &str) -> StoreResult<()> {
        let id = id.to_string();
        let instance_id = instance_id.to_string();
        self.call(move |conn| queries::mark_outbox_sent(conn, &id, &instance_id, Utc::now()))
            .await
    }

    async fn mark_as_failed(
        &self,
        id: &str,
        instance_id: &str,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let instance_id = instance_id.to_string();
        let error = error.to_string();
        self.call(move |conn| {
            queries::mark_outbox_failed(conn, &id, &instance_id, &error, next_attempt_at)
        })
        .await
    }

    async fn mark_as_permanently_failed(
        &self,
        id: &str,
        instance_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let instance_id = instance_id.to_string();
        let error = error.to_string();
        self.call(move |conn| {
            queries::mark_outbox_permanently_failed(conn, &id, &instance_id, &error, Utc::now())
        })
        .await
    }

    async fn reclaim_stale_messages(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        self.call(move |conn| queries::reclaim_stale_outbox(conn, older_than, Utc::now()))
            .await
    }

    async fn delete_processed_older_than(&self, threshold: DateTime<Utc>) -> StoreResult<u64> {
        self.call(move |conn| queries::delete_processed_outbox(conn, threshold))
            .await
    }
}

#[async_trait]
impl InboxStore for SqliteStore {
    async fn begin(&self, message_id: &str, consumer_id: &str) -> StoreResult<InboxBegin> {
        let message_id = message_id.to_string();
        let consumer_id = consumer_id.to_string();
        self.call(move |conn| {
            queries::begin_inbox_message(conn, &message_id, &consumer_id, Utc::now())
        })
        .await
    }

    async fn mark_processed(&self, message_id: &str, consumer_id: &str) -> StoreResult<()> {
        let message_id = message_id.to_string();
        let consumer_id = consumer_id.to_string();
        self.call(move |conn| {
            queries::mark_inbox_processed(conn, &message_id, &consumer_id, Utc::now())
        })
        .await
    }

    async fn mark_failed(
        &self,
        message_id: &str,
        consumer_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        let message_id = message_id.to_string();
        let consumer_id = consumer_id.to_string();
        let error = error.to_string();
        self.call(move |conn| {
            queries::mark_inbox_failed(conn, &message_id, &consumer_id, &error, Utc::now())
        })
        .await
    }

    async fn get_record(
        &self,
        message_id: &str,
        consumer_id: &str,
    ) -> StoreResult<Option<InboxMessage>> {
        let message_id = message_id.to_string();
        let consumer_id = consumer_id.to_string();
        self.call(move |conn| queries::get_inbox_message(conn, &message_id, &consumer_id))
            .await
    }

    async fn processing_consumers(&self) -> StoreResult<Vec<String>> {
        self.call(|conn| queries::list_processing_consumers(conn)).await
    }

    async fn reclaim_stale_messages_by_consumer(
        &self,
        consumer_id: &str,
        older_than: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let consumer_id = consumer_id.to_string();
        self.call(move |conn| {
            queries::reclaim_stale_inbox_by_consumer(conn, &consumer_id, older_than)
        })
        .await
    }

    async fn delete_processed_older_than(&self, threshold: DateTime<Utc>) -> StoreResult<u64> {
        self.call(move |conn| queries::delete_processed_inbox(conn, threshold))
            .await
    }
}

#[async_trait]
impl UnitOfWorkStore for SqliteStore {
    async fn insert(&self, job: NewUnitOfWork) -> StoreResult<UnitOfWork> {
        self.call(move |conn| queries::insert_unit_of_work(conn, &job, Utc::now()))
            .await
    }

    async fn get_job(&self, job_id: &str) -> StoreResult<Option<UnitOfWork>> {
        let job_id = job_id.to_string();
        self.call(move |conn| queries::get_unit_of_work(conn, &job_id))
            .await
    }

    async fn update(&self, job_id: &str, update: JobUpdate) -> StoreResult<()> {
        let job_id = job_id.to_string();
        self.call(move |conn| queries::update_unit_of_work(conn, &job_id, &update, Utc::now()))
            .await
    }
}
