//! Command implementations for the relay daemon.

use std::sync::Arc;

use outbox_relay_worker::{
    BrokerPublisher, HttpBrokerPublisher, InboxReaper, InboxTimeoutPolicy, LogPublisher,
    OutboxReaper, RelayEventSink, RelayManager, RetentionSweeper, TracingSink,
};
use relay_config_and_utils::{Paths, RelayConfig};
use relay_store::{
    Destination, MessageEnvelope, NewOutboxMessage, OutboxStore, SqliteStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

async fn open_store(paths: &Paths) -> AppResult<Arc<SqliteStore>> {
    paths.ensure_dirs()?;
    let store = SqliteStore::open(&paths.database_file()).await?;
    info!(path = %store.path(), "Opened relay database");
    Ok(Arc::new(store))
}

fn build_publisher(config: &RelayConfig) -> AppResult<Arc<dyn BrokerPublisher>> {
    match HttpBrokerPublisher::from_config(config)? {
        Some(publisher) => Ok(Arc::new(publisher)),
        None => {
            warn!("No broker_url configured, messages will only be logged");
            Ok(Arc::new(LogPublisher))
        }
    }
}

/// Run every loop until Ctrl-C, then wait for in-flight work to settle.
pub async fn run_relay(config: RelayConfig, paths: Paths) -> AppResult<()> {
    let store = open_store(&paths).await?;
    let publisher = build_publisher(&config)?;
    let sink: Arc<dyn RelayEventSink> = Arc::new(TracingSink);

    let manager = RelayManager::from_config(&config, store, publisher, sink);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = manager.run(shutdown_rx);
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => {
            warn!("Relay manager exited without a shutdown request");
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            let _ = shutdown_tx.send(true);
            run.await;
        }
    }

    Ok(())
}

/// One pass of both reapers.
pub async fn reap_once(config: RelayConfig, paths: Paths) -> AppResult<()> {
    let store = open_store(&paths).await?;
    let sink: Arc<dyn RelayEventSink> = Arc::new(TracingSink);

    let outbox_reaper = OutboxReaper::new(
        store.clone(),
        config.outbox_stale_threshold(),
        sink.clone(),
    );
    let outbox_reclaimed = outbox_reaper.reap().await?;
    println!("outbox: reclaimed {outbox_reclaimed}");

    let inbox_reaper = InboxReaper::new(store, InboxTimeoutPolicy::from_config(&config), sink);
    let report = inbox_reaper.reap().await;
    for (consumer_id, count) in &report.reclaimed {
        println!("inbox[{consumer_id}]: reclaimed {count}");
    }
    for consumer_id in &report.failed {
        println!("inbox[{consumer_id}]: reclaim failed");
    }
    if report.listing_failed {
        println!("inbox: listing unconfigured consumers failed");
    }

    Ok(())
}

/// One retention sweep.
pub async fn sweep_once(config: RelayConfig, paths: Paths) -> AppResult<()> {
    let store = open_store(&paths).await?;
    let sweeper = RetentionSweeper::new(
        store.clone(),
        store,
        config.retention_window(),
        Arc::new(TracingSink),
    );

    match sweeper.sweep().await? {
        Some(report) => println!(
            "deleted {} outbox and {} inbox records",
            report.outbox_deleted, report.inbox_deleted
        ),
        None => println!("sweep already running"),
    }
    Ok(())
}

pub struct EnqueueRequest {
    pub exchange: String,
    pub routing_key: String,
    pub workflow_type: String,
    pub job_id: Option<String>,
    pub correlation_id: Option<String>,
    pub data: String,
}

pub async fn enqueue(paths: Paths, request: EnqueueRequest) -> AppResult<()> {
    let data: serde_json::Value = serde_json::from_str(&request.data)?;
    let store = open_store(&paths).await?;

    let mut message = NewOutboxMessage::new(
        Destination::new(request.exchange, request.routing_key),
        Vec::new(),
    );
    let envelope = MessageEnvelope {
        correlation_id: request
            .correlation_id
            .unwrap_or_else(|| message.id.clone()),
        workflow_type: request.workflow_type,
        job_id: request.job_id,
        data,
    };
    message.payload = serde_json::to_vec(&envelope)?;

    let stored = store.enqueue(message).await?;
    println!("{}", stored.id);
    Ok(())
}

pub async fn show(paths: Paths, id: &str) -> AppResult<()> {
    let store = open_store(&paths).await?;
    let Some(message) = store.get_message(id).await? else {
        return Err(format!("outbox message '{id}' not found").into());
    };

    let json = serde_json::json!({
        "id": message.id,
        "destination": message.destination.to_string(),
        "status": message.status.as_str(),
        "attempts": message.attempts,
        "last_error": message.last_error,
        "next_attempt_at": message.next_attempt_at.to_rfc3339(),
        "locked_by": message.locked_by,
        "locked_at": message.locked_at.map(|t| t.to_rfc3339()),
        "created_at": message.created_at.to_rfc3339(),
        "processed_at": message.processed_at.map(|t| t.to_rfc3339()),
        "envelope": message.envelope(),
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
