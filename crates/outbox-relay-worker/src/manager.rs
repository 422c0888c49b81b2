//! Wiring for a full relay process: the relay loop plus its maintenance tasks.

use crate::events::RelayEventSink;
use crate::inbox_reaper::{InboxReaper, InboxTimeoutPolicy};
use crate::outbox_reaper::OutboxReaper;
use crate::publisher::BrokerPublisher;
use crate::relay::{OutboxRelay, RelaySettings};
use crate::retention::RetentionSweeper;
use relay_config_and_utils::RelayConfig;
use relay_store::{InboxStore, OutboxStore, UnitOfWorkStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Owns one relay loop, both reapers and the retention sweeper.
pub struct RelayManager {
    relay: OutboxRelay,
    outbox_reaper: Arc<OutboxReaper>,
    inbox_reaper: Arc<InboxReaper>,
    retention: Arc<RetentionSweeper>,
    outbox_reaper_period: Duration,
    inbox_reaper_period: Duration,
    retention_period: Duration,
}

impl RelayManager {
    /// Build every component over one store that implements all three contracts.
    pub fn from_config<S>(
        config: &RelayConfig,
        store: Arc<S>,
        publisher: Arc<dyn BrokerPublisher>,
        sink: Arc<dyn RelayEventSink>,
    ) -> Self
    where
        S: OutboxStore + InboxStore + UnitOfWorkStore + 'static,
    {
        let relay = OutboxRelay::new(
            store.clone(),
            store.clone(),
            publisher,
            sink.clone(),
            RelaySettings::from_config(config),
        );
        let outbox_reaper = OutboxReaper::new(
            store.clone(),
            config.outbox_stale_threshold(),
            sink.clone(),
        );
        let inbox_reaper = InboxReaper::new(
            store.clone(),
            InboxTimeoutPolicy::from_config(config),
            sink.clone(),
        );
        let retention =
            RetentionSweeper::new(store.clone(), store, config.retention_window(), sink);

        Self {
            relay,
            outbox_reaper: Arc::new(outbox_reaper),
            inbox_reaper: Arc::new(inbox_reaper),
            retention: Arc::new(retention),
            outbox_reaper_period: config.outbox_reaper_period(),
            inbox_reaper_period: config.inbox_reaper_period(),
            retention_period: config.retention_period(),
        }
    }

    pub fn relay(&self) -> &OutboxRelay {
        &self.relay
    }

    pub fn outbox_reaper(&self) -> &OutboxReaper {
        &self.outbox_reaper
    }

    pub fn inbox_reaper(&self) -> &InboxReaper {
        &self.inbox_reaper
    }

    pub fn retention(&self) -> &RetentionSweeper {
        &self.retention
    }

    /// Spawn all four loops and wait for them to stop.
    ///
    /// Every loop watches the same `shutdown` channel; none of them blocks
    /// another.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();

        let relay = self.relay.clone();
        let rx = shutdown.clone();
        tasks.spawn(async move { relay.run(rx).await });

        let reaper = self.outbox_reaper.clone();
        let period = self.outbox_reaper_period;
        let rx = shutdown.clone();
        tasks.spawn(async move { reaper.run(period, rx).await });

        let reaper = self.inbox_reaper.clone();
        let period = self.inbox_reaper_period;
        let rx = shutdown.clone();
        tasks.spawn(async move { reaper.run(period, rx).await });

        let sweeper = self.retention.clone();
        let period = self.retention_period;
        tasks.spawn(async move { sweeper.run(period, shutdown).await });

        info!(
            instance_id = %self.relay.settings().instance_id,
            "Relay manager started"
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Relay task exited abnormally");
            }
        }

        info!("Relay manager stopped");
    }
}
