//! Recovers outbox messages whose relay instance died mid-publish.

use crate::events::{RelayEvent, RelayEventSink};
use crate::schedule::run_periodically;
use crate::RelayResult;
use chrono::Utc;
use relay_store::OutboxStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Returns PROCESSING messages with a stale lease to PENDING.
pub struct OutboxReaper {
    outbox: Arc<dyn OutboxStore>,
    stale_threshold: Duration,
    sink: Arc<dyn RelayEventSink>,
}

impl OutboxReaper {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        stale_threshold: Duration,
        sink: Arc<dyn RelayEventSink>,
    ) -> Self {
        Self {
            outbox,
            stale_threshold,
            sink,
        }
    }

    /// One reclaim pass. Returns the number of messages reclaimed.
    pub async fn reap(&self) -> RelayResult<u64> {
        let threshold = chrono::Duration::from_std(self.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let older_than = Utc::now() - threshold;

        let reclaimed = self.outbox.reclaim_stale_messages(older_than).await?;
        if reclaimed > 0 {
            warn!(
                count = reclaimed,
                stale_threshold_secs = self.stale_threshold.as_secs(),
                "Reclaimed stale outbox messages"
            );
            self.sink.emit(RelayEvent::OutboxReclaimed { count: reclaimed });
        } else {
            debug!("No stale outbox messages");
        }
        Ok(reclaimed)
    }

    /// Reap every `period` until shutdown. Errors are logged and the
    /// schedule continues.
    pub async fn run(&self, period: Duration, shutdown: watch::Receiver<bool>) {
        run_periodically("outbox-reaper", period, shutdown, || async {
            if let Err(e) = self.reap().await {
                error!(error = %e, "Outbox reaper pass failed");
            }
        })
        .await;
    }
}
