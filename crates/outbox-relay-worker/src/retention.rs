//! Deletion of terminal outbox and inbox records past the retention window.
//!
//! Overlapping sweeps within one process are prevented by a reentrancy flag.
//! Separate relay processes may still sweep concurrently; both deletes only
//! remove rows already terminal and past the window, so an overlapping sweep
//! deletes nothing the other would have kept.

use crate::events::{RelayEvent, RelayEventSink};
use crate::schedule::run_periodically;
use crate::RelayResult;
use chrono::Utc;
use relay_store::{InboxStore, OutboxStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub outbox_deleted: u64,
    pub inbox_deleted: u64,
}

impl RetentionReport {
    pub fn total(&self) -> u64 {
        self.outbox_deleted + self.inbox_deleted
    }
}

pub struct RetentionSweeper {
    outbox: Arc<dyn OutboxStore>,
    inbox: Arc<dyn InboxStore>,
    retention: Duration,
    sink: Arc<dyn RelayEventSink>,
    running: AtomicBool,
}

/// Clears the reentrancy flag on drop, including on error or panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetentionSweeper {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        inbox: Arc<dyn InboxStore>,
        retention: Duration,
        sink: Arc<dyn RelayEventSink>,
    ) -> Self {
        Self {
            outbox,
            inbox,
            retention,
            sink,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Delete terminal rows older than the retention window.
    ///
    /// Returns `None` without touching the stores when a sweep is already
    /// in progress in this process.
    ///
    /// Both deletes always run; if either fails, the first error is returned
    /// after the other has finished.
    pub async fn sweep(&self) -> RelayResult<Option<RetentionReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Retention sweep already running, skipping");
            self.sink.emit(RelayEvent::RetentionSkipped);
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);

        let window = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let threshold = Utc::now() - window;

        // Both tables are swept even when one delete fails.
        let outbox = self.outbox.delete_processed_older_than(threshold).await;
        if let Err(e) = &outbox {
            error!(error = %e, "Outbox retention delete failed");
        }
        let inbox = self.inbox.delete_processed_older_than(threshold).await;
        if let Err(e) = &inbox {
            error!(error = %e, "Inbox retention delete failed");
        }
        let outbox_deleted = outbox?;
        let inbox_deleted = inbox?;

        let report = RetentionReport {
            outbox_deleted,
            inbox_deleted,
        };

        info!(
            outbox_deleted,
            inbox_deleted,
            retention_days = self.retention.as_secs() / 86_400,
            "Retention sweep complete"
        );
        self.sink.emit(RelayEvent::RetentionSwept {
            outbox_deleted,
            inbox_deleted,
        });

        Ok(Some(report))
    }

    /// Sweep every `period` until shutdown.
    pub async fn run(&self, period: Duration, shutdown: watch::Receiver<bool>) {
        run_periodically("retention-sweeper", period, shutdown, || async {
            if let Err(e) = self.sweep().await {
                error!(error = %e, "Retention sweep failed");
            }
        })
        .await;
    }
}
