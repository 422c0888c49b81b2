//! Per-consumer recovery of inbox records stuck in PROCESSING.
//!
//! Consumers differ wildly in how long a healthy delivery takes, so each
//! consumer gets its own staleness threshold. The reaper issues one reclaim
//! per consumer and flags any consumer whose reclaim count reaches the
//! alert threshold in a single pass.

use crate::events::{RelayEvent, RelayEventSink};
use crate::schedule::run_periodically;
use chrono::Utc;
use relay_config_and_utils::RelayConfig;
use relay_store::InboxStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Consumer id → staleness threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxTimeoutPolicy {
    pub thresholds: BTreeMap<String, Duration>,
    /// Applied to consumers holding PROCESSING records that have no entry
    /// in `thresholds`. `None` leaves such consumers alone.
    pub default_threshold: Option<Duration>,
    /// Reclaims per consumer per pass at which a spike is reported.
    /// `0` disables spike reporting.
    pub alert_threshold: u64,
}

impl Default for InboxTimeoutPolicy {
    fn default() -> Self {
        Self {
            thresholds: BTreeMap::new(),
            default_threshold: None,
            alert_threshold: 10,
        }
    }
}

impl InboxTimeoutPolicy {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            thresholds: config.inbox_consumer_timeouts(),
            default_threshold: config.inbox_default_timeout(),
            alert_threshold: config.inbox_alert_threshold,
        }
    }

    pub fn with_consumer(mut self, consumer_id: impl Into<String>, threshold: Duration) -> Self {
        self.thresholds.insert(consumer_id.into(), threshold);
        self
    }

    /// Threshold for `consumer_id`, falling back to the default.
    pub fn threshold_for(&self, consumer_id: &str) -> Option<Duration> {
        self.thresholds
            .get(consumer_id)
            .copied()
            .or(self.default_threshold)
    }

    fn is_spike(&self, reclaimed: u64) -> bool {
        self.alert_threshold > 0 && reclaimed >= self.alert_threshold
    }
}

/// Outcome of one inbox reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboxReapReport {
    /// Reclaimed count per consumer that was swept successfully.
    pub reclaimed: BTreeMap<String, u64>,
    /// Consumers whose reclaim query failed.
    pub failed: Vec<String>,
    /// Listing consumers without a configured threshold failed; only the
    /// configured consumers were swept.
    pub listing_failed: bool,
}

impl InboxReapReport {
    pub fn total(&self) -> u64 {
        self.reclaimed.values().sum()
    }
}

pub struct InboxReaper {
    inbox: Arc<dyn InboxStore>,
    policy: InboxTimeoutPolicy,
    sink: Arc<dyn RelayEventSink>,
}

impl InboxReaper {
    pub fn new(
        inbox: Arc<dyn InboxStore>,
        policy: InboxTimeoutPolicy,
        sink: Arc<dyn RelayEventSink>,
    ) -> Self {
        Self {
            inbox,
            policy,
            sink,
        }
    }

    pub fn policy(&self) -> &InboxTimeoutPolicy {
        &self.policy
    }

    /// One pass over every consumer with a known threshold.
    ///
    /// Failures are recorded in the report and never stop the pass: a
    /// failing consumer lands in `failed`, and a failed consumer listing
    /// still sweeps every configured consumer.
    pub async fn reap(&self) -> InboxReapReport {
        let mut report = InboxReapReport::default();
        let mut consumers: Vec<String> = self.policy.thresholds.keys().cloned().collect();
        if self.policy.default_threshold.is_some() {
            match self.inbox.processing_consumers().await {
                Ok(listed) => consumers.extend(
                    listed
                        .into_iter()
                        .filter(|c| !self.policy.thresholds.contains_key(c)),
                ),
                Err(e) => {
                    error!(error = %e, "Listing inbox consumers failed, sweeping configured consumers only");
                    report.listing_failed = true;
                }
            }
        }

        let now = Utc::now();

        for consumer_id in consumers {
            let Some(threshold) = self.policy.threshold_for(&consumer_id) else {
                continue;
            };
            let threshold =
                chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::days(365));

            match self
                .inbox
                .reclaim_stale_messages_by_consumer(&consumer_id, now - threshold)
                .await
            {
                Ok(0) => {
                    debug!(consumer_id = %consumer_id, "No stale inbox messages");
                    report.reclaimed.insert(consumer_id, 0);
                }
                Ok(count) => {
                    info!(consumer_id = %consumer_id, count, "Reclaimed stale inbox messages");
                    self.sink.emit(RelayEvent::InboxReclaimed {
                        consumer_id: consumer_id.clone(),
                        count,
                    });
                    if self.policy.is_spike(count) {
                        warn!(
                            consumer_id = %consumer_id,
                            count,
                            alert_threshold = self.policy.alert_threshold,
                            "Inbox reclaim spike, consumer may be crash looping"
                        );
                        self.sink.emit(RelayEvent::InboxReclaimSpike {
                            consumer_id: consumer_id.clone(),
                            count,
                            alert_threshold: self.policy.alert_threshold,
                        });
                    }
                    report.reclaimed.insert(consumer_id, count);
                }
                Err(e) => {
                    error!(consumer_id = %consumer_id, error = %e, "Inbox reclaim failed");
                    report.failed.push(consumer_id);
                }
            }
        }

        report
    }

    /// Reap every `period` until shutdown.
    pub async fn run(&self, period: Duration, shutdown: watch::Receiver<bool>) {
        run_periodically("inbox-reaper", period, shutdown, || async {
            let report = self.reap().await;
            if !report.failed.is_empty() || report.listing_failed {
                warn!(
                    failed = ?report.failed,
                    listing_failed = report.listing_failed,
                    "Inbox reaper pass incomplete"
                );
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_lookup_falls_back_to_default() {
        let policy = InboxTimeoutPolicy::default()
            .with_consumer("webhook", Duration::from_secs(60));
        assert_eq!(policy.threshold_for("webhook"), Some(Duration::from_secs(60)));
        assert_eq!(policy.threshold_for("batch"), None);

        let policy = InboxTimeoutPolicy {
            default_threshold: Some(Duration::from_secs(600)),
            ..policy
        };
        assert_eq!(policy.threshold_for("batch"), Some(Duration::from_secs(600)));
    }

    #[test]
    fn spike_threshold_is_inclusive_and_zero_disables() {
        let policy = InboxTimeoutPolicy::default();
        assert!(!policy.is_spike(9));
        assert!(policy.is_spike(10));

        let disabled = InboxTimeoutPolicy {
            alert_threshold: 0,
            ..InboxTimeoutPolicy::default()
        };
        assert!(!disabled.is_spike(1000));
    }

    #[test]
    fn policy_from_config() {
        let mut config = RelayConfig::new();
        config
            .inbox_consumer_timeouts_secs
            .insert("batch".to_string(), 7200);
        config.inbox_default_timeout_secs = Some(300);
        config.inbox_alert_threshold = 4;

        let policy = InboxTimeoutPolicy::from_config(&config);
        assert_eq!(policy.threshold_for("batch"), Some(Duration::from_secs(7200)));
        assert_eq!(policy.threshold_for("other"), Some(Duration::from_secs(300)));
        assert_eq!(policy.alert_threshold, 4);
    }
}
