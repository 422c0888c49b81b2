//! Outbox and inbox reaper tests.

use super::harness::{inbox_row, leased_outbox_row, outbox_row, FlakyInboxStore};
use crate::events::{RecordingSink, RelayEvent};
use crate::inbox_reaper::{InboxReaper, InboxTimeoutPolicy};
use crate::outbox_reaper::OutboxReaper;
use chrono::Duration as ChronoDuration;
use relay_store::{InMemoryStore, InboxStatus, InboxStore, OutboxStatus, OutboxStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn outbox_reaper(store: &Arc<InMemoryStore>, sink: &Arc<RecordingSink>) -> OutboxReaper {
    OutboxReaper::new(store.clone(), Duration::from_secs(5 * 60), sink.clone())
}

// =============================================================================
// Outbox reaper
// =============================================================================

#[tokio::test]
async fn outbox_reaper_respects_lease_window() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    store
        .put_outbox_message(leased_outbox_row("fresh", ChronoDuration::minutes(1)))
        .unwrap();
    store
        .put_outbox_message(leased_outbox_row("stale", ChronoDuration::minutes(6)))
        .unwrap();

    let reclaimed = outbox_reaper(&store, &sink).reap().await.unwrap();
    assert_eq!(reclaimed, 1);

    let fresh = store.get_message("fresh").await.unwrap().unwrap();
    assert_eq!(fresh.status, OutboxStatus::Processing);
    assert_eq!(fresh.locked_by.as_deref(), Some("relay-dead"));

    let stale = store.get_message("stale").await.unwrap().unwrap();
    assert_eq!(stale.status, OutboxStatus::Pending);
    assert!(stale.locked_by.is_none());
    assert!(stale.next_attempt_at <= chrono::Utc::now());

    assert_eq!(sink.events(), vec![RelayEvent::OutboxReclaimed { count: 1 }]);
}

#[tokio::test]
async fn outbox_reaper_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    store
        .put_outbox_message(leased_outbox_row("stale", ChronoDuration::minutes(10)))
        .unwrap();
    let reaper = outbox_reaper(&store, &sink);

    assert_eq!(reaper.reap().await.unwrap(), 1);
    assert_eq!(reaper.reap().await.unwrap(), 0);
    assert_eq!(sink.len(), 1);
}

#[tokio::test]
async fn outbox_reaper_ignores_non_processing_rows() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    let mut failed = outbox_row("failed", 1, None);
    failed.locked_at = Some(chrono::Utc::now() - ChronoDuration::hours(1));
    store.put_outbox_message(failed).unwrap();

    assert_eq!(outbox_reaper(&store, &sink).reap().await.unwrap(), 0);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn reclaimed_message_keeps_attempt_count() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    let mut row = leased_outbox_row("m1", ChronoDuration::minutes(30));
    row.attempts = 2;
    store.put_outbox_message(row).unwrap();

    outbox_reaper(&store, &sink).reap().await.unwrap();

    let msg = store.get_message("m1").await.unwrap().unwrap();
    assert_eq!(msg.status, OutboxStatus::Pending);
    assert_eq!(msg.attempts, 2);
}

// =============================================================================
// Inbox reaper
// =============================================================================

fn policy() -> InboxTimeoutPolicy {
    InboxTimeoutPolicy::default()
        .with_consumer("webhook", Duration::from_secs(60))
        .with_consumer("batch", Duration::from_secs(2 * 60 * 60))
}

#[tokio::test]
async fn inbox_reaper_applies_per_consumer_thresholds() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    store
        .put_inbox_message(inbox_row("m1", "webhook", InboxStatus::Processing, ChronoDuration::minutes(3)))
        .unwrap();
    store
        .put_inbox_message(inbox_row("m2", "webhook", InboxStatus::Processing, ChronoDuration::seconds(20)))
        .unwrap();
    store
        .put_inbox_message(inbox_row("m3", "batch", InboxStatus::Processing, ChronoDuration::minutes(30)))
        .unwrap();

    let reaper = InboxReaper::new(store.clone(), policy(), sink.clone());
    let report = reaper.reap().await;

    assert_eq!(report.reclaimed["webhook"], 1);
    assert_eq!(report.reclaimed["batch"], 0);
    assert_eq!(report.total(), 1);
    assert!(report.failed.is_empty());

    let status = |m: &str, c: &str| {
        let store = store.clone();
        let (m, c) = (m.to_string(), c.to_string());
        async move { store.get_record(&m, &c).await.unwrap().unwrap().status }
    };
    assert_eq!(status("m1", "webhook").await, InboxStatus::Pending);
    assert_eq!(status("m2", "webhook").await, InboxStatus::Processing);
    assert_eq!(status("m3", "batch").await, InboxStatus::Processing);

    assert_eq!(
        sink.events(),
        vec![RelayEvent::InboxReclaimed {
            consumer_id: "webhook".to_string(),
            count: 1,
        }]
    );
}

#[tokio::test]
async fn inbox_reaper_reports_reclaim_spike() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    for i in 0..12 {
        store
            .put_inbox_message(inbox_row(
                &format!("m{i}"),
                "webhook",
                InboxStatus::Processing,
                ChronoDuration::minutes(5),
            ))
            .unwrap();
    }
    // Below the alert threshold for its consumer.
    store
        .put_inbox_message(inbox_row("b1", "batch", InboxStatus::Processing, ChronoDuration::hours(3)))
        .unwrap();

    let reaper = InboxReaper::new(store.clone(), policy(), sink.clone());
    let report = reaper.reap().await;
    assert_eq!(report.reclaimed["webhook"], 12);
    assert_eq!(report.reclaimed["batch"], 1);

    let spikes: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, RelayEvent::InboxReclaimSpike { .. }))
        .collect();
    assert_eq!(
        spikes,
        vec![RelayEvent::InboxReclaimSpike {
            consumer_id: "webhook".to_string(),
            count: 12,
            alert_threshold: 10,
        }]
    );
}

#[tokio::test]
async fn unconfigured_consumers_need_a_default_threshold() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    store
        .put_inbox_message(inbox_row("m1", "reports", InboxStatus::Processing, ChronoDuration::hours(1)))
        .unwrap();

    let without_default = InboxReaper::new(store.clone(), policy(), sink.clone());
    let report = without_default.reap().await;
    assert!(!report.reclaimed.contains_key("reports"));
    assert_eq!(
        store.get_record("m1", "reports").await.unwrap().unwrap().status,
        InboxStatus::Processing
    );

    let with_default = InboxReaper::new(
        store.clone(),
        InboxTimeoutPolicy {
            default_threshold: Some(Duration::from_secs(10 * 60)),
            ..policy()
        },
        sink.clone(),
    );
    let report = with_default.reap().await;
    assert_eq!(report.reclaimed["reports"], 1);
    assert_eq!(
        store.get_record("m1", "reports").await.unwrap().unwrap().status,
        InboxStatus::Pending
    );
}

#[tokio::test]
async fn failing_consumer_does_not_stop_the_pass() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    store
        .put_inbox_message(inbox_row("m1", "webhook", InboxStatus::Processing, ChronoDuration::minutes(3)))
        .unwrap();
    store
        .put_inbox_message(inbox_row("m2", "batch", InboxStatus::Processing, ChronoDuration::hours(3)))
        .unwrap();

    let inbox = Arc::new(FlakyInboxStore {
        inner: store.clone(),
        broken: HashSet::from(["batch".to_string()]),
        fail_listing: false,
    });
    let reaper = InboxReaper::new(inbox, policy(), sink);
    let report = reaper.reap().await;

    assert_eq!(report.failed, vec!["batch".to_string()]);
    assert_eq!(report.reclaimed["webhook"], 1);
    assert_eq!(
        store.get_record("m1", "webhook").await.unwrap().unwrap().status,
        InboxStatus::Pending
    );
}

#[tokio::test]
async fn failed_consumer_listing_still_sweeps_configured_consumers() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    store
        .put_inbox_message(inbox_row("m1", "webhook", InboxStatus::Processing, ChronoDuration::minutes(3)))
        .unwrap();
    store
        .put_inbox_message(inbox_row("m2", "reports", InboxStatus::Processing, ChronoDuration::hours(1)))
        .unwrap();

    let inbox = Arc::new(FlakyInboxStore {
        inner: store.clone(),
        broken: HashSet::new(),
        fail_listing: true,
    });
    let policy = InboxTimeoutPolicy {
        default_threshold: Some(Duration::from_secs(10 * 60)),
        ..policy()
    };
    let report = InboxReaper::new(inbox, policy, sink.clone()).reap().await;

    assert!(report.listing_failed);
    assert!(report.failed.is_empty());
    assert_eq!(report.reclaimed["webhook"], 1);
    assert!(!report.reclaimed.contains_key("reports"));
    assert_eq!(
        store.get_record("m1", "webhook").await.unwrap().unwrap().status,
        InboxStatus::Pending
    );
    assert_eq!(
        store.get_record("m2", "reports").await.unwrap().unwrap().status,
        InboxStatus::Processing
    );
    assert_eq!(
        sink.events(),
        vec![RelayEvent::InboxReclaimed {
            consumer_id: "webhook".to_string(),
            count: 1,
        }]
    );
}

#[tokio::test]
async fn inbox_reaper_ignores_terminal_records() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    store
        .put_inbox_message(inbox_row("m1", "webhook", InboxStatus::Processed, ChronoDuration::hours(1)))
        .unwrap();
    store
        .put_inbox_message(inbox_row("m2", "webhook", InboxStatus::Failed, ChronoDuration::hours(1)))
        .unwrap();

    let reaper = InboxReaper::new(store.clone(), policy(), sink.clone());
    assert_eq!(reaper.reap().await.total(), 0);
    assert!(sink.is_empty());
}
