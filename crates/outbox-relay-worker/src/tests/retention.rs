//! Retention sweeper tests.

use super::harness::{inbox_row, outbox_row, terminal_outbox_row, GatedStore};
use crate::events::{RecordingSink, RelayEvent};
use crate::retention::{RetentionReport, RetentionSweeper};
use chrono::Duration as ChronoDuration;
use relay_store::{InMemoryStore, InboxStatus, OutboxStatus};
use std::sync::Arc;
use std::time::Duration;

const SEVEN_DAYS: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn seed(store: &InMemoryStore) {
    let old = ChronoDuration::days(8);
    let recent = ChronoDuration::days(1);

    store
        .put_outbox_message(terminal_outbox_row("sent-old", OutboxStatus::Sent, old))
        .unwrap();
    store
        .put_outbox_message(terminal_outbox_row("dead-old", OutboxStatus::PermanentlyFailed, old))
        .unwrap();
    store
        .put_outbox_message(terminal_outbox_row("sent-recent", OutboxStatus::Sent, recent))
        .unwrap();
    let mut pending_old = outbox_row("pending-old", 0, None);
    pending_old.created_at = chrono::Utc::now() - old;
    store.put_outbox_message(pending_old).unwrap();

    store
        .put_inbox_message(inbox_row("i1", "webhook", InboxStatus::Processed, old))
        .unwrap();
    store
        .put_inbox_message(inbox_row("i2", "webhook", InboxStatus::Failed, old))
        .unwrap();
    store
        .put_inbox_message(inbox_row("i3", "webhook", InboxStatus::Processed, recent))
        .unwrap();
    store
        .put_inbox_message(inbox_row("i4", "webhook", InboxStatus::Processing, old))
        .unwrap();
}

#[tokio::test]
async fn sweep_deletes_only_old_terminal_records() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    seed(&store);

    let sweeper = RetentionSweeper::new(store.clone(), store.clone(), SEVEN_DAYS, sink.clone());
    let report = sweeper.sweep().await.unwrap().unwrap();

    assert_eq!(
        report,
        RetentionReport {
            outbox_deleted: 2,
            inbox_deleted: 2,
        }
    );

    let outbox: Vec<String> = store
        .outbox_snapshot()
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(outbox, vec!["pending-old".to_string(), "sent-recent".to_string()]);

    let inbox: Vec<String> = store
        .inbox_snapshot()
        .unwrap()
        .into_iter()
        .map(|r| r.message_id)
        .collect();
    assert_eq!(inbox, vec!["i3".to_string(), "i4".to_string()]);

    assert_eq!(
        sink.events(),
        vec![RelayEvent::RetentionSwept {
            outbox_deleted: 2,
            inbox_deleted: 2,
        }]
    );
}

#[tokio::test]
async fn second_sweep_deletes_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    seed(&store);

    let sweeper = RetentionSweeper::new(store.clone(), store.clone(), SEVEN_DAYS, sink);
    assert_eq!(sweeper.sweep().await.unwrap().unwrap().total(), 4);
    assert_eq!(sweeper.sweep().await.unwrap().unwrap().total(), 0);
}

#[tokio::test]
async fn overlapping_sweep_is_skipped() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store);
    let gated = Arc::new(GatedStore::gated(store.clone()));
    let sink = Arc::new(RecordingSink::new());
    let sweeper = Arc::new(RetentionSweeper::new(
        gated.clone(),
        store.clone(),
        SEVEN_DAYS,
        sink.clone(),
    ));

    let first = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.sweep().await })
    };
    gated.entered.notified().await;
    assert!(sweeper.is_running());

    // The first sweep is parked inside the outbox delete.
    assert!(sweeper.sweep().await.unwrap().is_none());
    assert_eq!(sink.events(), vec![RelayEvent::RetentionSkipped]);

    gated.release.notify_one();
    let report = first.await.unwrap().unwrap().unwrap();
    assert_eq!(report.total(), 4);
    assert!(!sweeper.is_running());
}

#[tokio::test]
async fn failed_sweep_clears_running_flag() {
    let store = Arc::new(InMemoryStore::new());
    let failing = Arc::new(GatedStore {
        fail_delete: true,
        ..GatedStore::new(store.clone())
    });
    let sink = Arc::new(RecordingSink::new());
    let sweeper = RetentionSweeper::new(failing, store.clone(), SEVEN_DAYS, sink.clone());

    assert!(sweeper.sweep().await.is_err());
    assert!(!sweeper.is_running());

    // A later sweep is not skipped.
    assert!(sweeper.sweep().await.is_err());
    assert!(!sink
        .events()
        .contains(&RelayEvent::RetentionSkipped));
}

#[tokio::test]
async fn failed_outbox_delete_still_sweeps_inbox() {
    let store = Arc::new(InMemoryStore::new());
    seed(&store);
    let failing = Arc::new(GatedStore {
        fail_delete: true,
        ..GatedStore::new(store.clone())
    });
    let sink = Arc::new(RecordingSink::new());
    let sweeper = RetentionSweeper::new(failing, store.clone(), SEVEN_DAYS, sink.clone());

    assert!(sweeper.sweep().await.is_err());

    let inbox: Vec<String> = store
        .inbox_snapshot()
        .unwrap()
        .into_iter()
        .map(|r| r.message_id)
        .collect();
    assert_eq!(inbox, vec!["i3".to_string(), "i4".to_string()]);
    // Outbox rows are untouched and no sweep event is reported.
    assert_eq!(store.outbox_snapshot().unwrap().len(), 4);
    assert!(sink.is_empty());
}
