//! Notification persistence, retry backoff and terminal failure

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pulsewatch::bus::Bus;
use pulsewatch::messages::{subject, AlertSeverity, NotificationRequest};
use pulsewatch::notify::providers::NotificationProvider;
use pulsewatch::notify::{NotifyHandle, MAX_RETRIES};
use pulsewatch::storage::{NotificationRow, NotificationStatus, StorageBackend};
use uuid::Uuid;

use crate::helpers::*;

/// Provider that fails a configured number of times before succeeding.
struct FlakyProvider {
    failures_before_success: usize,
    calls: AtomicUsize,
}

impl FlakyProvider {
    fn new(failures_before_success: usize) -> Self {
        Self {
            failures_before_success,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NotificationProvider for FlakyProvider {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn send(&self, _notification: &NotificationRow) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            anyhow::bail!("simulated outage (call {call})");
        }
        Ok(())
    }
}

fn request(id: Uuid, channels: &[&str]) -> NotificationRequest {
    NotificationRequest {
        id: Some(id),
        incident_id: Uuid::new_v4(),
        alert_rule_id: Uuid::new_v4(),
        monitor_id: Uuid::new_v4(),
        channels: channels.iter().map(|c| c.to_string()).collect(),
        message: "monitor down".to_string(),
        severity: AlertSeverity::Critical,
        timestamp: Utc::now(),
    }
}

/// Poll the store until the notification satisfies `pred`, advancing paused
/// time by `step` per attempt.
async fn wait_for(
    store: &Arc<dyn StorageBackend>,
    id: Uuid,
    step: Duration,
    attempts: usize,
    pred: impl Fn(&NotificationRow) -> bool,
) -> NotificationRow {
    for _ in 0..attempts {
        if let Some(row) = store.get_notification(id).await.unwrap() {
            if pred(&row) {
                return row;
            }
        }
        tokio::time::sleep(step).await;
    }
    panic!("notification {id} never reached the expected state");
}

#[tokio::test(start_paused = true)]
async fn two_failures_then_success_walks_pending_retry_retry_sent() {
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());
    let provider = Arc::new(FlakyProvider::new(2));

    let mut providers: std::collections::HashMap<String, Arc<dyn NotificationProvider>> =
        std::collections::HashMap::new();
    providers.insert("flaky".to_string(), Arc::clone(&provider) as _);
    let handle = NotifyHandle::spawn(Arc::clone(&bus), Arc::clone(&store), providers);

    let id = Uuid::new_v4();
    bus.publish(subject::NOTIFICATIONS_SEND, &request(id, &["flaky"]))
        .unwrap();

    // Initial attempt fails: persisted, moved to retry #1 (due in ~1min).
    let row = wait_for(&store, id, Duration::from_millis(100), 200, |r| {
        r.status == NotificationStatus::Retry && r.retry_count == 1
    })
    .await;
    let first_retry_stamp = row.last_retry.expect("retry stamp set");

    // Retry #1 fails too: scheduled again (~2min).
    let row = wait_for(&store, id, Duration::from_secs(5), 200, |r| {
        r.retry_count == 2
    })
    .await;
    assert_eq!(row.status, NotificationStatus::Retry);
    assert!(row.last_retry.expect("retry stamp") >= first_retry_stamp);

    // Retry #2 succeeds.
    let row = wait_for(&store, id, Duration::from_secs(5), 200, |r| {
        r.status == NotificationStatus::Sent
    })
    .await;
    assert_eq!(row.retry_count, 2, "retry counter stops at the last failure");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_go_terminal() {
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());
    let provider = Arc::new(FlakyProvider::new(usize::MAX));

    let mut providers: std::collections::HashMap<String, Arc<dyn NotificationProvider>> =
        std::collections::HashMap::new();
    providers.insert("flaky".to_string(), Arc::clone(&provider) as _);
    let handle = NotifyHandle::spawn(Arc::clone(&bus), Arc::clone(&store), providers);

    let id = Uuid::new_v4();
    bus.publish(subject::NOTIFICATIONS_SEND, &request(id, &["flaky"]))
        .unwrap();

    // Backoff doubles up to 2^7 minutes; advance generously.
    let row = wait_for(&store, id, Duration::from_secs(60), 600, |r| {
        r.status == NotificationStatus::Failed
    })
    .await;

    assert_eq!(row.retry_count, MAX_RETRIES);
    // Initial attempt plus one call per retry, then silence.
    assert_eq!(
        provider.calls.load(Ordering::SeqCst),
        1 + MAX_RETRIES as usize
    );
    assert_eq!(handle.queue_depth().await, 0);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unfinished_notifications_are_recovered_on_startup() {
    let store = memory_store().await;

    // A previous process persisted this and crashed before delivering.
    let id = Uuid::new_v4();
    let mut row = NotificationRow::from_request(request(id, &["flaky"]));
    row.status = NotificationStatus::Retry;
    row.retry_count = 1;
    row.last_retry = Some(Utc::now());
    store.insert_notification(row).await.unwrap();

    let bus = Arc::new(Bus::default());
    let provider = Arc::new(FlakyProvider::new(0));
    let mut providers: std::collections::HashMap<String, Arc<dyn NotificationProvider>> =
        std::collections::HashMap::new();
    providers.insert("flaky".to_string(), Arc::clone(&provider) as _);
    let handle = NotifyHandle::spawn(Arc::clone(&bus), Arc::clone(&store), providers);

    // The recovered entry is due immediately; the 30s poll picks it up.
    let row = wait_for(&store, id, Duration::from_secs(5), 200, |r| {
        r.status == NotificationStatus::Sent
    })
    .await;
    assert_eq!(row.retry_count, 1, "recovery does not invent extra retries");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn unknown_channels_are_logged_and_skipped() {
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());
    let handle = NotifyHandle::spawn(
        Arc::clone(&bus),
        Arc::clone(&store),
        std::collections::HashMap::new(),
    );

    let id = Uuid::new_v4();
    bus.publish(subject::NOTIFICATIONS_SEND, &request(id, &["carrier-pigeon"]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // An unregistered channel is an operator error, not a transient fault:
    // nothing to retry, the notification completes.
    let row = store.get_notification(id).await.unwrap().unwrap();
    assert_eq!(row.status, NotificationStatus::Sent);
    assert_eq!(row.retry_count, 0);

    handle.shutdown().await;
}
