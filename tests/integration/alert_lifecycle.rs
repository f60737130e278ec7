//! Alert rule evaluation, incident lifecycle and notification emission

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use pulsewatch::alert::AlertHandle;
use pulsewatch::bus::Bus;
use pulsewatch::messages::{subject, AlertSeverity, NotificationRequest, RuleLifecycle};
use pulsewatch::storage::{CheckResultRow, IncidentRow, IncidentStatus, StorageBackend};
use uuid::Uuid;

use crate::helpers::*;

async fn drain_notifications(sub: &mut pulsewatch::bus::Subscription) -> Vec<NotificationRequest> {
    let mut out = Vec::new();
    while let Ok(Some(n)) = tokio::time::timeout(
        Duration::from_millis(100),
        sub.recv::<NotificationRequest>(),
    )
    .await
    {
        out.push(n);
    }
    out
}

async fn publish_outcomes(bus: &Bus, monitor_id: Uuid, outcomes: &[bool]) {
    for &success in outcomes {
        let result = check_result(monitor_id, success, 50, Utc::now());
        bus.publish(subject::CHECK_RESULT, &result).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn consecutive_count_gates_incident_opening() {
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());
    let mut notifications = bus.subscribe(subject::NOTIFICATIONS_SEND);

    let monitor_id = Uuid::new_v4();
    let rule = availability_rule(monitor_id, 3);
    let handle = AlertHandle::spawn(Arc::clone(&bus), Arc::clone(&store), vec![rule.clone()]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // F, F, S: the success resets the streak, nothing may fire.
    publish_outcomes(&bus, monitor_id, &[false, false, true]).await;
    assert!(drain_notifications(&mut notifications).await.is_empty());
    let state = handle.rule_state(rule.id).await.unwrap();
    assert_eq!(state.streak, 0);
    assert!(state.open_incident.is_none());

    // F, F, F: the third consecutive failure fires exactly once.
    publish_outcomes(&bus, monitor_id, &[false, false, false]).await;
    let fired = drain_notifications(&mut notifications).await;
    assert_eq!(fired.len(), 1, "exactly one notification after the streak");
    assert_eq!(fired[0].alert_rule_id, rule.id);
    assert_eq!(fired[0].severity, AlertSeverity::Critical);

    let state = handle.rule_state(rule.id).await.unwrap();
    assert_eq!(state.streak, 3);
    let incident_id = state.open_incident.expect("incident open");
    assert_eq!(fired[0].incident_id, incident_id);

    let open = store.open_incidents().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, incident_id);
    assert_eq!(open[0].status, IncidentStatus::Open);

    handle.shutdown().await;
}

#[tokio::test]
async fn first_success_resolves_the_open_incident() {
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());
    let mut notifications = bus.subscribe(subject::NOTIFICATIONS_SEND);

    let monitor_id = Uuid::new_v4();
    let rule = availability_rule(monitor_id, 3);
    let handle = AlertHandle::spawn(Arc::clone(&bus), Arc::clone(&store), vec![rule.clone()]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    publish_outcomes(&bus, monitor_id, &[false, false, false]).await;
    assert_eq!(drain_notifications(&mut notifications).await.len(), 1);

    // The first non-trigger closes the incident; a second changes nothing.
    publish_outcomes(&bus, monitor_id, &[true, true]).await;

    let state = handle.rule_state(rule.id).await.unwrap();
    assert_eq!(state.streak, 0);
    assert!(state.open_incident.is_none());
    assert!(store.open_incidents().await.unwrap().is_empty());

    // Resolution itself emits no notification.
    assert!(drain_notifications(&mut notifications).await.is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn at_most_one_incident_is_open_per_rule() {
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());

    let monitor_id = Uuid::new_v4();
    let rule = availability_rule(monitor_id, 1);
    let handle = AlertHandle::spawn(Arc::clone(&bus), Arc::clone(&store), vec![rule.clone()]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Repeated firing keeps updating the same incident.
    publish_outcomes(&bus, monitor_id, &[false, false, false, false]).await;
    assert_eq!(store.open_incidents().await.unwrap().len(), 1);

    // Resolve, then fail again: a fresh incident, but still only one open.
    publish_outcomes(&bus, monitor_id, &[true, false, false]).await;
    let open = store.open_incidents().await.unwrap();
    assert_eq!(open.len(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn severity_escalation_renotifies_on_the_same_incident() {
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());
    let mut notifications = bus.subscribe(subject::NOTIFICATIONS_SEND);

    let monitor_id = Uuid::new_v4();
    let mut rule = availability_rule(monitor_id, 1);
    rule.severity = AlertSeverity::Warning;
    let handle = AlertHandle::spawn(Arc::clone(&bus), Arc::clone(&store), vec![rule.clone()]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    publish_outcomes(&bus, monitor_id, &[false]).await;
    let opened = drain_notifications(&mut notifications).await;
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].severity, AlertSeverity::Warning);

    // The rule is edited to critical while the incident stays open.
    rule.severity = AlertSeverity::Critical;
    bus.publish(subject::RULE_UPDATE, &rule).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    publish_outcomes(&bus, monitor_id, &[false]).await;
    let escalated = drain_notifications(&mut notifications).await;
    assert_eq!(escalated.len(), 1, "escalation must renotify");
    assert_eq!(escalated[0].severity, AlertSeverity::Critical);
    assert_eq!(escalated[0].incident_id, opened[0].incident_id);

    handle.shutdown().await;
}

#[tokio::test]
async fn cooldown_suppresses_refiring_but_not_resolution() {
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());
    let mut notifications = bus.subscribe(subject::NOTIFICATIONS_SEND);

    let monitor_id = Uuid::new_v4();
    let mut rule = availability_rule(monitor_id, 1);
    rule.cooldown_minutes = 10;
    let handle = AlertHandle::spawn(Arc::clone(&bus), Arc::clone(&store), vec![rule.clone()]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    publish_outcomes(&bus, monitor_id, &[false, false, false]).await;
    assert_eq!(drain_notifications(&mut notifications).await.len(), 1);

    // Still inside the cooldown, a success must resolve regardless.
    publish_outcomes(&bus, monitor_id, &[true]).await;
    assert!(store.open_incidents().await.unwrap().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn deleted_rules_are_evicted_from_the_cache() {
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());

    let mut rule = availability_rule(Uuid::new_v4(), 1);
    let handle = AlertHandle::spawn(Arc::clone(&bus), Arc::clone(&store), vec![rule.clone()]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.rule_state(rule.id).await.is_some());

    rule.status = RuleLifecycle::Deleted;
    bus.publish(subject::RULE_UPDATE, &rule).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(handle.rule_state(rule.id).await.is_none());

    handle.shutdown().await;
}

#[tokio::test]
async fn open_incidents_are_rematerialized_after_restart() {
    let store = memory_store().await;
    let monitor_id = Uuid::new_v4();
    let rule = availability_rule(monitor_id, 3);

    // Incident left open by a previous process.
    let incident_id = Uuid::new_v4();
    store
        .insert_incident(IncidentRow {
            id: incident_id,
            alert_rule_id: rule.id,
            monitor_id,
            status: IncidentStatus::Open,
            severity: AlertSeverity::Critical,
            start_time: Utc::now() - TimeDelta::minutes(30),
            end_time: None,
            last_update: Utc::now() - TimeDelta::minutes(5),
        })
        .await
        .unwrap();

    let bus = Arc::new(Bus::default());
    let handle = AlertHandle::spawn(Arc::clone(&bus), Arc::clone(&store), vec![rule.clone()]);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The restarted manager owns the incident again, with a reset streak.
    let state = handle.rule_state(rule.id).await.unwrap();
    assert_eq!(state.streak, 0);
    assert_eq!(state.open_incident, Some(incident_id));

    // A healthy result resolves the inherited incident.
    publish_outcomes(&bus, monitor_id, &[true]).await;
    assert!(store.open_incidents().await.unwrap().is_empty());

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn windowed_rules_fire_on_failure_rate() {
    let store = memory_store().await;
    let monitor_id = Uuid::new_v4();

    // 4 of 5 checks in the window failed: 80% failure rate.
    for i in 0..5i64 {
        store
            .insert_check_result(CheckResultRow {
                monitor_id,
                timestamp: Utc::now() - TimeDelta::minutes(i),
                worker_id: Uuid::new_v4(),
                duration_ms: 100,
                success: i == 0,
                error: None,
                details: Default::default(),
            })
            .await
            .unwrap();
    }

    let mut rule = availability_rule(monitor_id, 1);
    rule.window_minutes = Some(15);
    rule.threshold.max = Some(50.0);

    let bus = Arc::new(Bus::default());
    let mut notifications = bus.subscribe(subject::NOTIFICATIONS_SEND);
    let handle = AlertHandle::spawn(Arc::clone(&bus), Arc::clone(&store), vec![rule.clone()]);

    // The windowed job runs on a 1-minute cadence.
    tokio::time::sleep(Duration::from_secs(65)).await;

    let mut fired = Vec::new();
    for _ in 0..100 {
        fired = drain_notifications(&mut notifications).await;
        if !fired.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(fired.len(), 1, "window breach fires once");
    assert!(fired[0].message.contains("failure rate"));
    assert_eq!(store.open_incidents().await.unwrap().len(), 1);

    handle.shutdown().await;
}
