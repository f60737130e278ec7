//! Ingestion idempotency and rollup aggregation against a real store

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use pulsewatch::bus::Bus;
use pulsewatch::ingest::IngestHandle;
use pulsewatch::messages::subject;
use pulsewatch::rollup::{aggregate_day, aggregate_hour};
use pulsewatch::storage::{CheckResultRow, Granularity, StorageBackend};
use uuid::Uuid;

use crate::helpers::*;

#[tokio::test]
async fn redelivered_results_upsert_into_one_row() {
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());
    let ingest = IngestHandle::spawn(Arc::clone(&bus), Arc::clone(&store));

    // Same (monitor, timestamp, worker) triple delivered twice, as the
    // at-least-once bus is allowed to do.
    let result = check_result(Uuid::new_v4(), true, 42, Utc::now());
    bus.publish(subject::CHECK_RESULT, &result).unwrap();
    bus.publish(subject::CHECK_RESULT, &result).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let rows = store
        .query_results(
            result.monitor_id,
            result.timestamp - TimeDelta::minutes(1),
            result.timestamp + TimeDelta::minutes(1),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1, "redelivery must not duplicate the row");

    ingest.shutdown().await;
}

#[tokio::test]
async fn results_for_unknown_monitors_are_persisted() {
    // The monitor may have been deleted between dispatch and arrival;
    // ingestion accepts the result regardless.
    let store = memory_store().await;
    let bus = Arc::new(Bus::default());
    let ingest = IngestHandle::spawn(Arc::clone(&bus), Arc::clone(&store));

    let orphan = check_result(Uuid::new_v4(), false, 17, Utc::now());
    bus.publish(subject::CHECK_RESULT, &orphan).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(ingest.ingested().await, 1);

    ingest.shutdown().await;
}

#[tokio::test]
async fn hourly_aggregation_is_idempotent() {
    let store = memory_store().await;
    let monitor_id = Uuid::new_v4();
    let hour = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();

    // 10 checks: 8 ok, 2 failed, durations 100..1000.
    for i in 0..10i64 {
        store
            .insert_check_result(CheckResultRow {
                monitor_id,
                timestamp: hour + TimeDelta::minutes(i * 5),
                worker_id: Uuid::new_v4(),
                duration_ms: (i + 1) * 100,
                success: i < 8,
                error: None,
                details: Default::default(),
            })
            .await
            .unwrap();
    }

    assert_eq!(aggregate_hour(store.as_ref(), hour).await.unwrap(), 1);
    let first = store
        .query_rollups(
            Granularity::Hour,
            monitor_id,
            hour,
            hour + TimeDelta::hours(1),
        )
        .await
        .unwrap();

    assert_eq!(aggregate_hour(store.as_ref(), hour).await.unwrap(), 1);
    let second = store
        .query_rollups(
            Granularity::Hour,
            monitor_id,
            hour,
            hour + TimeDelta::hours(1),
        )
        .await
        .unwrap();

    assert_eq!(first, second, "re-running a closed hour must be a no-op");

    let bucket = &first[0];
    assert_eq!(bucket.total_checks, 10);
    assert_eq!(bucket.successful_checks, 8);
    assert_eq!(bucket.failed_checks, 2);
    assert_eq!(bucket.min_duration_ms, 100);
    assert_eq!(bucket.max_duration_ms, 1000);
    assert_eq!(bucket.p95_duration_ms, 1000);
    assert!((bucket.avg_duration_ms - 550.0).abs() < f64::EPSILON);
    assert!((bucket.uptime_percentage - 80.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn late_results_do_not_reopen_closed_buckets_until_backfill() {
    let store = memory_store().await;
    let monitor_id = Uuid::new_v4();
    let hour = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();

    store
        .insert_check_result(CheckResultRow {
            monitor_id,
            timestamp: hour + TimeDelta::minutes(10),
            worker_id: Uuid::new_v4(),
            duration_ms: 100,
            success: true,
            error: None,
            details: Default::default(),
        })
        .await
        .unwrap();
    aggregate_hour(store.as_ref(), hour).await.unwrap();

    // A late result lands in the already-closed hour...
    store
        .insert_check_result(CheckResultRow {
            monitor_id,
            timestamp: hour + TimeDelta::minutes(20),
            worker_id: Uuid::new_v4(),
            duration_ms: 900,
            success: false,
            error: Some("timeout".to_string()),
            details: Default::default(),
        })
        .await
        .unwrap();

    // ...and aggregating the *next* hour leaves the closed bucket alone.
    aggregate_hour(store.as_ref(), hour + TimeDelta::hours(1))
        .await
        .unwrap();
    let buckets = store
        .query_rollups(
            Granularity::Hour,
            monitor_id,
            hour,
            hour + TimeDelta::hours(1),
        )
        .await
        .unwrap();
    assert_eq!(buckets[0].total_checks, 1);

    // The explicit backfill pass picks the late row up.
    aggregate_hour(store.as_ref(), hour).await.unwrap();
    let buckets = store
        .query_rollups(
            Granularity::Hour,
            monitor_id,
            hour,
            hour + TimeDelta::hours(1),
        )
        .await
        .unwrap();
    assert_eq!(buckets[0].total_checks, 2);
    assert_eq!(buckets[0].failed_checks, 1);
}

#[tokio::test]
async fn daily_buckets_weight_hourly_averages_by_volume() {
    let store = memory_store().await;
    let monitor_id = Uuid::new_v4();
    let day = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

    // Hour A: 3 fast checks. Hour B: 1 slow check.
    for i in 0..3i64 {
        store
            .insert_check_result(CheckResultRow {
                monitor_id,
                timestamp: day + TimeDelta::minutes(i),
                worker_id: Uuid::new_v4(),
                duration_ms: 100,
                success: true,
                error: None,
                details: Default::default(),
            })
            .await
            .unwrap();
    }
    store
        .insert_check_result(CheckResultRow {
            monitor_id,
            timestamp: day + TimeDelta::hours(5),
            worker_id: Uuid::new_v4(),
            duration_ms: 500,
            success: false,
            error: Some("timeout".to_string()),
            details: Default::default(),
        })
        .await
        .unwrap();

    aggregate_hour(store.as_ref(), day).await.unwrap();
    aggregate_hour(store.as_ref(), day + TimeDelta::hours(5))
        .await
        .unwrap();
    assert_eq!(aggregate_day(store.as_ref(), day).await.unwrap(), 1);

    let days = store
        .query_rollups(Granularity::Day, monitor_id, day, day + TimeDelta::days(1))
        .await
        .unwrap();
    assert_eq!(days.len(), 1);
    let bucket = &days[0];

    assert_eq!(bucket.total_checks, 4);
    assert_eq!(bucket.successful_checks, 3);
    // Weighted: (100*3 + 500*1) / 4 = 200, not the naive (100+500)/2.
    assert!((bucket.avg_duration_ms - 200.0).abs() < f64::EPSILON);
    assert_eq!(bucket.min_duration_ms, 100);
    assert_eq!(bucket.max_duration_ms, 500);
    assert!((bucket.uptime_percentage - 75.0).abs() < f64::EPSILON);
}
