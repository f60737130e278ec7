//! Storage backend trait definition
//!
//! This module defines the core `StorageBackend` trait that all
//! storage implementations must implement. It covers the four persisted
//! surfaces of the pipeline: raw check results, rollup buckets, incidents
//! and notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::StorageResult;
use super::schema::{
    CheckResultRow, Granularity, IncidentRow, NotificationRow, NotificationStatus, RollupBucket,
};
use crate::messages::AlertSeverity;

/// Trait for persistent storage backends
///
/// The trait is designed to be:
///
/// - **Async**: all methods are async for compatibility with Tokio
/// - **Idempotent where the bus demands it**: inserting the same check
///   result or rollup bucket twice must converge to one row
/// - **Swappable**: the pipeline only ever sees `Arc<dyn StorageBackend>`
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync` as they are shared across
/// component tasks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Check results (time-series)
    // ========================================================================

    /// Upsert one probe result. Redelivery of the same `(monitor_id,
    /// timestamp, worker_id)` triple must not create a second row.
    async fn insert_check_result(&self, row: CheckResultRow) -> StorageResult<()>;

    /// Results for one monitor in `[start, end)`, ordered by timestamp
    /// (ties broken by worker id).
    async fn query_results(
        &self,
        monitor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<CheckResultRow>>;

    /// Distinct monitors that produced at least one result in `[start, end)`.
    async fn monitors_with_results(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Uuid>>;

    /// `(failed, total)` result counts for a monitor since the given
    /// instant. Drives windowed alert evaluation.
    async fn failure_counts(
        &self,
        monitor_id: Uuid,
        since: DateTime<Utc>,
    ) -> StorageResult<(i64, i64)>;

    // ========================================================================
    // Rollups
    // ========================================================================

    /// Idempotent upsert keyed by `(monitor_id, bucket_start)`.
    async fn upsert_rollup(
        &self,
        granularity: Granularity,
        bucket: RollupBucket,
    ) -> StorageResult<()>;

    /// Buckets for one monitor with `bucket_start` in `[start, end)`,
    /// ordered by bucket start.
    async fn query_rollups(
        &self,
        granularity: Granularity,
        monitor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<RollupBucket>>;

    /// Distinct monitors with hourly buckets in `[start, end)`. Feeds the
    /// daily aggregation pass.
    async fn monitors_with_hourly_rollups(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Uuid>>;

    // ========================================================================
    // Incidents
    // ========================================================================

    async fn insert_incident(&self, row: IncidentRow) -> StorageResult<()>;

    /// Refresh `last_update` on an open incident.
    async fn touch_incident(&self, id: Uuid, last_update: DateTime<Utc>) -> StorageResult<()>;

    /// Raise the recorded severity of an open incident.
    async fn escalate_incident(
        &self,
        id: Uuid,
        severity: AlertSeverity,
        last_update: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn resolve_incident(&self, id: Uuid, end_time: DateTime<Utc>) -> StorageResult<()>;

    /// All incidents not yet resolved. Used to re-materialize alerting
    /// state after a restart.
    async fn open_incidents(&self) -> StorageResult<Vec<IncidentRow>>;

    // ========================================================================
    // Notifications
    // ========================================================================

    async fn insert_notification(&self, row: NotificationRow) -> StorageResult<()>;

    async fn get_notification(&self, id: Uuid) -> StorageResult<Option<NotificationRow>>;

    async fn set_notification_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
    ) -> StorageResult<()>;

    /// Record one more failed attempt: bumps the retry counter and stamps
    /// `last_retry`.
    async fn mark_notification_retry(
        &self,
        id: Uuid,
        retry_count: i64,
        last_retry: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Rows still in `pending` or `retry` state, oldest first. Re-queued on
    /// startup so a crash loses no pending deliveries.
    async fn unfinished_notifications(&self) -> StorageResult<Vec<NotificationRow>>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Lightweight liveness probe of the backend.
    async fn health_check(&self) -> StorageResult<()>;

    /// Gracefully shut down the backend, closing connections.
    async fn close(&self) -> StorageResult<()>;
}
