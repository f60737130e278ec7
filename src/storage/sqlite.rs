//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: no separate database server required
//! - **WAL mode**: concurrent reads while the write path is active
//! - **Connection pooling**: shared across all components of the process
//! - **Migrations**: automatic schema versioning with sqlx
//!
//! ## Limitations
//!
//! - Single-machine only; the day-partitioned hypertable of a dedicated
//!   time-series store becomes plain indexes here
//! - `:memory:` databases are pinned to a single pooled connection so every
//!   query sees the same database

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::backend::StorageBackend;
use super::error::{StorageError, StorageResult};
use super::schema::{
    CheckResultRow, Granularity, IncidentRow, IncidentStatus, NotificationRow, NotificationStatus,
    RollupBucket,
};
use crate::messages::AlertSeverity;

/// SQLite storage backend
///
/// Holds the raw check results, rollup buckets, incidents and notification
/// records for the whole pipeline.
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run migrations to create tables
    /// 3. Configure SQLite for optimal performance (WAL mode, etc.)
    #[instrument(skip_all)]
    pub async fn new(db_path: &str) -> StorageResult<Self> {
        info!("initializing SQLite backend at: {}", db_path);

        let (options, max_connections) = if db_path == ":memory:" {
            // Every pooled connection to ":memory:" would otherwise get its
            // own private database.
            (SqliteConnectOptions::new().in_memory(true), 1)
        } else {
            (
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(std::time::Duration::from_secs(30)),
                5,
            )
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self { pool })
    }

    fn to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn from_millis(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn parse_uuid(raw: &str) -> StorageResult<Uuid> {
        raw.parse()
            .map_err(|e| StorageError::SerializationError(format!("bad uuid {raw:?}: {e}")))
    }

    fn parse_severity(raw: &str) -> StorageResult<AlertSeverity> {
        serde_json::from_value(serde_json::Value::String(raw.to_string()))
            .map_err(|e| StorageError::SerializationError(format!("bad severity {raw:?}: {e}")))
    }

    fn rollup_table(granularity: Granularity) -> &'static str {
        match granularity {
            Granularity::Hour => "monitor_stats_hourly",
            Granularity::Day => "monitor_stats_daily",
        }
    }

    fn rollup_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<RollupBucket> {
        Ok(RollupBucket {
            monitor_id: Self::parse_uuid(&row.try_get::<String, _>("monitor_id")?)?,
            bucket_start: Self::from_millis(row.try_get("bucket_start")?),
            total_checks: row.try_get("total_checks")?,
            successful_checks: row.try_get("successful_checks")?,
            failed_checks: row.try_get("failed_checks")?,
            avg_duration_ms: row.try_get("avg_duration_ms")?,
            min_duration_ms: row.try_get("min_duration_ms")?,
            max_duration_ms: row.try_get("max_duration_ms")?,
            p95_duration_ms: row.try_get("p95_duration_ms")?,
            uptime_percentage: row.try_get("uptime_percentage")?,
        })
    }

    fn incident_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<IncidentRow> {
        let status_raw: String = row.try_get("status")?;
        let status = IncidentStatus::parse(&status_raw).ok_or_else(|| {
            StorageError::SerializationError(format!("bad incident status {status_raw:?}"))
        })?;

        Ok(IncidentRow {
            id: Self::parse_uuid(&row.try_get::<String, _>("id")?)?,
            alert_rule_id: Self::parse_uuid(&row.try_get::<String, _>("alert_rule_id")?)?,
            monitor_id: Self::parse_uuid(&row.try_get::<String, _>("monitor_id")?)?,
            status,
            severity: Self::parse_severity(&row.try_get::<String, _>("severity")?)?,
            start_time: Self::from_millis(row.try_get("start_time")?),
            end_time: row
                .try_get::<Option<i64>, _>("end_time")?
                .map(Self::from_millis),
            last_update: Self::from_millis(row.try_get("last_update")?),
        })
    }

    fn notification_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<NotificationRow> {
        let status_raw: String = row.try_get("status")?;
        let status = NotificationStatus::parse(&status_raw).ok_or_else(|| {
            StorageError::SerializationError(format!("bad notification status {status_raw:?}"))
        })?;

        let channels_raw: String = row.try_get("channels")?;
        let channels: Vec<String> = serde_json::from_str(&channels_raw).map_err(|e| {
            StorageError::SerializationError(format!("bad channels {channels_raw:?}: {e}"))
        })?;

        Ok(NotificationRow {
            id: Self::parse_uuid(&row.try_get::<String, _>("id")?)?,
            incident_id: Self::parse_uuid(&row.try_get::<String, _>("incident_id")?)?,
            alert_rule_id: Self::parse_uuid(&row.try_get::<String, _>("alert_rule_id")?)?,
            monitor_id: Self::parse_uuid(&row.try_get::<String, _>("monitor_id")?)?,
            channels,
            message: row.try_get("message")?,
            severity: Self::parse_severity(&row.try_get::<String, _>("severity")?)?,
            created_at: Self::from_millis(row.try_get("created_at")?),
            status,
            retry_count: row.try_get("retry_count")?,
            last_retry: row
                .try_get::<Option<i64>, _>("last_retry")?
                .map(Self::from_millis),
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, row), fields(monitor_id = %row.monitor_id))]
    async fn insert_check_result(&self, row: CheckResultRow) -> StorageResult<()> {
        let details = serde_json::to_string(&row.details).map_err(|e| {
            StorageError::SerializationError(format!("failed to serialize details: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO check_results (
                monitor_id, timestamp, worker_id, duration_ms, success, error, details
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (monitor_id, timestamp, worker_id) DO UPDATE SET
                duration_ms = excluded.duration_ms,
                success = excluded.success,
                error = excluded.error,
                details = excluded.details
            "#,
        )
        .bind(row.monitor_id.to_string())
        .bind(Self::to_millis(&row.timestamp))
        .bind(row.worker_id.to_string())
        .bind(row.duration_ms)
        .bind(row.success)
        .bind(&row.error)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query_results(
        &self,
        monitor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<CheckResultRow>> {
        let rows = sqlx::query(
            r#"
            SELECT monitor_id, timestamp, worker_id, duration_ms, success, error, details
            FROM check_results
            WHERE monitor_id = ? AND timestamp >= ? AND timestamp < ?
            ORDER BY timestamp ASC, worker_id ASC
            "#,
        )
        .bind(monitor_id.to_string())
        .bind(Self::to_millis(&start))
        .bind(Self::to_millis(&end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let details_raw: String = row.try_get("details")?;
                let details: HashMap<String, String> = serde_json::from_str(&details_raw)
                    .map_err(|e| {
                        StorageError::SerializationError(format!(
                            "bad details {details_raw:?}: {e}"
                        ))
                    })?;

                Ok(CheckResultRow {
                    monitor_id: Self::parse_uuid(&row.try_get::<String, _>("monitor_id")?)?,
                    timestamp: Self::from_millis(row.try_get("timestamp")?),
                    worker_id: Self::parse_uuid(&row.try_get::<String, _>("worker_id")?)?,
                    duration_ms: row.try_get("duration_ms")?,
                    success: row.try_get("success")?,
                    error: row.try_get("error")?,
                    details,
                })
            })
            .collect()
    }

    async fn monitors_with_results(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT DISTINCT monitor_id FROM check_results WHERE timestamp >= ? AND timestamp < ?",
        )
        .bind(Self::to_millis(&start))
        .bind(Self::to_millis(&end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::parse_uuid(&row.try_get::<String, _>("monitor_id")?))
            .collect()
    }

    async fn failure_counts(
        &self,
        monitor_id: Uuid,
        since: DateTime<Utc>,
    ) -> StorageResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS failed
            FROM check_results
            WHERE monitor_id = ? AND timestamp >= ?
            "#,
        )
        .bind(monitor_id.to_string())
        .bind(Self::to_millis(&since))
        .fetch_one(&self.pool)
        .await?;

        Ok((row.try_get("failed")?, row.try_get("total")?))
    }

    #[instrument(skip(self, bucket), fields(monitor_id = %bucket.monitor_id))]
    async fn upsert_rollup(
        &self,
        granularity: Granularity,
        bucket: RollupBucket,
    ) -> StorageResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                monitor_id, bucket_start,
                total_checks, successful_checks, failed_checks,
                avg_duration_ms, min_duration_ms, max_duration_ms, p95_duration_ms,
                uptime_percentage
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (monitor_id, bucket_start) DO UPDATE SET
                total_checks = excluded.total_checks,
                successful_checks = excluded.successful_checks,
                failed_checks = excluded.failed_checks,
                avg_duration_ms = excluded.avg_duration_ms,
                min_duration_ms = excluded.min_duration_ms,
                max_duration_ms = excluded.max_duration_ms,
                p95_duration_ms = excluded.p95_duration_ms,
                uptime_percentage = excluded.uptime_percentage
            "#,
            Self::rollup_table(granularity)
        );

        sqlx::query(&sql)
            .bind(bucket.monitor_id.to_string())
            .bind(Self::to_millis(&bucket.bucket_start))
            .bind(bucket.total_checks)
            .bind(bucket.successful_checks)
            .bind(bucket.failed_checks)
            .bind(bucket.avg_duration_ms)
            .bind(bucket.min_duration_ms)
            .bind(bucket.max_duration_ms)
            .bind(bucket.p95_duration_ms)
            .bind(bucket.uptime_percentage)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn query_rollups(
        &self,
        granularity: Granularity,
        monitor_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<RollupBucket>> {
        let sql = format!(
            r#"
            SELECT monitor_id, bucket_start,
                   total_checks, successful_checks, failed_checks,
                   avg_duration_ms, min_duration_ms, max_duration_ms, p95_duration_ms,
                   uptime_percentage
            FROM {}
            WHERE monitor_id = ? AND bucket_start >= ? AND bucket_start < ?
            ORDER BY bucket_start ASC
            "#,
            Self::rollup_table(granularity)
        );

        let rows = sqlx::query(&sql)
            .bind(monitor_id.to_string())
            .bind(Self::to_millis(&start))
            .bind(Self::to_millis(&end))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::rollup_from_row).collect()
    }

    async fn monitors_with_hourly_rollups(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT monitor_id FROM monitor_stats_hourly
            WHERE bucket_start >= ? AND bucket_start < ?
            "#,
        )
        .bind(Self::to_millis(&start))
        .bind(Self::to_millis(&end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::parse_uuid(&row.try_get::<String, _>("monitor_id")?))
            .collect()
    }

    #[instrument(skip(self, row), fields(incident_id = %row.id, rule_id = %row.alert_rule_id))]
    async fn insert_incident(&self, row: IncidentRow) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO incidents (
                id, alert_rule_id, monitor_id, status, severity,
                start_time, end_time, last_update
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.id.to_string())
        .bind(row.alert_rule_id.to_string())
        .bind(row.monitor_id.to_string())
        .bind(row.status.as_str())
        .bind(row.severity.to_string())
        .bind(Self::to_millis(&row.start_time))
        .bind(row.end_time.as_ref().map(Self::to_millis))
        .bind(Self::to_millis(&row.last_update))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn touch_incident(&self, id: Uuid, last_update: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query("UPDATE incidents SET last_update = ? WHERE id = ?")
            .bind(Self::to_millis(&last_update))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn escalate_incident(
        &self,
        id: Uuid,
        severity: AlertSeverity,
        last_update: DateTime<Utc>,
    ) -> StorageResult<()> {
        sqlx::query("UPDATE incidents SET severity = ?, last_update = ? WHERE id = ?")
            .bind(severity.to_string())
            .bind(Self::to_millis(&last_update))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn resolve_incident(&self, id: Uuid, end_time: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query(
            "UPDATE incidents SET status = 'resolved', end_time = ?, last_update = ? WHERE id = ?",
        )
        .bind(Self::to_millis(&end_time))
        .bind(Self::to_millis(&end_time))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn open_incidents(&self) -> StorageResult<Vec<IncidentRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, alert_rule_id, monitor_id, status, severity,
                   start_time, end_time, last_update
            FROM incidents
            WHERE status != 'resolved'
            ORDER BY start_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::incident_from_row).collect()
    }

    #[instrument(skip(self, row), fields(notification_id = %row.id))]
    async fn insert_notification(&self, row: NotificationRow) -> StorageResult<()> {
        let channels = serde_json::to_string(&row.channels).map_err(|e| {
            StorageError::SerializationError(format!("failed to serialize channels: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, incident_id, alert_rule_id, monitor_id, channels,
                message, severity, created_at, status, retry_count, last_retry
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.id.to_string())
        .bind(row.incident_id.to_string())
        .bind(row.alert_rule_id.to_string())
        .bind(row.monitor_id.to_string())
        .bind(channels)
        .bind(&row.message)
        .bind(row.severity.to_string())
        .bind(Self::to_millis(&row.created_at))
        .bind(row.status.as_str())
        .bind(row.retry_count)
        .bind(row.last_retry.as_ref().map(Self::to_millis))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_notification(&self, id: Uuid) -> StorageResult<Option<NotificationRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, incident_id, alert_rule_id, monitor_id, channels,
                   message, severity, created_at, status, retry_count, last_retry
            FROM notifications
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::notification_from_row).transpose()
    }

    async fn set_notification_status(
        &self,
        id: Uuid,
        status: NotificationStatus,
    ) -> StorageResult<()> {
        sqlx::query("UPDATE notifications SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_notification_retry(
        &self,
        id: Uuid,
        retry_count: i64,
        last_retry: DateTime<Utc>,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE notifications SET status = 'retry', retry_count = ?, last_retry = ? WHERE id = ?",
        )
        .bind(retry_count)
        .bind(Self::to_millis(&last_retry))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unfinished_notifications(&self) -> StorageResult<Vec<NotificationRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, incident_id, alert_rule_id, monitor_id, channels,
                   message, severity, created_at, status, retry_count, last_retry
            FROM notifications
            WHERE status IN ('pending', 'retry')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::notification_from_row).collect()
    }

    async fn health_check(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}
