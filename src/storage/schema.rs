//! Row types for the time-series and alerting tables
//!
//! ## Design Philosophy
//!
//! Values queried by aggregation and alerting (durations, success flags,
//! bucket boundaries) live in typed columns; protocol-specific probe output
//! stays in an opaque JSON map (`details`) so new probe types never require
//! a migration. Timestamps are stored as unix milliseconds and surfaced as
//! `DateTime<Utc>` at the API boundary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messages::{AlertSeverity, CheckResult, NotificationRequest};

/// One probe outcome as persisted in `check_results`.
///
/// The `(monitor_id, timestamp, worker_id)` triple is the primary key, which
/// makes redelivered bus messages idempotent upserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResultRow {
    pub monitor_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub worker_id: Uuid,
    pub duration_ms: i64,
    pub success: bool,
    pub error: Option<String>,
    pub details: HashMap<String, String>,
}

impl From<CheckResult> for CheckResultRow {
    fn from(result: CheckResult) -> Self {
        Self {
            monitor_id: result.monitor_id,
            timestamp: result.timestamp,
            worker_id: result.worker_id,
            duration_ms: result.duration_ms,
            success: result.success,
            error: result.error,
            details: result.details,
        }
    }
}

/// Rollup bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
}

/// Aggregated statistics for one monitor over one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    pub monitor_id: Uuid,
    pub bucket_start: DateTime<Utc>,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub failed_checks: i64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: i64,
    pub max_duration_ms: i64,
    pub p95_duration_ms: i64,
    pub uptime_percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Resolved => "resolved",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(IncidentStatus::Open),
            "acknowledged" => Some(IncidentStatus::Acknowledged),
            "resolved" => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }
}

/// An alerting incident, from first firing to resolution.
#[derive(Debug, Clone)]
pub struct IncidentRow {
    pub id: Uuid,
    pub alert_rule_id: Uuid,
    pub monitor_id: Uuid,
    pub status: IncidentStatus,
    pub severity: AlertSeverity,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    Pending,
    Sent,
    Retry,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Retry => "retry",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(NotificationStatus::Pending),
            "sent" => Some(NotificationStatus::Sent),
            "retry" => Some(NotificationStatus::Retry),
            "failed" => Some(NotificationStatus::Failed),
            _ => None,
        }
    }
}

/// A delivery record. Persisted before the first send attempt so a crash
/// never loses pending work.
#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub alert_rule_id: Uuid,
    pub monitor_id: Uuid,
    pub channels: Vec<String>,
    pub message: String,
    pub severity: AlertSeverity,
    pub created_at: DateTime<Utc>,
    pub status: NotificationStatus,
    pub retry_count: i64,
    pub last_retry: Option<DateTime<Utc>>,
}

impl NotificationRow {
    /// Materialize an inbound request, assigning an id when the producer
    /// did not provide one.
    pub fn from_request(request: NotificationRequest) -> Self {
        Self {
            id: request.id.unwrap_or_else(Uuid::new_v4),
            incident_id: request.incident_id,
            alert_rule_id: request.alert_rule_id,
            monitor_id: request.monitor_id,
            channels: request.channels,
            message: request.message,
            severity: request.severity,
            created_at: request.timestamp,
            status: NotificationStatus::Pending,
            retry_count: 0,
            last_retry: None,
        }
    }
}
