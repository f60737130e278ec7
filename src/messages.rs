//! Bus payload types and subject names
//!
//! Every message that crosses a component boundary is defined here, together
//! with the subject it travels on. Payloads are JSON on the wire and must
//! round-trip through serde without loss.
//!
//! ## Design Principles
//!
//! 1. **Self-contained**: a consumer never needs to join a payload against
//!    another message to act on it
//! 2. **Tolerant**: unknown fields are ignored, optional fields default, so
//!    producers can evolve ahead of consumers
//! 3. **Cloneable**: all payloads are `Clone` for multi-subscriber fan-out

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bus subjects. The per-worker assignment subject is derived from the
/// worker id; everything else is a fixed name.
pub mod subject {
    use uuid::Uuid;

    pub const MONITORS_UPDATES: &str = "monitors.updates";
    pub const MONITORS_DELETIONS: &str = "monitors.deletions";
    pub const CHECK_REQUEST: &str = "probes.check.request";
    pub const PROBE_REGISTER: &str = "probes.register";
    pub const PROBE_HEARTBEAT: &str = "probes.heartbeat";
    pub const CHECK_RESULT: &str = "probes.check.result";
    pub const ANALYTICS_INGEST: &str = "analytics.ingest";
    pub const RULE_UPDATE: &str = "alerts.rule.update";
    pub const NOTIFICATIONS_SEND: &str = "notifications.send";

    pub fn check_assign(worker_id: Uuid) -> String {
        format!("probes.check.assign.{worker_id}")
    }
}

/// Supported check protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MonitorType {
    Http,
    Https,
    Tcp,
    Udp,
    Dns,
    Icmp,
}

impl std::fmt::Display for MonitorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonitorType::Http => "HTTP",
            MonitorType::Https => "HTTPS",
            MonitorType::Tcp => "TCP",
            MonitorType::Udp => "UDP",
            MonitorType::Dns => "DNS",
            MonitorType::Icmp => "ICMP",
        };
        f.write_str(s)
    }
}

/// A user-defined health check, announced by the configuration collaborator
/// on `monitors.updates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: Uuid,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub monitor_type: MonitorType,

    /// URL for HTTP/HTTPS, `host:port` for TCP/UDP, hostname for DNS/ICMP.
    pub target: String,

    pub interval_seconds: u64,

    pub timeout_seconds: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status_codes: Option<Vec<u16>>,

    /// Region tags the monitor wants to be probed from. Carried through to
    /// dispatch; an empty set means "anywhere".
    #[serde(default)]
    pub locations: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Monitor {
    /// Monitors must tick at 30s or slower and finish checks strictly
    /// inside their interval.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_seconds < 30 {
            return Err(format!(
                "interval {}s is below the 30s minimum",
                self.interval_seconds
            ));
        }
        if self.timeout_seconds == 0 {
            return Err("timeout must be positive".to_string());
        }
        if self.timeout_seconds >= self.interval_seconds {
            return Err(format!(
                "timeout {}s must be shorter than interval {}s",
                self.timeout_seconds, self.interval_seconds
            ));
        }
        Ok(())
    }
}

/// One scheduled probe execution, emitted by the scheduler per tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub monitor_id: Uuid,
    pub target: String,
    #[serde(rename = "type")]
    pub check_type: MonitorType,
    /// Missing or zero timeouts are clamped by the executing worker.
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status_codes: Option<Vec<u16>>,
}

/// A check request routed to one specific worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckAssignment {
    #[serde(flatten)]
    pub request: CheckRequest,
    pub worker_id: Uuid,
}

/// Published once by a worker at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: Uuid,
    pub check_types: Vec<MonitorType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: Uuid,
}

/// The outcome of a single probe, fanned out to ingestion and alerting.
///
/// `details` is an opaque protocol-specific map. Well-known keys:
/// `status_code`, `status`, `body`, `tls_handshake_ms`, `cert_expiry`
/// (RFC 3339), and `ip_1`..`ip_n` for DNS resolutions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub monitor_id: Uuid,
    pub worker_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, String>,
}

/// Compact event republished by ingestion after a successful write.
/// Downstream consumers get the shape they need without the full payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    pub monitor_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    StatusCode,
    Latency,
    Availability,
    SslExpiry,
    Keyword,
    Pattern,
}

/// Polymorphic threshold: which fields are meaningful depends on the
/// condition (`max` for latency and window rates, `days_in_advance` for
/// certificate expiry, `exact_match`/`pattern` for content conditions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertThreshold {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_in_advance: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleLifecycle {
    #[default]
    Active,
    Deleted,
}

/// An alert rule, announced on `alerts.rule.update`. A payload with
/// `status: "deleted"` removes the rule from every evaluator cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub monitor_id: Uuid,
    #[serde(default)]
    pub name: String,
    pub condition: AlertCondition,
    #[serde(default)]
    pub threshold: AlertThreshold,
    pub severity: AlertSeverity,
    #[serde(default = "default_consecutive")]
    pub consecutive_count: u32,
    #[serde(default)]
    pub cooldown_minutes: u32,
    /// Rules with a window are evaluated by the periodic windowed job
    /// (failure rate over the window) instead of per result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_minutes: Option<u32>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub status: RuleLifecycle,
}

fn default_consecutive() -> u32 {
    1
}

/// Delivery request published by the alert manager on `notifications.send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Assigned by the notification service when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub incident_id: Uuid,
    pub alert_rule_id: Uuid,
    pub monitor_id: Uuid,
    pub channels: Vec<String>,
    pub message: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
}
