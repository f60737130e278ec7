//! Alert Manager - rule evaluation and incident lifecycle
//!
//! Holds the in-memory cache of enabled alert rules, evaluates every check
//! result against them, opens/updates/resolves incidents and emits
//! notification requests on `notifications.send`.
//!
//! ## Consecutive-count gating
//!
//! Each rule keeps a streak counter: incremented on a triggering result,
//! reset to zero otherwise. The rule fires only once the streak reaches
//! `consecutive_count`, which keeps one-off blips from paging anyone.
//! Cooldown suppresses the *firing*, never the streak bookkeeping, so
//! resolution still works during a cooldown window.
//!
//! ## Windowed rules
//!
//! Rules carrying `window_minutes` express rates ("failure rate over the
//! last W minutes") that no single result can decide. A periodic job
//! evaluates them against the store every minute and drives the same
//! incident machinery, without streak gating.
//!
//! ## Restart behavior
//!
//! In-memory state (streaks, cooldown stamps, incident attachment) is
//! authoritative while the process lives. On restart, open incidents are
//! re-materialized from the incidents table; streaks restart at zero, so
//! the first result after a restart can never fire a consecutive-count
//! rule by itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, trace, warn};
use uuid::Uuid;

use crate::bus::{Bus, Subscription};
use crate::messages::{
    subject, AlertCondition, AlertRule, AlertSeverity, CheckResult, NotificationRequest,
    RuleLifecycle,
};
use crate::storage::{IncidentRow, IncidentStatus, StorageBackend};

const WINDOW_EVAL_INTERVAL: Duration = Duration::from_secs(60);

/// Evaluate a rule's condition against one result. `true` means the result
/// counts toward the rule's streak.
pub fn condition_triggered(rule: &AlertRule, result: &CheckResult) -> bool {
    match rule.condition {
        AlertCondition::Availability => !result.success,

        AlertCondition::Latency => match rule.threshold.max {
            Some(max) => result.duration_ms as f64 > max,
            None => false,
        },

        AlertCondition::StatusCode => {
            let Some(code) = result
                .details
                .get("status_code")
                .and_then(|raw| raw.parse::<u16>().ok())
            else {
                return false;
            };
            if let Some(expected) = &rule.threshold.exact_match {
                return code.to_string() != *expected;
            }
            let (min, max) = (rule.threshold.min, rule.threshold.max);
            if min.is_some() || max.is_some() {
                let code = code as f64;
                return min.is_some_and(|m| code < m) || max.is_some_and(|m| code > m);
            }
            code >= 400
        }

        AlertCondition::SslExpiry => {
            let Some(days_in_advance) = rule.threshold.days_in_advance else {
                return false;
            };
            let Some(expiry) = result
                .details
                .get("cert_expiry")
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            else {
                return false;
            };
            expiry.with_timezone(&Utc) - Utc::now() <= TimeDelta::days(days_in_advance)
        }

        AlertCondition::Keyword => match (&rule.threshold.exact_match, result.details.get("body"))
        {
            (Some(keyword), Some(body)) => !body.contains(keyword.as_str()),
            _ => false,
        },

        AlertCondition::Pattern => {
            let (Some(pattern), Some(body)) = (&rule.threshold.pattern, result.details.get("body"))
            else {
                return false;
            };
            match regex::Regex::new(pattern) {
                Ok(re) => !re.is_match(body),
                Err(e) => {
                    warn!(rule_id = %rule.id, "invalid pattern {pattern:?}: {e}");
                    false
                }
            }
        }
    }
}

struct OpenIncident {
    id: Uuid,
    severity: AlertSeverity,
}

struct RuleState {
    rule: AlertRule,
    streak: u32,
    last_alert_time: Option<DateTime<Utc>>,
    incident: Option<OpenIncident>,
}

/// Snapshot of one rule's evaluation state, for introspection and tests.
#[derive(Debug, Clone)]
pub struct RuleSnapshot {
    pub rule_id: Uuid,
    pub streak: u32,
    pub open_incident: Option<Uuid>,
}

#[derive(Debug)]
pub enum AlertCommand {
    RuleState {
        rule_id: Uuid,
        respond_to: oneshot::Sender<Option<RuleSnapshot>>,
    },

    Shutdown,
}

pub struct AlertActor {
    bus: Arc<Bus>,
    store: Arc<dyn StorageBackend>,
    rules: HashMap<Uuid, RuleState>,
    /// Open incidents loaded at startup whose rules have not arrived yet.
    orphaned_incidents: HashMap<Uuid, OpenIncident>,
    seed: Vec<AlertRule>,
    results: Subscription,
    rule_updates: Subscription,
    command_rx: mpsc::Receiver<AlertCommand>,
}

impl AlertActor {
    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting alert manager");

        self.rematerialize().await;
        for rule in std::mem::take(&mut self.seed) {
            self.upsert_rule(rule);
        }

        let mut window_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + WINDOW_EVAL_INTERVAL,
            WINDOW_EVAL_INTERVAL,
        );

        loop {
            tokio::select! {
                result = self.results.recv::<CheckResult>() => {
                    match result {
                        Some(result) => self.handle_result(result).await,
                        None => {
                            warn!("result stream closed, shutting down");
                            break;
                        }
                    }
                }

                update = self.rule_updates.recv::<AlertRule>() => {
                    if let Some(rule) = update {
                        self.upsert_rule(rule);
                    }
                }

                _ = window_ticker.tick() => {
                    self.evaluate_windows().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        AlertCommand::RuleState { rule_id, respond_to } => {
                            let snapshot = self.rules.get(&rule_id).map(|s| RuleSnapshot {
                                rule_id,
                                streak: s.streak,
                                open_incident: s.incident.as_ref().map(|i| i.id),
                            });
                            let _ = respond_to.send(snapshot);
                        }
                        AlertCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("alert manager stopped");
    }

    /// Reload open incidents from the store so a restart does not lose the
    /// incident attachment (streaks intentionally restart at zero).
    async fn rematerialize(&mut self) {
        match self.store.open_incidents().await {
            Ok(incidents) => {
                for incident in incidents {
                    if incident.status == IncidentStatus::Resolved {
                        continue;
                    }
                    self.orphaned_incidents.insert(
                        incident.alert_rule_id,
                        OpenIncident {
                            id: incident.id,
                            severity: incident.severity,
                        },
                    );
                }
                if !self.orphaned_incidents.is_empty() {
                    debug!(
                        "re-materialized {} open incidents",
                        self.orphaned_incidents.len()
                    );
                }
            }
            Err(e) => error!("failed to load open incidents: {e}"),
        }
    }

    fn upsert_rule(&mut self, rule: AlertRule) {
        if rule.status == RuleLifecycle::Deleted || !rule.enabled {
            if self.rules.remove(&rule.id).is_some() {
                debug!(rule_id = %rule.id, "rule removed from cache");
            }
            return;
        }

        trace!(rule_id = %rule.id, monitor_id = %rule.monitor_id, "rule cached");
        match self.rules.get_mut(&rule.id) {
            // Streak, cooldown stamp and incident survive a rule edit.
            Some(state) => state.rule = rule,
            None => {
                let incident = self.orphaned_incidents.remove(&rule.id);
                self.rules.insert(
                    rule.id,
                    RuleState {
                        rule,
                        streak: 0,
                        last_alert_time: None,
                        incident,
                    },
                );
            }
        }
    }

    #[instrument(skip(self, result), fields(monitor_id = %result.monitor_id))]
    async fn handle_result(&mut self, result: CheckResult) {
        let rule_ids: Vec<Uuid> = self
            .rules
            .values()
            .filter(|s| s.rule.monitor_id == result.monitor_id && s.rule.window_minutes.is_none())
            .map(|s| s.rule.id)
            .collect();

        for rule_id in rule_ids {
            let triggered = match self.rules.get(&rule_id) {
                Some(state) => condition_triggered(&state.rule, &result),
                None => continue,
            };
            self.apply_evaluation(rule_id, triggered, result.timestamp, None, true)
                .await;
        }
    }

    /// Evaluate windowed (rate) rules against the time-series store.
    async fn evaluate_windows(&mut self) {
        let windowed: Vec<Uuid> = self
            .rules
            .values()
            .filter(|s| s.rule.window_minutes.is_some())
            .map(|s| s.rule.id)
            .collect();

        for rule_id in windowed {
            let Some(state) = self.rules.get(&rule_id) else {
                continue;
            };
            let rule = &state.rule;
            let window = rule.window_minutes.unwrap_or(0).max(1);
            let Some(threshold_pct) = rule.threshold.max else {
                trace!(rule_id = %rule.id, "windowed rule without a max threshold, skipping");
                continue;
            };
            let monitor_id = rule.monitor_id;
            let name = rule.name.clone();

            let now = Utc::now();
            let since = now - TimeDelta::minutes(window as i64);
            match self.store.failure_counts(monitor_id, since).await {
                Ok((_, 0)) => {}
                Ok((failed, total)) => {
                    let rate = failed as f64 / total as f64 * 100.0;
                    let triggered = rate > threshold_pct;
                    trace!(
                        rule_id = %rule_id,
                        "window evaluation: {failed}/{total} failed ({rate:.2}% vs {threshold_pct:.2}%)"
                    );
                    let message = triggered.then(|| {
                        format!(
                            "{name}: failure rate {rate:.2}% exceeds {threshold_pct:.2}% over the last {window}m"
                        )
                    });
                    self.apply_evaluation(rule_id, triggered, now, message, false)
                        .await;
                }
                Err(e) => error!(rule_id = %rule_id, "window query failed: {e}"),
            }
        }
    }

    /// Drive one rule's streak/incident state machine with a fresh verdict.
    ///
    /// `gated` selects consecutive-count semantics (per-result path); the
    /// windowed path fires directly on its rate verdict.
    async fn apply_evaluation(
        &mut self,
        rule_id: Uuid,
        triggered: bool,
        at: DateTime<Utc>,
        message: Option<String>,
        gated: bool,
    ) {
        let Some(state) = self.rules.get_mut(&rule_id) else {
            return;
        };
        let rule = state.rule.clone();

        if gated {
            if triggered {
                state.streak += 1;
            } else {
                state.streak = 0;
            }
            trace!(
                rule_id = %rule.id,
                "streak {}/{} (triggered: {triggered})",
                state.streak,
                rule.consecutive_count
            );
        }

        let fires = triggered && (!gated || state.streak >= rule.consecutive_count);

        if fires {
            // Cooldown suppresses firing only; streaks above keep moving so
            // resolution still tracks reality.
            if let Some(last) = state.last_alert_time {
                if at.signed_duration_since(last)
                    < TimeDelta::minutes(rule.cooldown_minutes as i64)
                {
                    trace!(rule_id = %rule.id, "within cooldown, not firing");
                    return;
                }
            }

            let open_info = state.incident.as_ref().map(|open| (open.id, open.severity));
            match open_info {
                None => {
                    let incident_id = Uuid::new_v4();
                    let row = IncidentRow {
                        id: incident_id,
                        alert_rule_id: rule.id,
                        monitor_id: rule.monitor_id,
                        status: IncidentStatus::Open,
                        severity: rule.severity,
                        start_time: at,
                        end_time: None,
                        last_update: at,
                    };
                    if let Err(e) = self.store.insert_incident(row).await {
                        error!(rule_id = %rule.id, "failed to open incident: {e}");
                        return;
                    }
                    if let Some(state) = self.rules.get_mut(&rule_id) {
                        state.incident = Some(OpenIncident {
                            id: incident_id,
                            severity: rule.severity,
                        });
                        state.last_alert_time = Some(at);
                    }
                    debug!(rule_id = %rule.id, incident_id = %incident_id, "incident opened");

                    self.notify(&rule, incident_id, message, at);
                }
                Some((incident_id, current_severity)) => {
                    let escalates = rule.severity > current_severity;
                    state.last_alert_time = Some(at);
                    if escalates {
                        if let Some(open) = state.incident.as_mut() {
                            open.severity = rule.severity;
                        }
                    }

                    if let Err(e) = self.store.touch_incident(incident_id, at).await {
                        error!(%incident_id, "failed to update incident: {e}");
                    }
                    if escalates {
                        match self
                            .store
                            .escalate_incident(incident_id, rule.severity, at)
                            .await
                        {
                            Ok(()) => {
                                debug!(%incident_id, "incident escalated to {}", rule.severity);
                                let escalation = message.unwrap_or_else(|| {
                                    format!(
                                        "{}: severity escalated to {}",
                                        display_name(&rule),
                                        rule.severity
                                    )
                                });
                                self.notify(&rule, incident_id, Some(escalation), at);
                            }
                            Err(e) => {
                                error!(%incident_id, "failed to escalate incident: {e}")
                            }
                        }
                    }
                }
            }
        } else if !triggered && state.streak == 0 {
            if let Some(open) = state.incident.take() {
                if let Err(e) = self.store.resolve_incident(open.id, at).await {
                    // In-memory state stays authoritative; the row is fixed
                    // up by the next lifecycle transition or an operator.
                    error!(incident_id = %open.id, "failed to resolve incident: {e}");
                }
                debug!(rule_id = %rule.id, incident_id = %open.id, "incident resolved");
            }
        }
    }

    fn notify(
        &self,
        rule: &AlertRule,
        incident_id: Uuid,
        message: Option<String>,
        at: DateTime<Utc>,
    ) {
        let request = NotificationRequest {
            id: None,
            incident_id,
            alert_rule_id: rule.id,
            monitor_id: rule.monitor_id,
            channels: rule.channels.clone(),
            message: message.unwrap_or_else(|| display_name(rule)),
            severity: rule.severity,
            timestamp: at,
        };
        if let Err(e) = self.bus.publish(subject::NOTIFICATIONS_SEND, &request) {
            error!(rule_id = %rule.id, "failed to publish notification: {e}");
        }
    }
}

fn display_name(rule: &AlertRule) -> String {
    if rule.name.is_empty() {
        format!("alert rule {} for monitor {}", rule.id, rule.monitor_id)
    } else {
        rule.name.clone()
    }
}

/// Handle for controlling the alert manager
#[derive(Clone)]
pub struct AlertHandle {
    sender: mpsc::Sender<AlertCommand>,
}

impl AlertHandle {
    /// Spawn the alert manager. `seed` carries rules loaded from the
    /// configuration store; later changes arrive on `alerts.rule.update`.
    pub fn spawn(bus: Arc<Bus>, store: Arc<dyn StorageBackend>, seed: Vec<AlertRule>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = AlertActor {
            results: bus.subscribe(subject::CHECK_RESULT),
            rule_updates: bus.subscribe(subject::RULE_UPDATE),
            bus,
            store,
            rules: HashMap::new(),
            orphaned_incidents: HashMap::new(),
            seed,
            command_rx: cmd_rx,
        };

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Evaluation state for one rule, if cached
    pub async fn rule_state(&self, rule_id: Uuid) -> Option<RuleSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlertCommand::RuleState {
                rule_id,
                respond_to: tx,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(AlertCommand::Shutdown).await;
    }
}
