//! Scheduler - drives per-monitor check cadence
//!
//! Holds the registry of enabled monitors and emits one `CheckRequest` per
//! monitor per interval on `probes.check.request`.
//!
//! ## Cadence rules
//!
//! - Each monitor gets its own timer task. The first tick is offset by a
//!   jitter drawn uniformly from `[0, interval/10)` so a restart never
//!   fires every monitor at once.
//! - A missed tick is skipped, never fired retroactively.
//! - An update cancels the old cadence and starts a fresh one; a deletion
//!   (or `enabled: false`) cancels and forgets.
//!
//! The scheduler is soft-stateful: it accepts a seed list at spawn and
//! otherwise relies on the configuration collaborator re-announcing monitors
//! on `monitors.updates`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::bus::{Bus, Subscription};
use crate::messages::{subject, CheckRequest, Monitor};

/// Commands that can be sent to the scheduler
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Snapshot of the monitors with a running cadence
    ActiveMonitors {
        respond_to: oneshot::Sender<Vec<Uuid>>,
    },

    /// Gracefully shut down, cancelling every cadence
    Shutdown,
}

struct Cadence {
    task: JoinHandle<()>,
}

impl Drop for Cadence {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct SchedulerActor {
    bus: Arc<Bus>,
    cadences: HashMap<Uuid, Cadence>,
    seed: Vec<Monitor>,
    updates: Subscription,
    deletions: Subscription,
    command_rx: mpsc::Receiver<SchedulerCommand>,
}

impl SchedulerActor {
    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting scheduler");

        for monitor in std::mem::take(&mut self.seed) {
            self.apply_update(monitor);
        }

        loop {
            tokio::select! {
                update = self.updates.recv::<Monitor>() => {
                    match update {
                        Some(monitor) => self.apply_update(monitor),
                        None => {
                            warn!("monitor update stream closed, shutting down");
                            break;
                        }
                    }
                }

                deletion = self.deletions.recv::<Uuid>() => {
                    if let Some(monitor_id) = deletion {
                        self.forget(monitor_id);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SchedulerCommand::ActiveMonitors { respond_to } => {
                            let _ = respond_to.send(self.cadences.keys().copied().collect());
                        }
                        SchedulerCommand::Shutdown => {
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

        self.cadences.clear();
        debug!("scheduler stopped");
    }

    fn apply_update(&mut self, monitor: Monitor) {
        if !monitor.enabled {
            self.forget(monitor.id);
            return;
        }

        if let Err(reason) = monitor.validate() {
            warn!(monitor_id = %monitor.id, "dropping invalid monitor: {reason}");
            self.forget(monitor.id);
            return;
        }

        // Updates replace the cadence wholesale.
        self.cadences.remove(&monitor.id);

        let interval = Duration::from_secs(monitor.interval_seconds);
        let jitter = startup_jitter(&monitor);
        debug!(
            monitor_id = %monitor.id,
            "starting cadence every {}s (first tick in {}ms)",
            monitor.interval_seconds,
            jitter.as_millis()
        );

        let bus = Arc::clone(&self.bus);
        let request = CheckRequest {
            monitor_id: monitor.id,
            target: monitor.target.clone(),
            check_type: monitor.monitor_type,
            timeout_seconds: monitor.timeout_seconds,
            expected_status_codes: monitor.expected_status_codes.clone(),
        };

        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + jitter, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                trace!(monitor_id = %request.monitor_id, "cadence tick");
                if let Err(e) = bus.publish(subject::CHECK_REQUEST, &request) {
                    warn!(monitor_id = %request.monitor_id, "failed to publish check request: {e}");
                }
            }
        });

        self.cadences.insert(monitor.id, Cadence { task });
    }

    fn forget(&mut self, monitor_id: Uuid) {
        if self.cadences.remove(&monitor_id).is_some() {
            debug!(%monitor_id, "cadence cancelled");
        }
    }
}

/// First-tick delay, drawn uniformly from `[0, interval/10)`.
fn startup_jitter(monitor: &Monitor) -> Duration {
    let cap_ms = (monitor.interval_seconds * 100).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(0..cap_ms))
}

/// Handle for controlling the scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn the scheduler. `seed` carries monitors loaded from the
    /// configuration store; everything after that arrives over the bus.
    pub fn spawn(bus: Arc<Bus>, seed: Vec<Monitor>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = SchedulerActor {
            updates: bus.subscribe(subject::MONITORS_UPDATES),
            deletions: bus.subscribe(subject::MONITORS_DELETIONS),
            bus,
            cadences: HashMap::new(),
            seed,
            command_rx: cmd_rx,
        };

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Ids of monitors with a running cadence
    pub async fn active_monitors(&self) -> Vec<Uuid> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SchedulerCommand::ActiveMonitors { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Shut down the scheduler and cancel all cadences
    pub async fn shutdown(&self) {
        let _ = self.sender.send(SchedulerCommand::Shutdown).await;
    }
}
