//! Probe Worker - executes protocol checks under a deadline
//!
//! A worker announces itself on `probes.register`, heartbeats every 15
//! seconds and consumes assignments from its private subject
//! (`probes.check.assign.<id>`). Each assignment runs on its own task, so a
//! slow target never blocks the next check.
//!
//! The only cancellation path for an in-flight check is its own deadline;
//! there is no external cancel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use crate::bus::{Bus, Subscription};
use crate::messages::{
    subject, CheckAssignment, CheckResult, MonitorType, WorkerHeartbeat, WorkerRegistration,
};
use crate::probes;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Deadlines are clamped here when the payload carries none or nonsense.
const MIN_TIMEOUT_SECONDS: u64 = 1;
const MAX_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug)]
pub enum WorkerCommand {
    Shutdown,
}

struct WorkerContext {
    id: Uuid,
    bus: Arc<Bus>,
    client: reqwest::Client,
}

pub struct WorkerActor {
    context: Arc<WorkerContext>,
    assignments: Subscription,
    command_rx: mpsc::Receiver<WorkerCommand>,
    heartbeat: JoinHandle<()>,
}

impl WorkerActor {
    /// Run the actor's main loop
    #[instrument(skip(self), fields(worker_id = %self.context.id))]
    pub async fn run(mut self) {
        debug!("starting probe worker");

        loop {
            tokio::select! {
                assignment = self.assignments.recv::<CheckAssignment>() => {
                    match assignment {
                        Some(assignment) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(execute_assignment(context, assignment));
                        }
                        None => {
                            warn!("assignment stream closed, shutting down");
                            break;
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        WorkerCommand::Shutdown => {
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

        self.heartbeat.abort();
        debug!("probe worker stopped");
    }
}

/// Execute one assignment end to end and publish the result.
#[instrument(skip(context, assignment), fields(monitor_id = %assignment.request.monitor_id))]
async fn execute_assignment(context: Arc<WorkerContext>, assignment: CheckAssignment) {
    let deadline = effective_timeout(assignment.request.timeout_seconds);
    trace!(
        target = %assignment.request.target,
        check_type = %assignment.request.check_type,
        "executing check with {}s deadline",
        deadline.as_secs()
    );

    let started = std::time::Instant::now();
    let report = probes::execute(&context.client, &assignment.request, deadline).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    if let Some(error) = &report.error {
        debug!(target = %assignment.request.target, "check failed: {error}");
    }

    let result = CheckResult {
        monitor_id: assignment.request.monitor_id,
        worker_id: context.id,
        timestamp: Utc::now(),
        duration_ms,
        success: report.success,
        error: report.error.map(|e| e.wire_code().to_string()),
        details: report.details,
    };

    if let Err(e) = context.bus.publish(subject::CHECK_RESULT, &result) {
        warn!("failed to publish check result: {e}");
    }
}

/// Clamp the requested timeout into `[1s, 60s]`; zero means "not provided".
fn effective_timeout(timeout_seconds: u64) -> Duration {
    Duration::from_secs(timeout_seconds.clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS))
}

/// Handle for controlling a probe worker
#[derive(Clone)]
pub struct WorkerHandle {
    id: Uuid,
    sender: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    /// Spawn a worker advertising the given check types.
    ///
    /// Subscribes to its own assignment subject before registering, so the
    /// first dispatch can never race the subscription.
    pub fn spawn(bus: Arc<Bus>, check_types: Vec<MonitorType>) -> Self {
        let id = Uuid::new_v4();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let assignments = bus.subscribe(&subject::check_assign(id));

        if let Err(e) = bus.publish(
            subject::PROBE_REGISTER,
            &WorkerRegistration {
                id,
                check_types: check_types.clone(),
            },
        ) {
            warn!(worker_id = %id, "failed to publish registration: {e}");
        }

        let heartbeat_bus = Arc::clone(&bus);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            // Registration just announced us; the first beat can wait.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) =
                    heartbeat_bus.publish(subject::PROBE_HEARTBEAT, &WorkerHeartbeat { worker_id: id })
                {
                    warn!(worker_id = %id, "failed to send heartbeat: {e}");
                }
            }
        });

        let client = reqwest::Client::builder()
            .user_agent(concat!("pulsewatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");

        let actor = WorkerActor {
            context: Arc::new(WorkerContext { id, bus, client }),
            assignments,
            command_rx: cmd_rx,
            heartbeat,
        };

        tokio::spawn(actor.run());

        Self { id, sender: cmd_tx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(WorkerCommand::Shutdown).await;
    }
}
