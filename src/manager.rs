//! Probe Manager - tracks worker liveness and dispatches checks
//!
//! Maintains the registry of probe workers (fed by `probes.register` and
//! `probes.heartbeat`) and routes every `CheckRequest` to exactly one
//! eligible worker on that worker's private assignment subject.
//!
//! ## Liveness state machine
//!
//! ```text
//! register/heartbeat → active
//! 60s silence        → inactive   (kept, not dispatched to)
//! 300s silence       → evicted    (forgotten)
//! ```
//!
//! A sweeper task enforces the transitions every 30 seconds.
//!
//! ## Dispatch policy
//!
//! Least-recently-assigned among active workers supporting the check type,
//! ties broken by lexicographic worker id. This approximates round-robin
//! without a central queue. When no worker qualifies the request is dropped
//! with a structured log and a counter bump; the scheduler's next tick is
//! the retry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::bus::{Bus, Subscription};
use crate::messages::{
    subject, CheckAssignment, CheckRequest, MonitorType, WorkerHeartbeat, WorkerRegistration,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const INACTIVE_AFTER_SECONDS: i64 = 60;
const EVICT_AFTER_SECONDS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Active,
    Inactive,
}

pub struct WorkerRecord {
    pub id: Uuid,
    pub supported_types: HashSet<MonitorType>,
    pub status: WorkerStatus,
    pub last_seen: DateTime<Utc>,
    /// Assignment sequence number, written under the registry read lock.
    /// A logical clock instead of wall time keeps least-recently-assigned
    /// meaningful even when dispatches land in the same millisecond.
    last_assigned: AtomicU64,
}

/// Snapshot of one worker for introspection and tests.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: Uuid,
    pub status: WorkerStatus,
    pub last_seen: DateTime<Utc>,
}

/// Commands that can be sent to the probe manager
#[derive(Debug)]
pub enum ManagerCommand {
    /// Snapshot of the worker registry
    Workers {
        respond_to: oneshot::Sender<Vec<WorkerInfo>>,
    },

    /// How many check requests were dropped for lack of workers
    DroppedRequests { respond_to: oneshot::Sender<u64> },

    /// Gracefully shut down the manager and its sweeper
    Shutdown,
}

pub struct ManagerActor {
    bus: Arc<Bus>,
    registry: Arc<RwLock<HashMap<Uuid, WorkerRecord>>>,
    assign_seq: AtomicU64,
    dropped: u64,
    requests: Subscription,
    registrations: Subscription,
    heartbeats: Subscription,
    command_rx: mpsc::Receiver<ManagerCommand>,
    sweeper: JoinHandle<()>,
}

impl ManagerActor {
    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting probe manager");

        loop {
            tokio::select! {
                request = self.requests.recv::<CheckRequest>() => {
                    match request {
                        Some(request) => self.dispatch(request).await,
                        None => {
                            warn!("check request stream closed, shutting down");
                            break;
                        }
                    }
                }

                registration = self.registrations.recv::<WorkerRegistration>() => {
                    if let Some(registration) = registration {
                        self.register(registration).await;
                    }
                }

                heartbeat = self.heartbeats.recv::<WorkerHeartbeat>() => {
                    if let Some(heartbeat) = heartbeat {
                        self.heartbeat(heartbeat).await;
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        ManagerCommand::Workers { respond_to } => {
                            let registry = self.registry.read().await;
                            let snapshot = registry
                                .values()
                                .map(|w| WorkerInfo {
                                    id: w.id,
                                    status: w.status,
                                    last_seen: w.last_seen,
                                })
                                .collect();
                            let _ = respond_to.send(snapshot);
                        }
                        ManagerCommand::DroppedRequests { respond_to } => {
                            let _ = respond_to.send(self.dropped);
                        }
                        ManagerCommand::Shutdown => {
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

        self.sweeper.abort();
        debug!("probe manager stopped");
    }

    async fn register(&self, registration: WorkerRegistration) {
        let mut registry = self.registry.write().await;
        let entry = registry
            .entry(registration.id)
            .or_insert_with(|| WorkerRecord {
                id: registration.id,
                supported_types: HashSet::new(),
                status: WorkerStatus::Active,
                last_seen: Utc::now(),
                last_assigned: AtomicU64::new(0),
            });
        entry.supported_types = registration.check_types.into_iter().collect();
        entry.status = WorkerStatus::Active;
        entry.last_seen = Utc::now();
        info!(worker_id = %registration.id, "worker registered");
    }

    async fn heartbeat(&self, heartbeat: WorkerHeartbeat) {
        let mut registry = self.registry.write().await;
        match registry.get_mut(&heartbeat.worker_id) {
            Some(worker) => {
                worker.last_seen = Utc::now();
                worker.status = WorkerStatus::Active;
            }
            None => {
                // Heartbeat from a worker we evicted or never saw; it will
                // re-register on its own cadence.
                trace!(worker_id = %heartbeat.worker_id, "heartbeat from unknown worker");
            }
        }
    }

    /// Route one request to the least-recently-assigned eligible worker.
    #[instrument(skip(self, request), fields(monitor_id = %request.monitor_id))]
    async fn dispatch(&mut self, request: CheckRequest) {
        let registry = self.registry.read().await;

        let chosen = registry
            .values()
            .filter(|w| {
                w.status == WorkerStatus::Active && w.supported_types.contains(&request.check_type)
            })
            .min_by_key(|w| (w.last_assigned.load(Ordering::Relaxed), w.id));

        let Some(worker) = chosen else {
            self.dropped += 1;
            warn!(
                monitor_id = %request.monitor_id,
                check_type = %request.check_type,
                dropped_total = self.dropped,
                "no eligible worker, dropping check request"
            );
            return;
        };

        let seq = self.assign_seq.fetch_add(1, Ordering::Relaxed) + 1;
        worker.last_assigned.store(seq, Ordering::Relaxed);

        let worker_id = worker.id;
        drop(registry);

        trace!(worker_id = %worker_id, "dispatching check");
        let assignment = CheckAssignment { request, worker_id };
        if let Err(e) = self
            .bus
            .publish(&subject::check_assign(worker_id), &assignment)
        {
            warn!(worker_id = %worker_id, "failed to publish assignment: {e}");
        }
    }
}

/// One sweep over the registry: flip silent workers to inactive, evict the
/// long-gone. Separated out so the state machine is directly testable.
fn sweep_registry(registry: &mut HashMap<Uuid, WorkerRecord>, now: DateTime<Utc>) {
    registry.retain(|id, worker| {
        let silence = now.signed_duration_since(worker.last_seen);
        if silence > TimeDelta::seconds(EVICT_AFTER_SECONDS) {
            info!(worker_id = %id, "evicting worker after {}s of silence", silence.num_seconds());
            return false;
        }
        if silence > TimeDelta::seconds(INACTIVE_AFTER_SECONDS)
            && worker.status == WorkerStatus::Active
        {
            debug!(worker_id = %id, "marking worker inactive");
            worker.status = WorkerStatus::Inactive;
        }
        true
    });
}

/// Handle for controlling the probe manager
#[derive(Clone)]
pub struct ManagerHandle {
    sender: mpsc::Sender<ManagerCommand>,
}

impl ManagerHandle {
    /// Spawn the probe manager and its background sweeper
    pub fn spawn(bus: Arc<Bus>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let registry = Arc::new(RwLock::new(HashMap::new()));

        let sweeper_registry = Arc::clone(&registry);
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            // The immediate first tick would sweep an empty registry.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut registry = sweeper_registry.write().await;
                sweep_registry(&mut registry, Utc::now());
            }
        });

        let actor = ManagerActor {
            requests: bus.subscribe(subject::CHECK_REQUEST),
            registrations: bus.subscribe(subject::PROBE_REGISTER),
            heartbeats: bus.subscribe(subject::PROBE_HEARTBEAT),
            bus,
            registry,
            assign_seq: AtomicU64::new(0),
            dropped: 0,
            command_rx: cmd_rx,
            sweeper,
        };

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ManagerCommand::Workers { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn dropped_requests(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ManagerCommand::DroppedRequests { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(ManagerCommand::Shutdown).await;
    }
}
