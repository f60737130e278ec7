//! Ingestion - persists raw check results
//!
//! Subscribes to `probes.check.result`, upserts each result into the
//! time-series store and republishes a compact event on `analytics.ingest`
//! for downstream aggregation.
//!
//! Results referencing unknown or deleted monitors are persisted without
//! complaint: a monitor may legitimately disappear between dispatch and
//! result arrival, and ingestion is not the place to police referential
//! integrity.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, trace, warn};

use crate::bus::{Bus, Subscription};
use crate::messages::{subject, CheckResult, IngestEvent};
use crate::storage::{CheckResultRow, StorageBackend};

#[derive(Debug)]
pub enum IngestCommand {
    /// Number of results successfully persisted since startup
    Ingested { respond_to: oneshot::Sender<u64> },

    /// Gracefully shut down the ingestion stage
    Shutdown,
}

pub struct IngestActor {
    store: Arc<dyn StorageBackend>,
    bus: Arc<Bus>,
    ingested: u64,
    results: Subscription,
    command_rx: mpsc::Receiver<IngestCommand>,
}

impl IngestActor {
    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting ingestion");

        loop {
            tokio::select! {
                result = self.results.recv::<CheckResult>() => {
                    match result {
                        Some(result) => self.persist(result).await,
                        None => {
                            warn!("result stream closed, shutting down");
                            break;
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        IngestCommand::Ingested { respond_to } => {
                            let _ = respond_to.send(self.ingested);
                        }
                        IngestCommand::Shutdown => {
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

        debug!("ingestion stopped");
    }

    #[instrument(skip(self, result), fields(monitor_id = %result.monitor_id))]
    async fn persist(&mut self, result: CheckResult) {
        let event = IngestEvent {
            monitor_id: result.monitor_id,
            timestamp: result.timestamp,
            success: result.success,
            duration_ms: result.duration_ms,
        };

        if let Err(e) = self
            .store
            .insert_check_result(CheckResultRow::from(result))
            .await
        {
            error!("failed to persist check result: {e}");
            return;
        }

        self.ingested += 1;
        trace!("check result persisted");

        if let Err(e) = self.bus.publish(subject::ANALYTICS_INGEST, &event) {
            warn!("failed to forward to analytics: {e}");
        }
    }
}

/// Handle for controlling the ingestion stage
#[derive(Clone)]
pub struct IngestHandle {
    sender: mpsc::Sender<IngestCommand>,
}

impl IngestHandle {
    pub fn spawn(bus: Arc<Bus>, store: Arc<dyn StorageBackend>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = IngestActor {
            results: bus.subscribe(subject::CHECK_RESULT),
            bus,
            store,
            ingested: 0,
            command_rx: cmd_rx,
        };

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn ingested(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(IngestCommand::Ingested { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(IngestCommand::Shutdown).await;
    }
}
