//! Notification Service - durable delivery with retries
//!
//! Consumes `notifications.send`, persists every inbound notification
//! *before* the first attempt, fans it out to its channels' providers and
//! retries failures under exponential backoff.
//!
//! ## Retry machinery
//!
//! Failed notifications sit in a time-indexed queue (ordered by target unix
//! time, the in-process rendition of a sorted-set index). A worker polls
//! every 30 seconds and re-dispatches everything that has come due. The
//! k-th retry runs `2^(k-1)` minutes after the k-th failure; after
//! [`MAX_RETRIES`] failed retries the record goes terminal (`failed`) and
//! stays durable for operator inspection.
//!
//! On startup all `pending`/`retry` rows are re-queued, so a crash between
//! persist and delivery loses nothing.

pub mod providers;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, trace, warn};
use uuid::Uuid;

use crate::bus::{Bus, Subscription};
use crate::messages::{subject, NotificationRequest};
use crate::storage::{NotificationRow, NotificationStatus, StorageBackend};

use providers::NotificationProvider;

/// Retries per notification before the record goes terminal.
pub const MAX_RETRIES: i64 = 8;

const RETRY_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Backoff before the k-th retry (1-indexed): `2^(k-1)` minutes.
pub fn retry_delay(retry_count: u32) -> Duration {
    Duration::from_secs(60) * 2u32.pow(retry_count.saturating_sub(1).min(20))
}

#[derive(Debug)]
pub enum NotifyCommand {
    /// Number of notifications currently waiting for a retry slot
    QueueDepth { respond_to: oneshot::Sender<usize> },

    /// Gracefully shut down the service
    Shutdown,
}

pub struct NotifyActor {
    store: Arc<dyn StorageBackend>,
    providers: HashMap<String, Arc<dyn NotificationProvider>>,
    /// Time-indexed retry queue: key is (due unix seconds, notification id).
    retry_queue: BTreeMap<(i64, Uuid), ()>,
    inbound: Subscription,
    command_rx: mpsc::Receiver<NotifyCommand>,
}

impl NotifyActor {
    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting notification service");

        self.recover_unfinished().await;

        let mut poll = tokio::time::interval_at(
            tokio::time::Instant::now() + RETRY_POLL_INTERVAL,
            RETRY_POLL_INTERVAL,
        );

        loop {
            tokio::select! {
                request = self.inbound.recv::<NotificationRequest>() => {
                    match request {
                        Some(request) => self.handle_request(request).await,
                        None => {
                            warn!("notification stream closed, shutting down");
                            break;
                        }
                    }
                }

                _ = poll.tick() => {
                    self.drain_due_retries().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        NotifyCommand::QueueDepth { respond_to } => {
                            let _ = respond_to.send(self.retry_queue.len());
                        }
                        NotifyCommand::Shutdown => {
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

        debug!("notification service stopped");
    }

    /// Re-queue every notification a previous process left unfinished.
    async fn recover_unfinished(&mut self) {
        match self.store.unfinished_notifications().await {
            Ok(rows) => {
                let now = Utc::now().timestamp();
                let count = rows.len();
                for row in rows {
                    self.retry_queue.insert((now, row.id), ());
                }
                if count > 0 {
                    debug!("re-queued {count} unfinished notifications");
                }
            }
            Err(e) => error!("failed to load unfinished notifications: {e}"),
        }
    }

    #[instrument(skip(self, request))]
    async fn handle_request(&mut self, request: NotificationRequest) {
        let row = NotificationRow::from_request(request);

        // Persist first: a crash between here and dispatch must not lose
        // the notification.
        if let Err(e) = self.store.insert_notification(row.clone()).await {
            error!(notification_id = %row.id, "failed to persist notification: {e}");
            return;
        }
        trace!(notification_id = %row.id, "notification persisted");

        self.attempt(row).await;
    }

    /// Dispatch to every channel; any failure sends the whole notification
    /// into the retry path.
    async fn attempt(&mut self, row: NotificationRow) {
        let mut any_failed = false;

        for channel in &row.channels {
            match self.providers.get(channel) {
                Some(provider) => {
                    if let Err(e) = provider.send(&row).await {
                        warn!(
                            notification_id = %row.id,
                            channel = %channel,
                            "provider send failed: {e}"
                        );
                        any_failed = true;
                    }
                }
                None => {
                    error!(
                        notification_id = %row.id,
                        channel = %channel,
                        "unknown notification channel"
                    );
                }
            }
        }

        if any_failed {
            self.schedule_retry(row).await;
        } else {
            if let Err(e) = self
                .store
                .set_notification_status(row.id, NotificationStatus::Sent)
                .await
            {
                error!(notification_id = %row.id, "failed to mark notification sent: {e}");
            }
            debug!(notification_id = %row.id, "notification delivered");
        }
    }

    async fn schedule_retry(&mut self, row: NotificationRow) {
        if row.retry_count >= MAX_RETRIES {
            warn!(
                notification_id = %row.id,
                "notification failed terminally after {MAX_RETRIES} retries"
            );
            if let Err(e) = self
                .store
                .set_notification_status(row.id, NotificationStatus::Failed)
                .await
            {
                error!(notification_id = %row.id, "failed to mark notification failed: {e}");
            }
            return;
        }

        let retry_count = row.retry_count + 1;
        let now = Utc::now();
        if let Err(e) = self
            .store
            .mark_notification_retry(row.id, retry_count, now)
            .await
        {
            error!(notification_id = %row.id, "failed to persist retry state: {e}");
        }

        let delay = retry_delay(retry_count as u32);
        let due = now.timestamp() + delay.as_secs() as i64;
        self.retry_queue.insert((due, row.id), ());
        debug!(
            notification_id = %row.id,
            "retry {retry_count}/{MAX_RETRIES} scheduled in {}s",
            delay.as_secs()
        );
    }

    async fn drain_due_retries(&mut self) {
        let now = Utc::now().timestamp();
        let due: Vec<(i64, Uuid)> = self
            .retry_queue
            .range(..=(now, Uuid::max()))
            .map(|(key, _)| *key)
            .collect();

        for key in due {
            self.retry_queue.remove(&key);
            let (_, id) = key;

            match self.store.get_notification(id).await {
                Ok(Some(row)) => {
                    trace!(notification_id = %id, "re-dispatching");
                    self.attempt(row).await;
                }
                Ok(None) => warn!(notification_id = %id, "queued notification vanished"),
                Err(e) => {
                    error!(notification_id = %id, "failed to load notification for retry: {e}");
                    // Try again on the next poll rather than dropping it.
                    self.retry_queue.insert((now + 30, id), ());
                }
            }
        }
    }
}

/// Handle for controlling the notification service
#[derive(Clone)]
pub struct NotifyHandle {
    sender: mpsc::Sender<NotifyCommand>,
}

impl NotifyHandle {
    pub fn spawn(
        bus: Arc<Bus>,
        store: Arc<dyn StorageBackend>,
        providers: HashMap<String, Arc<dyn NotificationProvider>>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = NotifyActor {
            inbound: bus.subscribe(subject::NOTIFICATIONS_SEND),
            store,
            providers,
            retry_queue: BTreeMap::new(),
            command_rx: cmd_rx,
        };

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn queue_depth(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(NotifyCommand::QueueDepth { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(NotifyCommand::Shutdown).await;
    }
}
