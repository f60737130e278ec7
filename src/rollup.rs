//! Rollup aggregator - hourly and daily statistics
//!
//! Aggregates raw check results into per-monitor hourly buckets, and hourly
//! buckets into daily ones. Both writes are idempotent upserts keyed by
//! `(monitor_id, bucket_start)`, so re-running an aggregation for the same
//! closed window converges to identical rows.
//!
//! ## Late data
//!
//! Results that land in an already-closed bucket stay in the raw table; the
//! timers never reopen old buckets. Operators correct closed rollups by
//! calling [`aggregate_hour`] (and [`aggregate_day`]) again for the affected
//! window - that is the backfill path.
//!
//! ## Approximations
//!
//! Daily p95 is recomputed over the hourly p95 values, not the raw
//! durations. Good enough for dashboards, not for SLA accounting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, trace, warn};

use crate::bus::{Bus, Subscription};
use crate::messages::{subject, IngestEvent};
use crate::storage::{Granularity, RollupBucket, StorageBackend, StorageResult};

const HOURLY_TICK: Duration = Duration::from_secs(60 * 60);
const DAILY_TICK: Duration = Duration::from_secs(24 * 60 * 60);

/// Truncate a timestamp to the start of its hour.
pub fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(3600), 0).unwrap_or(ts)
}

/// Truncate a timestamp to the start of its UTC day.
pub fn day_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(86_400), 0).unwrap_or(ts)
}

/// Nearest-rank p95 over an ascending-sorted slice.
pub fn nearest_rank_p95(sorted: &[i64]) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Aggregate one closed hour across all monitors with results in it.
/// Safe to re-run for any hour; also the operator backfill entry point.
#[instrument(skip(store))]
pub async fn aggregate_hour(
    store: &dyn StorageBackend,
    hour_start: DateTime<Utc>,
) -> StorageResult<usize> {
    let hour_end = hour_start + TimeDelta::hours(1);
    let monitors = store.monitors_with_results(hour_start, hour_end).await?;

    let mut written = 0;
    for monitor_id in monitors {
        let rows = store.query_results(monitor_id, hour_start, hour_end).await?;
        if rows.is_empty() {
            continue;
        }

        let total = rows.len() as i64;
        let successful = rows.iter().filter(|r| r.success).count() as i64;
        let mut durations: Vec<i64> = rows.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();

        let bucket = RollupBucket {
            monitor_id,
            bucket_start: hour_start,
            total_checks: total,
            successful_checks: successful,
            failed_checks: total - successful,
            avg_duration_ms: durations.iter().sum::<i64>() as f64 / total as f64,
            min_duration_ms: durations[0],
            max_duration_ms: durations[durations.len() - 1],
            p95_duration_ms: nearest_rank_p95(&durations),
            uptime_percentage: successful as f64 / total as f64 * 100.0,
        };

        store.upsert_rollup(Granularity::Hour, bucket).await?;
        written += 1;
    }

    debug!(
        "hourly aggregation for {} wrote {written} buckets",
        hour_start.to_rfc3339()
    );
    Ok(written)
}

/// Derive one day bucket per monitor from its hourly buckets: counts are
/// summed, the average is count-weighted, and p95 is recomputed over the
/// hourly p95s (documented approximation).
#[instrument(skip(store))]
pub async fn aggregate_day(
    store: &dyn StorageBackend,
    day_start: DateTime<Utc>,
) -> StorageResult<usize> {
    let day_end = day_start + TimeDelta::days(1);
    let monitors = store.monitors_with_hourly_rollups(day_start, day_end).await?;

    let mut written = 0;
    for monitor_id in monitors {
        let hours = store
            .query_rollups(Granularity::Hour, monitor_id, day_start, day_end)
            .await?;

        let total: i64 = hours.iter().map(|h| h.total_checks).sum();
        if total == 0 {
            continue;
        }

        let successful: i64 = hours.iter().map(|h| h.successful_checks).sum();
        let weighted_sum: f64 = hours
            .iter()
            .map(|h| h.avg_duration_ms * h.total_checks as f64)
            .sum();
        let mut hour_p95s: Vec<i64> = hours.iter().map(|h| h.p95_duration_ms).collect();
        hour_p95s.sort_unstable();

        let bucket = RollupBucket {
            monitor_id,
            bucket_start: day_start,
            total_checks: total,
            successful_checks: successful,
            failed_checks: total - successful,
            avg_duration_ms: weighted_sum / total as f64,
            min_duration_ms: hours.iter().map(|h| h.min_duration_ms).min().unwrap_or(0),
            max_duration_ms: hours.iter().map(|h| h.max_duration_ms).max().unwrap_or(0),
            p95_duration_ms: nearest_rank_p95(&hour_p95s),
            uptime_percentage: successful as f64 / total as f64 * 100.0,
        };

        store.upsert_rollup(Granularity::Day, bucket).await?;
        written += 1;
    }

    debug!(
        "daily aggregation for {} wrote {written} buckets",
        day_start.to_rfc3339()
    );
    Ok(written)
}

#[derive(Debug)]
pub enum RollupCommand {
    /// Compact ingest events observed since startup
    Observed { respond_to: oneshot::Sender<u64> },

    /// Gracefully shut down the aggregator
    Shutdown,
}

pub struct RollupActor {
    store: Arc<dyn StorageBackend>,
    observed: u64,
    ingest_rx: Subscription,
    command_rx: mpsc::Receiver<RollupCommand>,
}

impl RollupActor {
    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting rollup aggregator");

        let mut hourly = tokio::time::interval_at(
            tokio::time::Instant::now() + HOURLY_TICK,
            HOURLY_TICK,
        );
        let mut daily =
            tokio::time::interval_at(tokio::time::Instant::now() + DAILY_TICK, DAILY_TICK);

        loop {
            tokio::select! {
                _ = hourly.tick() => {
                    let closed = hour_floor(Utc::now()) - TimeDelta::hours(1);
                    if let Err(e) = aggregate_hour(self.store.as_ref(), closed).await {
                        error!("hourly aggregation failed: {e}");
                    }
                }

                _ = daily.tick() => {
                    let closed = day_floor(Utc::now()) - TimeDelta::days(1);
                    if let Err(e) = aggregate_day(self.store.as_ref(), closed).await {
                        error!("daily aggregation failed: {e}");
                    }
                }

                event = self.ingest_rx.recv::<IngestEvent>() => {
                    match event {
                        Some(event) => {
                            self.observed += 1;
                            trace!(monitor_id = %event.monitor_id, "ingest event observed");
                        }
                        None => {
                            warn!("ingest stream closed, shutting down");
                            break;
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        RollupCommand::Observed { respond_to } => {
                            let _ = respond_to.send(self.observed);
                        }
                        RollupCommand::Shutdown => {
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

        debug!("rollup aggregator stopped");
    }
}

/// Handle for controlling the rollup aggregator
#[derive(Clone)]
pub struct RollupHandle {
    sender: mpsc::Sender<RollupCommand>,
}

impl RollupHandle {
    pub fn spawn(bus: Arc<Bus>, store: Arc<dyn StorageBackend>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = RollupActor {
            ingest_rx: bus.subscribe(subject::ANALYTICS_INGEST),
            store,
            observed: 0,
            command_rx: cmd_rx,
        };

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn observed(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RollupCommand::Observed { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(RollupCommand::Shutdown).await;
    }
}
