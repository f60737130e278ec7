use std::sync::Arc;

use pulsewatch::{
    alert::AlertHandle,
    bus::Bus,
    config::Config,
    ingest::IngestHandle,
    manager::ManagerHandle,
    notify::{providers, NotifyHandle},
    rollup::RollupHandle,
    scheduler::SchedulerHandle,
    storage::{SqliteBackend, StorageBackend},
    worker::WorkerHandle,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pulsewatch=info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Fatal init: a malformed environment or an unreachable store exits
    // non-zero before any component starts.
    let config = Config::from_env()?;
    if let Some(endpoint) = &config.otlp_endpoint {
        info!("trace export configured for {endpoint}");
    }

    let store: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::new(&config.db_path).await?);
    let bus = Arc::new(Bus::new(config.bus_capacity));

    // Consumers first, producers last, so nothing published during startup
    // is lost to a not-yet-subscribed component.
    let ingest = IngestHandle::spawn(Arc::clone(&bus), Arc::clone(&store));
    let rollup = RollupHandle::spawn(Arc::clone(&bus), Arc::clone(&store));
    let alert = AlertHandle::spawn(Arc::clone(&bus), Arc::clone(&store), vec![]);

    let http_client = reqwest::Client::new();
    let notify = NotifyHandle::spawn(
        Arc::clone(&bus),
        Arc::clone(&store),
        providers::default_providers(&http_client),
    );

    let manager = ManagerHandle::spawn(Arc::clone(&bus));
    let worker = WorkerHandle::spawn(Arc::clone(&bus), config.worker_check_types.clone());
    info!(worker_id = %worker.id(), "embedded probe worker started");

    // Monitors arrive over the bus; the configuration collaborator
    // re-announces them when the scheduler (re)starts.
    let scheduler = SchedulerHandle::spawn(Arc::clone(&bus), vec![]);

    info!("all components started, monitoring active");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, draining..."),
        Err(e) => error!("unable to listen for shutdown signal: {e}"),
    }

    let drain = async {
        scheduler.shutdown().await;
        manager.shutdown().await;
        worker.shutdown().await;
        alert.shutdown().await;
        rollup.shutdown().await;
        ingest.shutdown().await;
        notify.shutdown().await;
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!(
            "shutdown deadline of {:?} exceeded, exiting anyway",
            config.shutdown_grace
        );
    }

    if let Err(e) = store.close().await {
        warn!("failed to close store: {e}");
    }

    info!("pulsewatch stopped");
    Ok(())
}
