use std::time::Duration;

use anyhow::Context;
use tracing::trace;

use crate::messages::MonitorType;

/// Process configuration, sourced from the environment only. The core takes
/// no CLI flags; endpoints and tunables arrive as `PULSEWATCH_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite path for the time-series and alerting state (`:memory:` works).
    pub db_path: String,
    /// Per-subject bus buffer size.
    pub bus_capacity: usize,
    /// OTLP collector endpoint for trace export, if any.
    pub otlp_endpoint: Option<String>,
    /// Check types the embedded probe worker advertises.
    pub worker_check_types: Vec<MonitorType>,
    /// How long shutdown waits for in-flight work to drain.
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let db_path =
            std::env::var("PULSEWATCH_DB_PATH").unwrap_or_else(|_| "./pulsewatch.db".to_string());

        let bus_capacity = match std::env::var("PULSEWATCH_BUS_CAPACITY") {
            Ok(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("invalid PULSEWATCH_BUS_CAPACITY: {raw:?}"))?,
            Err(_) => crate::bus::DEFAULT_CAPACITY,
        };

        let otlp_endpoint = std::env::var("PULSEWATCH_OTLP_ENDPOINT").ok();

        let worker_check_types = match std::env::var("PULSEWATCH_WORKER_CHECK_TYPES") {
            Ok(raw) => parse_check_types(&raw)?,
            Err(_) => vec![
                MonitorType::Http,
                MonitorType::Https,
                MonitorType::Tcp,
                MonitorType::Udp,
                MonitorType::Dns,
                MonitorType::Icmp,
            ],
        };

        let config = Self {
            db_path,
            bus_capacity,
            otlp_endpoint,
            worker_check_types,
            shutdown_grace: Duration::from_secs(5),
        };
        trace!("loaded config: {config:?}");
        Ok(config)
    }
}

fn parse_check_types(raw: &str) -> anyhow::Result<Vec<MonitorType>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            serde_json::from_value(serde_json::Value::String(s.to_uppercase()))
                .with_context(|| format!("unknown check type {s:?}"))
        })
        .collect()
}
