//! Protocol-specific check handlers
//!
//! Each handler executes one probe against one target and reports the
//! outcome without ever panicking: protocol failures are data, captured in
//! the report and ultimately in `CheckResult.error`.

mod dns;
mod http;
mod icmp;
mod tcp;
mod tls;
mod udp;

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::messages::{CheckRequest, MonitorType};

/// Probe failure taxonomy. The wire codes are part of the result contract
/// and consumed by alert conditions.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("dns failure: {0}")]
    Dns(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
    #[error("resolver returned no records")]
    ResolverEmpty,
    #[error("{0}")]
    Other(String),
}

impl ProbeError {
    /// Stable code surfaced in `CheckResult.error`.
    pub fn wire_code(&self) -> &'static str {
        match self {
            ProbeError::Timeout => "timeout",
            ProbeError::Dns(_) => "dns_failure",
            ProbeError::ConnectionRefused(_) => "connection_refused",
            ProbeError::Tls(_) => "tls_error",
            ProbeError::UnexpectedStatus(_) => "unexpected_status",
            ProbeError::ResolverEmpty => "resolver_empty",
            ProbeError::Other(_) => "unknown",
        }
    }
}

/// Outcome of one probe execution. Failures may still carry details
/// (an unexpected HTTP status keeps its status code, for example).
#[derive(Debug)]
pub struct ProbeReport {
    pub success: bool,
    pub error: Option<ProbeError>,
    pub details: HashMap<String, String>,
}

impl ProbeReport {
    pub fn ok(details: HashMap<String, String>) -> Self {
        Self {
            success: true,
            error: None,
            details,
        }
    }

    pub fn failed(error: ProbeError, details: HashMap<String, String>) -> Self {
        Self {
            success: false,
            error: Some(error),
            details,
        }
    }
}

/// Execute one check under its deadline.
///
/// The deadline binds the entire check; it is the only cancellation path a
/// probe has.
pub async fn execute(
    client: &reqwest::Client,
    request: &CheckRequest,
    deadline: Duration,
) -> ProbeReport {
    let check = async {
        match request.check_type {
            MonitorType::Http | MonitorType::Https => {
                http::check(client, request, deadline).await
            }
            MonitorType::Tcp => tcp::check(&request.target).await,
            MonitorType::Udp => udp::check(&request.target).await,
            MonitorType::Dns => dns::check(&request.target).await,
            MonitorType::Icmp => icmp::check(&request.target, deadline).await,
        }
    };

    match tokio::time::timeout(deadline, check).await {
        Ok(report) => report,
        Err(_) => ProbeReport::failed(ProbeError::Timeout, HashMap::new()),
    }
}

/// Map an I/O error from a dial or send onto the probe taxonomy.
pub(crate) fn classify_io(e: &std::io::Error) -> ProbeError {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => ProbeError::ConnectionRefused(e.to_string()),
        std::io::ErrorKind::TimedOut => ProbeError::Timeout,
        _ => {
            let msg = e.to_string();
            if msg.contains("failed to lookup address") || msg.contains("Name or service not known")
            {
                ProbeError::Dns(msg)
            } else {
                ProbeError::Other(msg)
            }
        }
    }
}
