//! HTTP/HTTPS check handler
//!
//! Issues a GET against the target and judges the response status. For
//! HTTPS targets the handler first peeks at the server certificate on a
//! separate connection to record handshake time and expiry; a failed peek
//! never fails the check on its own, the GET stays authoritative.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use super::{tls, ProbeError, ProbeReport};
use crate::messages::{CheckRequest, MonitorType};

/// Response bodies are kept for keyword/pattern alert conditions, capped so
/// a misbehaving endpoint cannot balloon the result payload.
const BODY_CAP: usize = 64 * 1024;

pub(super) async fn check(
    client: &reqwest::Client,
    request: &CheckRequest,
    deadline: Duration,
) -> ProbeReport {
    let url = normalize_url(&request.target, request.check_type);
    let mut details = HashMap::new();

    if url.starts_with("https://") {
        match tls::endpoint_of(&url) {
            Some((host, port)) => match tls::peek_certificate(&host, port, deadline).await {
                Ok(peek) => {
                    details.insert(
                        "tls_handshake_ms".to_string(),
                        peek.handshake.as_millis().to_string(),
                    );
                    details.insert("cert_expiry".to_string(), peek.not_after.to_rfc3339());
                }
                Err(e) => debug!("certificate peek failed for {url}: {e}"),
            },
            None => debug!("cannot derive tls endpoint from {url}"),
        }
    }

    let response = match client.get(&url).timeout(deadline).send().await {
        Ok(response) => response,
        Err(e) => return ProbeReport::failed(classify_reqwest(e), details),
    };

    let status = response.status();
    details.insert("status_code".to_string(), status.as_u16().to_string());
    details.insert("status".to_string(), status.to_string());

    match response.text().await {
        Ok(mut body) => {
            body.truncate(floor_char_boundary(&body, BODY_CAP));
            details.insert("body".to_string(), body);
        }
        Err(e) => debug!("failed to read response body from {url}: {e}"),
    }

    let status_ok = match &request.expected_status_codes {
        Some(expected) => expected.contains(&status.as_u16()),
        None => status.as_u16() < 400,
    };

    if status_ok {
        ProbeReport::ok(details)
    } else {
        ProbeReport::failed(ProbeError::UnexpectedStatus(status.as_u16()), details)
    }
}

fn normalize_url(target: &str, check_type: MonitorType) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }
    match check_type {
        MonitorType::Https => format!("https://{target}"),
        _ => format!("http://{target}"),
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

fn classify_reqwest(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        return ProbeError::Timeout;
    }

    let mut messages = Vec::new();
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return ProbeError::ConnectionRefused(io.to_string());
            }
        }
        messages.push(err.to_string());
        source = err.source();
    }

    let joined = messages.join(": ").to_lowercase();
    if joined.contains("dns") || joined.contains("lookup") {
        ProbeError::Dns(joined)
    } else if joined.contains("certificate") || joined.contains("tls") || joined.contains("handshake")
    {
        ProbeError::Tls(joined)
    } else if joined.contains("connection refused") {
        ProbeError::ConnectionRefused(joined)
    } else {
        ProbeError::Other(joined)
    }
}
