//! DNS check handler: resolve the hostname, succeed on at least one record.

use std::collections::HashMap;

use super::{ProbeError, ProbeReport};

pub(super) async fn check(hostname: &str) -> ProbeReport {
    match tokio::net::lookup_host((hostname, 0u16)).await {
        Ok(addrs) => {
            let mut details = HashMap::new();
            let mut count = 0usize;
            for addr in addrs {
                count += 1;
                details.insert(format!("ip_{count}"), addr.ip().to_string());
            }
            if count == 0 {
                return ProbeReport::failed(ProbeError::ResolverEmpty, details);
            }
            ProbeReport::ok(details)
        }
        Err(e) => ProbeReport::failed(ProbeError::Dns(e.to_string()), HashMap::new()),
    }
}
