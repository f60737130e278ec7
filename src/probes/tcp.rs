//! TCP check handler: the probe is the dial itself.

use std::collections::HashMap;

use tokio::net::TcpStream;

use super::{classify_io, ProbeReport};

pub(super) async fn check(target: &str) -> ProbeReport {
    match TcpStream::connect(target).await {
        Ok(_stream) => ProbeReport::ok(HashMap::new()),
        Err(e) => ProbeReport::failed(classify_io(&e), HashMap::new()),
    }
}
