//! UDP check handler
//!
//! UDP gives no delivery signal, so this check is best-effort by design: a
//! successful dial plus an accepted empty datagram counts as "up". An
//! unreachable host only surfaces if the local stack rejects the send.

use std::collections::HashMap;

use tokio::net::UdpSocket;

use super::{classify_io, ProbeError, ProbeReport};

pub(super) async fn check(target: &str) -> ProbeReport {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            return ProbeReport::failed(
                ProbeError::Other(format!("failed to bind socket: {e}")),
                HashMap::new(),
            )
        }
    };

    if let Err(e) = socket.connect(target).await {
        return ProbeReport::failed(classify_io(&e), HashMap::new());
    }

    match socket.send(&[]).await {
        Ok(_) => ProbeReport::ok(HashMap::new()),
        Err(e) => ProbeReport::failed(classify_io(&e), HashMap::new()),
    }
}
