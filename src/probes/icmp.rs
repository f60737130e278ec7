//! ICMP echo check handler
//!
//! Sends a single echo request over a raw (or, unprivileged, datagram) ICMP
//! socket and waits for the matching reply. The blocking socket work runs in
//! `spawn_blocking`; replies are matched on identifier and sequence so
//! concurrent pings to the same host never cross wires.
//!
//! A `spawn_blocking` thread cannot be aborted from the async side - when
//! the outer deadline fires, the worker stops waiting but the thread keeps
//! running. The blocking loop therefore bounds itself: every receive wait
//! is clamped to the time remaining before the deadline, so the thread
//! outlives the check by at most one socket timeout regardless of how much
//! cross-talk it has to skip.

use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::{ProbeError, ProbeReport};

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

pub(super) async fn check(target: &str, deadline: Duration) -> ProbeReport {
    let ip = match resolve(target).await {
        Ok(ip) => ip,
        Err(e) => return ProbeReport::failed(e, HashMap::new()),
    };

    let result = tokio::task::spawn_blocking(move || blocking_echo(ip, deadline)).await;

    match result {
        Ok(Ok(rtt)) => {
            let mut details = HashMap::new();
            details.insert("resolved_ip".to_string(), ip.to_string());
            details.insert("icmp_rtt_ms".to_string(), rtt.as_millis().to_string());
            ProbeReport::ok(details)
        }
        Ok(Err(e)) => ProbeReport::failed(e, HashMap::new()),
        Err(e) => ProbeReport::failed(
            ProbeError::Other(format!("echo task failed: {e}")),
            HashMap::new(),
        ),
    }
}

async fn resolve(target: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host((target, 0u16))
        .await
        .map_err(|e| ProbeError::Dns(e.to_string()))?;
    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or(ProbeError::ResolverEmpty)
}

fn blocking_echo(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    match ip {
        IpAddr::V4(v4) => blocking_echo_v4(v4, timeout),
        IpAddr::V6(v6) => blocking_echo_v6(v6, timeout),
    }
}

fn open_socket(domain: Domain, protocol: Protocol) -> Result<Socket, ProbeError> {
    // RAW needs CAP_NET_RAW; DGRAM works unprivileged where the platform
    // allows it.
    Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Other(format!("failed to create ICMP socket: {e}")))
}

fn blocking_echo_v4(ip: Ipv4Addr, timeout: Duration) -> Result<Duration, ProbeError> {
    let socket = open_socket(Domain::IPV4, Protocol::ICMPV4)?;
    configure(&socket, timeout, SocketAddr::new(IpAddr::V4(ip), 0))?;

    let (identifier, sequence) = generate_ping_id();
    let packet = build_echo_request(8, identifier, sequence, true);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| ProbeError::Other(format!("failed to send echo request: {e}")))?;

    await_reply(&socket, timeout, start, |buf, len| {
        // RAW sockets deliver the IP header too; DGRAM starts at ICMP.
        let offset = if buf[0] >> 4 == 4 { 20 } else { 0 };
        if len <= offset + 7 {
            return false;
        }
        buf[offset] == 0
            && u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]) == identifier
            && u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]) == sequence
    })
}

fn blocking_echo_v6(ip: Ipv6Addr, timeout: Duration) -> Result<Duration, ProbeError> {
    let socket = open_socket(Domain::IPV6, Protocol::ICMPV6)?;
    configure(&socket, timeout, SocketAddr::new(IpAddr::V6(ip), 0))?;

    let (identifier, sequence) = generate_ping_id();
    // ICMPv6 checksums are filled in by the kernel.
    let packet = build_echo_request(128, identifier, sequence, false);

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| ProbeError::Other(format!("failed to send echo request: {e}")))?;

    await_reply(&socket, timeout, start, |buf, len| {
        len >= 8
            && buf[0] == 129
            && u16::from_be_bytes([buf[4], buf[5]]) == identifier
            && u16::from_be_bytes([buf[6], buf[7]]) == sequence
    })
}

fn configure(socket: &Socket, timeout: Duration, dest: SocketAddr) -> Result<(), ProbeError> {
    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Other(format!("failed to set timeout: {e}")))?;
    socket
        .connect(&dest.into())
        .map_err(|e| super::classify_io(&e))
}

fn await_reply(
    socket: &Socket,
    timeout: Duration,
    start: Instant,
    is_ours: impl Fn(&[u8], usize) -> bool,
) -> Result<Duration, ProbeError> {
    loop {
        // Connected ICMP sockets see every matching datagram on the host,
        // so each wait must be re-bounded by the time actually left; a
        // fixed SO_RCVTIMEO would let cross-talk extend the blocking work
        // past the deadline.
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout);
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Other(format!("failed to set timeout: {e}")))?;

        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout
            } else {
                ProbeError::Other(format!("failed to receive: {e}"))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout);
        }

        if len >= 8 && is_ours(buf, len) {
            return Ok(elapsed);
        }
        // Someone else's reply; keep waiting for ours.
    }
}

/// Build an echo request packet: 8 byte header + 56 byte payload.
fn build_echo_request(icmp_type: u8, identifier: u16, sequence: u16, checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = icmp_type;
    packet[1] = 0; // Code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    if checksum {
        let sum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }

    packet
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i < data.len() - 1 {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }

    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}
