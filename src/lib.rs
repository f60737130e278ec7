//! pulsewatch - a distributed uptime and health monitoring pipeline
//!
//! User-defined monitors (HTTP, HTTPS, TCP, UDP, DNS, ICMP) are executed
//! periodically by probe workers, ingested into a time-series store,
//! aggregated into rollups, evaluated against alert rules and delivered
//! through notification channels with retries.
//!
//! ## Architecture Overview
//!
//! Five components, coupled only through a subject-addressed pub/sub bus:
//!
//! ```text
//! [config] → Scheduler ──(probes.check.request)──→ Probe Manager
//!                                                       │ (probes.check.assign.<worker>)
//!                                                       ▼
//!                         Probe Worker(s) ──(probes.check.result)──┐
//!                                                                  │
//!          ┌───────────────────────────────────────────────────────┤
//!          ▼                                                       ▼
//!      Ingestion → time-series store                         Alert Manager
//!          │                                                       │
//!          ▼ (analytics.ingest)                        (notifications.send)
//!      Rollup aggregator                                           ▼
//!                                                       Notification Service
//! ```
//!
//! Each component is an independent async task controlled through a handle
//! (see the `*Handle::spawn` constructors); the binary in
//! `src/bin/pulsewatchd.rs` wires them all against a shared [`bus::Bus`]
//! and [`storage::StorageBackend`].

pub mod alert;
pub mod bus;
pub mod config;
pub mod ingest;
pub mod manager;
pub mod messages;
pub mod notify;
pub mod probes;
pub mod rollup;
pub mod scheduler;
pub mod storage;
pub mod worker;
