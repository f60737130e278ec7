//! Persistent state for the measurement and alerting pipeline
//!
//! This module provides a trait-based abstraction over the stores the
//! pipeline writes to: the raw result time-series, rollup buckets, the
//! incidents table and the notifications table.
//!
//! ## Design
//!
//! - **Trait-based**: `StorageBackend` keeps the components decoupled from
//!   the concrete database
//! - **Async**: all operations are async for compatibility with the Tokio
//!   components
//! - **Idempotent writes**: the bus is at-least-once, so the hot insert
//!   paths are upserts
//!
//! The default backend is SQLite via sqlx (WAL mode, pooled connections);
//! pass `:memory:` as the path for throwaway databases in tests.

pub mod backend;
pub mod error;
pub mod schema;
pub mod sqlite;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use schema::{
    CheckResultRow, Granularity, IncidentRow, IncidentStatus, NotificationRow, NotificationStatus,
    RollupBucket,
};
pub use sqlite::SqliteBackend;
