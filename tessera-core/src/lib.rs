//! Tessera Core - Partitioned Time-Series Analytical Database Engine
//!
//! Tessera ingests timestamped points carrying named dimensions and numeric
//! measurements, appends them durably to per-stream write-ahead logs, and
//! aggregates them into fixed-resolution time buckets held in per-table
//! memstores. Queries execute through a composable dataflow pipeline and can
//! fan out across partitioned followers.
//!
//! # Architecture
//!
//! - **WAL**: per-stream segmented append-only log with named, resumable
//!   readers; provides durability and replay
//! - **Memstore**: per-table map of grouping dimensions to aggregated
//!   bucket sequences, flushed to cold storage under memory pressure
//! - **Expressions**: binary-encoded aggregation states (sum, count, avg,
//!   min, max, conditionals, arithmetic) with a mergeable update contract
//! - **Dataflow**: source/transform stages (scans, filters, group-bys,
//!   crosstabs, merges) composed into query execution trees
//! - **Cluster**: murmur3-partitioned WAL streaming from passthrough nodes
//!   to followers, plus a per-partition query handler registry

pub mod cluster;
pub mod core;
pub mod db;
pub mod encoding;
pub mod expr;
pub mod schema;
pub mod table;
pub mod wal;

mod clock;
mod error;

pub use clock::Clock;
pub use db::{Db, DbOpts};
pub use error::{Error, Result};

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Default WAL retention window
    pub const MAX_WAL_AGE: Duration = Duration::from_secs(24 * 60 * 60);

    /// WAL segment size before rotation (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

    /// Capacity of each table's ingest queue
    pub const INGEST_QUEUE_DEPTH: usize = 1024;

    /// Capacity of the per-partition query handler channel
    pub const HANDLER_QUEUE_DEPTH: usize = 100;

    /// How often the memory guard samples usage
    pub const MEM_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

    /// How often aged WAL segments are truncated and compressed
    pub const WAL_CAP_INTERVAL: Duration = Duration::from_secs(60);

    /// How often idle remote query handlers are freshened
    pub const HANDLER_FRESHEN_INTERVAL: Duration = Duration::from_secs(5 * 60);
}
