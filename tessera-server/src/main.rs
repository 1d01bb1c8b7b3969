//! Tessera server - HTTP ingest and query surface for the engine

mod api;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tessera_core::{Db, DbOpts};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Partitioned time-series analytical database server
#[derive(Debug, Parser)]
#[command(name = "tesserad", version)]
struct Args {
    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:8040")]
    listen: SocketAddr,

    /// Root data directory
    #[arg(long, default_value = "data")]
    dir: PathBuf,

    /// YAML schema file defining tables
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Advance the clock on ingest timestamps instead of wall time
    #[arg(long)]
    virtual_time: bool,

    /// WAL fsync cadence in milliseconds; 0 syncs every write
    #[arg(long, default_value_t = 0)]
    wal_sync_interval_ms: u64,

    /// WAL retention window in hours
    #[arg(long, default_value_t = 24)]
    max_wal_age_hours: u64,

    /// Fraction of system RAM above which memstores are force-flushed
    #[arg(long, default_value_t = 0.0)]
    max_memory_ratio: f64,

    /// Run as a passthrough node (WAL only, queries fan out)
    #[arg(long)]
    passthrough: bool,

    /// Number of partitions for passthrough fan-out
    #[arg(long, default_value_t = 0)]
    num_partitions: usize,

    /// The partition this node owns
    #[arg(long, default_value_t = 0)]
    partition: usize,

    /// Dimensions tried in order for partition hashing
    #[arg(long, value_delimiter = ',')]
    partition_by: Vec<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .init();

    info!("starting tessera server");
    info!(dir = ?args.dir, schema = ?args.schema, "data configuration");

    let db = Db::open(DbOpts {
        dir: args.dir,
        schema_file: args.schema,
        virtual_time: args.virtual_time,
        wal_sync_interval: Duration::from_millis(args.wal_sync_interval_ms),
        max_wal_age: Duration::from_secs(args.max_wal_age_hours * 60 * 60),
        max_memory_ratio: args.max_memory_ratio,
        passthrough: args.passthrough,
        num_partitions: args.num_partitions,
        partition: args.partition,
        partition_by: args.partition_by,
        ..Default::default()
    })?;

    let app = api::create_router(db.clone());
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "tessera server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    db.shutdown();
    Ok(())
}
