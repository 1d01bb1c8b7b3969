//! The database: streams, tables, cluster wiring, background maintenance

use crate::cluster::{
    self, partition_for, ClusterResult, Follow, HandlerRegistry, QueryClusterFn, RemoteOutcome,
    RemoteQuery, RemoteRowFn,
};
use crate::clock::Clock;
use crate::core::{Fields, QueryContext, RowSource, Vals};
use crate::encoding::{ByteMap, Timestamp};
use crate::schema::{self, SchemaFile};
use crate::table::{Table, TableConfig, TableStats};
use crate::wal::{encode_point, Offset, Wal, WalOptions};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Callback receiving one followed WAL entry and its new offset
pub type EntryCallback<'a> = &'a mut (dyn FnMut(&[u8], Offset) -> Result<()> + Send);

/// Installed on followers: requests a partition's slice of a stream from a
/// passthrough node, invoking the callback per matching entry
pub type FollowFn =
    Arc<dyn for<'a> Fn(Follow, EntryCallback<'a>) -> Result<()> + Send + Sync>;

/// Installed on followers: registers this node's query handler with the
/// passthrough for its partition
pub type RegisterRemoteQueryHandlerFn = Arc<dyn Fn(usize, QueryClusterFn) + Send + Sync>;

/// Planner glue: executes a remote query locally and streams rows back
pub type QueryRunnerFn = Arc<
    dyn for<'a> Fn(&'a QueryContext, &'a RemoteQuery, RemoteRowFn<'a>) -> RemoteOutcome
        + Send
        + Sync,
>;

/// Options for configuring the database
#[derive(Clone, Default)]
pub struct DbOpts {
    /// Root data directory
    pub dir: PathBuf,
    /// YAML schema path, polled for table additions
    pub schema_file: Option<PathBuf>,
    /// Expression alias file; consumed by the external alias loader
    pub aliases_file: Option<PathBuf>,
    /// Enables geolocation expression helpers (external provider)
    pub enable_geo: bool,
    /// ISP lookup provider name (external provider)
    pub isp_provider: Option<String>,
    /// Redis address for redis-backed expression helpers (external)
    pub redis_addr: Option<String>,
    /// Size of redis hash caches
    pub redis_cache_size: usize,
    /// Advance the clock on ingest timestamps instead of wall time
    pub virtual_time: bool,
    /// WAL durability cadence; zero syncs after every write
    pub wal_sync_interval: Duration,
    /// WAL retention window; zero defaults to 24 hours
    pub max_wal_age: Duration,
    /// Age after which WAL segments gzip; zero defaults to a tenth of
    /// the retention window
    pub wal_compression_age: Duration,
    /// Fraction of system RAM above which the largest memstore flushes
    pub max_memory_ratio: f64,
    /// Passthrough nodes keep WALs but no memstores, and outsource
    /// queries to partition handlers
    pub passthrough: bool,
    /// How many partitions passthrough nodes split data into
    pub num_partitions: usize,
    /// The partition this follower owns
    pub partition: usize,
    /// Dimensions tried in order for partition hashing
    pub partition_by: Vec<String>,
    /// Follower-side hook for streaming WAL slices from a passthrough
    pub follow: Option<FollowFn>,
    /// Follower-side hook for registering the remote query handler
    pub register_remote_query_handler: Option<RegisterRemoteQueryHandlerFn>,
}

/// A tessera database
pub struct Db {
    opts: DbOpts,
    clock: Clock,
    tables: RwLock<HashMap<String, Arc<Table>>>,
    /// Registration order; drives the round-robin maintenance cursor
    ordered_tables: RwLock<Vec<String>>,
    streams: RwLock<HashMap<String, Arc<Wal>>>,
    registry: Arc<HandlerRegistry>,
    flush_mutex: Mutex<()>,
    memory_usage: AtomicU64,
    system_ram: u64,
    next_table_to_sort: AtomicUsize,
    query_runner: RwLock<Option<QueryRunnerFn>>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Db {
    /// Create a database using the given options
    pub fn open(mut opts: DbOpts) -> Result<Arc<Db>> {
        if opts.max_wal_age.is_zero() {
            opts.max_wal_age = crate::config::MAX_WAL_AGE;
        }
        if opts.wal_compression_age.is_zero() {
            opts.wal_compression_age = opts.max_wal_age / 10;
        }
        fs::create_dir_all(&opts.dir)?;

        let clock = if opts.virtual_time {
            Clock::virtual_time()
        } else {
            Clock::wall()
        };

        if opts.enable_geo {
            debug!("enabling geolocation expression helpers");
        }
        if let Some(provider) = &opts.isp_provider {
            debug!(provider, "enabling ISP expression helpers");
        }
        if opts.redis_addr.is_some() && opts.redis_cache_size > 0 {
            debug!("enabling redis expression helpers");
        }
        if let Some(aliases) = &opts.aliases_file {
            debug!(path = ?aliases, "alias file configured");
        }

        let registry = Arc::new(HandlerRegistry::new(opts.num_partitions));
        let db = Arc::new(Db {
            registry,
            clock,
            tables: RwLock::new(HashMap::new()),
            ordered_tables: RwLock::new(Vec::new()),
            streams: RwLock::new(HashMap::new()),
            flush_mutex: Mutex::new(()),
            memory_usage: AtomicU64::new(0),
            system_ram: read_system_ram(),
            next_table_to_sort: AtomicUsize::new(0),
            query_runner: RwLock::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            opts,
        });

        if let Some(schema_file) = db.opts.schema_file.clone() {
            let parsed = schema::load(&schema_file)?;
            db.apply_schema(&parsed)?;
            spawn_loop(&db, Duration::from_secs(5), move |db| {
                db.poll_schema(&schema_file)
            });
        }

        if let Some(register) = db.opts.register_remote_query_handler.clone() {
            let handler = db.remote_query_handler();
            let partition = db.opts.partition;
            db.threads
                .lock()
                .push(std::thread::spawn(move || register(partition, handler)));
        }

        if db.opts.passthrough {
            spawn_loop(&db, crate::config::HANDLER_FRESHEN_INTERVAL, |db| {
                db.registry.freshen();
                Ok(())
            });
        }

        if db.opts.max_memory_ratio > 0.0 {
            info!(
                max_memory_bytes = db.max_memory_bytes(),
                "limiting memstore memory"
            );
        }
        spawn_loop(&db, crate::config::MEM_SAMPLE_INTERVAL, |db| {
            db.update_mem_stats();
            db.cap_memstore_size();
            Ok(())
        });
        spawn_loop(&db, crate::config::WAL_CAP_INTERVAL, |db| {
            db.cap_wal_age();
            db.advance_maintenance_cursor();
            Ok(())
        });

        Ok(db)
    }

    /// Current database time
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Append a point to a stream's WAL
    ///
    /// On non-passthrough nodes the stream's tables pick the entry up
    /// through their own WAL readers.
    pub fn insert(
        &self,
        stream: &str,
        ts: Timestamp,
        dims: &ByteMap,
        vals: &ByteMap,
    ) -> Result<Offset> {
        let wal = self
            .stream_wal(stream)
            .ok_or_else(|| Error::NotFound(format!("stream '{}'", stream)))?;
        self.clock.advance(ts);
        wal.append(&encode_point(ts, dims, vals))
    }

    /// Stream one partition's slice of a stream to a follower
    ///
    /// Entries whose computed partition doesn't match are skipped. A
    /// callback error terminates the follow; read and decode errors are
    /// logged and skipped.
    pub fn follow(&self, f: &Follow, cb: EntryCallback<'_>) -> Result<()> {
        let wal = self
            .stream_wal(&f.stream)
            .ok_or_else(|| Error::NotFound(format!("stream '{}'", f.stream)))?;
        let mut reader = wal.reader(
            &format!("follower.{}.{}", f.partition, f.stream),
            Some(f.offset),
        )?;

        loop {
            let (data, new_offset) = match reader.read() {
                Ok(Some(entry)) => entry,
                Ok(None) => return Ok(()),
                Err(err) => {
                    debug!(stream = %f.stream, %err, "unable to read from stream");
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
            };
            let dims = match crate::wal::decode_parts(&data) {
                Ok((_, dims_raw, _)) => ByteMap::from_bytes(dims_raw.to_vec()),
                Err(err) => {
                    debug!(stream = %f.stream, %err, "skipping undecodable entry");
                    continue;
                }
            };
            let partition =
                partition_for(&dims, &self.opts.partition_by, self.opts.num_partitions)?;
            if partition != f.partition {
                continue;
            }
            if let Err(err) = cb(&data, new_offset) {
                debug!(stream = %f.stream, %err, "unable to write to follower");
                return Err(Error::FollowerCallback(err.to_string()));
            }
        }
    }

    /// Register a follower's query handler for a partition
    pub fn register_query_handler(&self, partition: usize, handler: QueryClusterFn) -> Result<()> {
        self.registry.register(partition, handler)
    }

    /// Fan a query out across all partitions
    pub fn query_cluster(
        &self,
        ctx: &QueryContext,
        query: RemoteQuery,
        on_row: impl FnMut(&ByteMap, &Vals) -> Result<bool> + Send + 'static,
    ) -> Result<ClusterResult> {
        cluster::query_cluster(&self.registry, ctx, query, on_row)
    }

    /// Install the planner glue that executes remote queries locally
    pub fn set_query_runner(&self, runner: QueryRunnerFn) {
        *self.query_runner.write() = Some(runner);
    }

    /// Execute a query on behalf of a passthrough node
    pub fn query_for_remote(
        &self,
        ctx: &QueryContext,
        query: &RemoteQuery,
        on_row: RemoteRowFn<'_>,
    ) -> RemoteOutcome {
        if query.is_noop() {
            return RemoteOutcome {
                has_read: false,
                result: Ok(()),
            };
        }
        let runner = self.query_runner.read().clone();
        match runner {
            Some(runner) => runner(ctx, query, on_row),
            None => RemoteOutcome {
                has_read: false,
                result: Err(Error::NotFound("query runner not configured".into())),
            },
        }
    }

    /// Fields of the named table
    pub fn get_fields(&self, table: &str) -> Result<Fields> {
        self.get_table(table)
            .map(|t| t.fields())
            .ok_or_else(|| Error::NotFound(format!("table '{}'", table)))
    }

    pub fn get_table(&self, table: &str) -> Option<Arc<Table>> {
        self.tables.read().get(&table.to_lowercase()).cloned()
    }

    /// A scan source over the named table, for the planner
    pub fn table_source(&self, table: &str) -> Result<Arc<dyn RowSource>> {
        let table = self
            .get_table(table)
            .ok_or_else(|| Error::NotFound(format!("table '{}'", table)))?;
        Ok(Arc::new(table.scan()))
    }

    /// Stats for the named table; zeroes when unknown
    pub fn table_stats(&self, table: &str) -> TableStats {
        self.get_table(table).map(|t| t.stats()).unwrap_or_default()
    }

    /// Stats for every table, keyed by name
    pub fn all_table_stats(&self) -> HashMap<String, TableStats> {
        self.tables
            .read()
            .iter()
            .map(|(name, table)| (name.clone(), table.stats()))
            .collect()
    }

    /// Render one table's stats for logs and operators
    pub fn format_table_stats(&self, table: &str) -> String {
        let stats = self.table_stats(table);
        format!(
            "{} ({})\tFiltered: {}    Queued: {}    Inserted: {}    Dropped: {}    Expired: {}",
            table,
            self.clock.now(),
            stats.filtered_points,
            stats.queued_points,
            stats.inserted_points,
            stats.dropped_points,
            stats.expired_values,
        )
    }

    /// Force-flush the named table under the process flush mutex
    pub fn force_flush_table(&self, table: &str) -> Result<()> {
        let table = self
            .get_table(table)
            .ok_or_else(|| Error::NotFound(format!("table '{}'", table)))?;
        let _guard = self.flush_mutex.lock();
        table.force_flush()
    }

    /// Register the tables a schema file declares; already-registered
    /// tables are left untouched
    pub fn apply_schema(self: &Arc<Self>, schema: &SchemaFile) -> Result<()> {
        for (name, def) in &schema.tables {
            let config = def.to_config(name);
            if self.get_table(&config.name).is_some() {
                continue;
            }
            self.register_table(config)?;
        }
        Ok(())
    }

    /// Register one table, creating its stream WAL as needed
    pub fn register_table(self: &Arc<Self>, config: TableConfig) -> Result<()> {
        let wal = self.get_or_create_stream(&config.stream)?;
        // Passthrough nodes keep the WAL only; their tables never
        // aggregate locally
        let ingest_wal = if self.opts.passthrough {
            None
        } else {
            Some(wal)
        };
        let name = config.name.clone();
        let stream = config.stream.clone();
        let table = Table::start(config, self.clock.clone(), ingest_wal, &self.opts.dir)?;

        self.tables.write().insert(name.clone(), table);
        self.ordered_tables.write().push(name.clone());

        if self.opts.follow.is_some() {
            self.start_following(&stream);
        }
        info!(table = %name, stream = %stream, "table registered");
        Ok(())
    }

    /// Estimated memory in use, as last sampled
    pub fn memory_usage(&self) -> u64 {
        self.memory_usage.load(Ordering::Relaxed)
    }

    pub fn max_memory_bytes(&self) -> u64 {
        (self.system_ram as f64 * self.opts.max_memory_ratio) as u64
    }

    /// Force-flush the largest non-virtual memstore when sampled memory
    /// exceeds the configured ratio of system RAM
    pub fn cap_memstore_size(&self) {
        if self.opts.max_memory_ratio <= 0.0 || self.system_ram == 0 {
            return;
        }
        let mut sizes: Vec<(Arc<Table>, usize)> = self
            .tables
            .read()
            .values()
            .filter(|t| !t.is_virtual())
            .map(|t| (t.clone(), t.memstore_size()))
            .collect();

        let _guard = self.flush_mutex.lock();
        let actual = self.memory_usage.load(Ordering::Relaxed);
        let allowed = self.max_memory_bytes();
        if actual <= allowed || sizes.is_empty() {
            return;
        }
        sizes.sort_by(|a, b| b.1.cmp(&a.1));
        let (largest, size) = &sizes[0];
        debug!(
            actual,
            allowed,
            table = %largest.name(),
            memstore_bytes = size,
            "memory over limit, forcing flush"
        );
        if let Err(err) = largest.force_flush() {
            warn!(table = %largest.name(), %err, "forced flush failed");
        }
        self.update_mem_stats();
    }

    /// Stop background work and close stream WALs
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for wal in self.streams.read().values() {
            wal.close();
        }
        for table in self.tables.read().values() {
            table.stop();
        }
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn stream_wal(&self, stream: &str) -> Option<Arc<Wal>> {
        self.streams.read().get(stream).cloned()
    }

    fn get_or_create_stream(&self, stream: &str) -> Result<Arc<Wal>> {
        if let Some(wal) = self.stream_wal(stream) {
            return Ok(wal);
        }
        let wal = Arc::new(Wal::open(
            self.opts.dir.join("streams").join(stream),
            WalOptions {
                sync_interval: self.opts.wal_sync_interval,
                ..Default::default()
            },
        )?);
        self.streams
            .write()
            .insert(stream.to_string(), wal.clone());
        Ok(wal)
    }

    /// The handler a follower registers with its passthrough
    pub fn remote_query_handler(self: &Arc<Self>) -> QueryClusterFn {
        let db = self.clone();
        Arc::new(move |ctx, query, on_row| db.query_for_remote(ctx, query, on_row))
    }

    /// Start pulling this node's partition of a stream from the
    /// passthrough, appending received entries to the local WAL
    fn start_following(self: &Arc<Self>, stream: &str) {
        let Some(follow_fn) = self.opts.follow.clone() else {
            return;
        };
        let db = self.clone();
        let stream = stream.to_string();
        let handle = std::thread::spawn(move || {
            let offset_path = db.opts.dir.join(format!("following.{}.offset", stream));
            while !db.shutdown.load(Ordering::SeqCst) {
                let offset = fs::read(&offset_path)
                    .ok()
                    .and_then(|b| Offset::decode(&b))
                    .unwrap_or(Offset::BEGINNING);
                let Some(local_wal) = db.stream_wal(&stream) else {
                    break;
                };
                let follow = Follow {
                    stream: stream.clone(),
                    offset,
                    partition: db.opts.partition,
                };
                let offset_path = offset_path.clone();
                let result = follow_fn(
                    follow,
                    &mut |data: &[u8], new_offset: Offset| -> Result<()> {
                        local_wal.append(data)?;
                        if let Err(err) = fs::write(&offset_path, new_offset.encode()) {
                            debug!(%err, "unable to persist follow offset");
                        }
                        Ok(())
                    },
                );
                if let Err(err) = result {
                    warn!(stream = %stream, %err, "follow interrupted, retrying");
                }
                std::thread::sleep(Duration::from_millis(250));
            }
        });
        self.threads.lock().push(handle);
    }

    fn poll_schema(self: &Arc<Self>, path: &std::path::Path) -> Result<()> {
        match schema::load(path) {
            Ok(parsed) => self.apply_schema(&parsed),
            Err(err) => {
                warn!(path = ?path, %err, "unable to reload schema");
                Ok(())
            }
        }
    }

    fn update_mem_stats(&self) {
        let usage = read_process_rss().unwrap_or_else(|| {
            self.tables
                .read()
                .values()
                .map(|t| t.memstore_size() as u64)
                .sum()
        });
        self.memory_usage.store(usage, Ordering::Relaxed);
    }

    fn cap_wal_age(&self) {
        let now = self.clock.now();
        let max_age = self.opts.max_wal_age.as_nanos() as i64;
        let compression_age = self.opts.wal_compression_age.as_nanos() as i64;
        for (stream, wal) in self.streams.read().iter() {
            if let Err(err) = wal.truncate_before_time(now.saturating_sub(max_age)) {
                warn!(stream = %stream, %err, "error truncating WAL");
            }
            if let Err(err) = wal.compress_before_time(now.saturating_sub(compression_age)) {
                warn!(stream = %stream, %err, "error compressing WAL");
            }
        }
    }

    /// Round-robin cold storage compaction across tables
    fn advance_maintenance_cursor(&self) {
        let ordered = self.ordered_tables.read().clone();
        if ordered.is_empty() {
            return;
        }
        let idx = self.next_table_to_sort.fetch_add(1, Ordering::Relaxed) % ordered.len();
        if let Some(table) = self.get_table(&ordered[idx]) {
            match table.compact() {
                Ok(true) => debug!(table = %table.name(), "compacted cold storage"),
                Ok(false) => {}
                Err(err) => warn!(table = %table.name(), %err, "compaction failed"),
            }
        }
    }
}

fn spawn_loop(
    db: &Arc<Db>,
    interval: Duration,
    f: impl Fn(&Arc<Db>) -> Result<()> + Send + 'static,
) {
    let db2 = db.clone();
    let handle = std::thread::spawn(move || {
        while !db2.shutdown.load(Ordering::SeqCst) {
            // Sleep in small steps so shutdown stays responsive
            let mut remaining = interval;
            while !remaining.is_zero() && !db2.shutdown.load(Ordering::SeqCst) {
                let step = remaining.min(Duration::from_millis(100));
                std::thread::sleep(step);
                remaining = remaining.saturating_sub(step);
            }
            if db2.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = f(&db2) {
                warn!(%err, "maintenance loop error");
            }
        }
    });
    db.threads.lock().push(handle);
}

/// Total system memory per /proc/meminfo; zero when unavailable
fn read_system_ram() -> u64 {
    let Ok(contents) = fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            return kb * 1024;
        }
    }
    0
}

/// Resident set size per /proc/self/statm
fn read_process_rss() -> Option<u64> {
    let contents = fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * 4096)
}

impl Drop for Db {
    fn drop(&mut self) {
        // Best-effort: explicit shutdown() is preferred
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Seconds since the Unix epoch as a nanosecond timestamp; handy for
/// wall-clock ingest paths
pub fn wall_now() -> Timestamp {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Flatten, Group, QueryContext, RequestOptions};
    use std::time::Instant;
    use tempfile::TempDir;

    const RES: i64 = 60 * 1_000_000_000;

    const SCHEMA: &str = r#"
tables:
  traffic:
    stream: inbound
    resolution: 60
    retention: 86400
    hot_period: 3600
    group_by: [client]
    fields:
      - name: requests
        expr: { sum: { field: requests } }
"#;

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn open_db(tmp: &TempDir, mutate: impl FnOnce(&mut DbOpts)) -> Arc<Db> {
        let schema_path = tmp.path().join("schema.yaml");
        fs::write(&schema_path, SCHEMA).unwrap();
        let mut opts = DbOpts {
            dir: tmp.path().join("data"),
            schema_file: Some(schema_path),
            virtual_time: true,
            ..Default::default()
        };
        mutate(&mut opts);
        Db::open(opts).unwrap()
    }

    fn insert(db: &Db, ts: Timestamp, client: &str, requests: f64) {
        let dims = ByteMap::of_strings([("client", client)]);
        let vals = ByteMap::of_floats([("requests", requests)]);
        db.insert("inbound", ts, &dims, &vals).unwrap();
    }

    #[test]
    fn test_insert_and_query_through_pipeline() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp, |_| {});

        insert(&db, 10 * RES, "acme", 5.0);
        insert(&db, 10 * RES, "acme", 3.0);
        insert(&db, 11 * RES, "umbrella", 2.0);
        wait_for(|| db.table_stats("traffic").inserted_points == 3);

        // Scan -> group -> flatten, the planner's standard spine
        let scan = db.table_source("traffic").unwrap();
        let mut group = Group::new(vec!["client".to_string()]);
        group.connect(scan);
        let flatten = Flatten::new(Arc::new(group));

        let ctx = QueryContext {
            opts: RequestOptions {
                include_memstore: true,
                is_sub_query: false,
            },
            ..Default::default()
        };
        let mut rows = Vec::new();
        use crate::core::FlatRowSource;
        flatten
            .iterate_flat(&ctx, &mut |_| Ok(()), &mut |row| {
                rows.push((row.key.clone(), row.ts, row.values.clone()));
                Ok(true)
            })
            .unwrap();

        assert_eq!(rows.len(), 2);
        let acme = rows
            .iter()
            .find(|(k, _, _)| k.get_str("client") == Some("acme"))
            .unwrap();
        assert_eq!(acme.1, 10 * RES);
        assert_eq!(acme.2, [8.0]);

        db.shutdown();
    }

    #[test]
    fn test_unknown_stream_and_table() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp, |_| {});

        let dims = ByteMap::of_strings([("a", "b")]);
        let vals = ByteMap::of_floats([("v", 1.0)]);
        assert!(matches!(
            db.insert("nope", 0, &dims, &vals),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(db.get_fields("nope"), Err(Error::NotFound(_))));

        db.shutdown();
    }

    #[test]
    fn test_force_flush_keeps_data_queryable() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp, |_| {});

        insert(&db, 10 * RES, "acme", 4.0);
        wait_for(|| db.table_stats("traffic").inserted_points == 1);

        db.force_flush_table("traffic").unwrap();
        let table = db.get_table("traffic").unwrap();
        assert_eq!(table.memstore_size(), 0);

        let scan = db.table_source("traffic").unwrap();
        let mut rows = 0;
        scan.iterate(&QueryContext::new(), &mut |_| Ok(()), &mut |_, _| {
            rows += 1;
            Ok(true)
        })
        .unwrap();
        assert_eq!(rows, 1);

        db.shutdown();
    }

    #[test]
    fn test_follow_filters_by_partition() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp, |opts| {
            opts.passthrough = true;
            opts.num_partitions = 4;
            opts.partition_by = vec!["client".to_string()];
        });

        let clients = ["acme", "umbrella", "initech", "hooli", "globex"];
        for (i, client) in clients.iter().enumerate() {
            insert(&db, i as i64 * RES, client, 1.0);
        }

        let want_partition = {
            let dims = ByteMap::of_strings([("client", "acme")]);
            partition_for(&dims, &["client".to_string()], 4).unwrap()
        };

        let db2 = db.clone();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let handle = std::thread::spawn(move || {
            let follow = Follow {
                stream: "inbound".to_string(),
                offset: Offset::BEGINNING,
                partition: want_partition,
            };
            db2.follow(&follow, &mut move |data: &[u8], _off: Offset| {
                let (_, dims, _) = crate::wal::decode_parts(data).unwrap();
                let dims = ByteMap::from_bytes(dims.to_vec());
                sink.lock().push(dims.get_str("client").unwrap().to_string());
                Ok(())
            })
        });

        // Everything the follower received must hash to its partition,
        // and acme must be among it
        wait_for(|| received.lock().iter().any(|c| c == "acme"));
        std::thread::sleep(Duration::from_millis(100));
        db.shutdown();
        handle.join().unwrap().unwrap();

        for client in received.lock().iter() {
            let dims = ByteMap::of_strings([("client", client.as_str())]);
            assert_eq!(
                partition_for(&dims, &["client".to_string()], 4).unwrap(),
                want_partition
            );
        }

        // And nothing that hashes elsewhere was delivered
        for client in clients {
            let dims = ByteMap::of_strings([("client", client)]);
            let p = partition_for(&dims, &["client".to_string()], 4).unwrap();
            let delivered = received.lock().iter().any(|c| c == client);
            assert_eq!(p == want_partition, delivered, "client {}", client);
        }
    }

    #[test]
    fn test_passthrough_to_follower_replication() {
        let tmp = TempDir::new().unwrap();
        let passthrough = open_db(&tmp, |opts| {
            opts.passthrough = true;
            opts.num_partitions = 2;
            opts.partition_by = vec!["client".to_string()];
        });

        let clients = ["acme", "umbrella", "initech", "hooli"];
        let follower_partition = 0;
        let expected: Vec<&str> = clients
            .iter()
            .filter(|c| {
                let dims = ByteMap::of_strings([("client", **c)]);
                partition_for(&dims, &["client".to_string()], 2).unwrap() == follower_partition
            })
            .copied()
            .collect();

        let follower_tmp = TempDir::new().unwrap();
        let upstream = passthrough.clone();
        let follower = open_db(&follower_tmp, move |opts| {
            opts.num_partitions = 2;
            opts.partition = follower_partition;
            opts.partition_by = vec!["client".to_string()];
            opts.follow = Some(Arc::new(move |f: Follow, cb: EntryCallback<'_>| {
                upstream.follow(&f, cb)
            }));
        });

        for (i, client) in clients.iter().enumerate() {
            insert(&passthrough, i as i64 * RES, client, 1.0);
        }

        // The follower's table sees exactly its partition's points
        wait_for(|| {
            follower.table_stats("traffic").inserted_points == expected.len() as u64
        });

        let scan = follower.table_source("traffic").unwrap();
        let ctx = QueryContext {
            opts: RequestOptions {
                include_memstore: true,
                is_sub_query: false,
            },
            ..Default::default()
        };
        let mut seen = Vec::new();
        scan.iterate(&ctx, &mut |_| Ok(()), &mut |key, _| {
            seen.push(key.get_str("client").unwrap_or("").to_string());
            Ok(true)
        })
        .unwrap();
        let mut expected_sorted: Vec<String> =
            expected.iter().map(|s| s.to_string()).collect();
        expected_sorted.sort();
        assert_eq!(seen, expected_sorted);

        passthrough.shutdown();
        follower.shutdown();
    }

    #[test]
    fn test_remote_handler_round_trip() {
        let tmp = TempDir::new().unwrap();
        let db = open_db(&tmp, |opts| {
            opts.num_partitions = 1;
        });

        // Planner glue: serve remote queries from the local table
        let db_for_runner = db.clone();
        db.set_query_runner(Arc::new(move |_ctx, query, on_row| {
            let scan = match db_for_runner.table_source(&query.sql) {
                Ok(scan) => scan,
                Err(err) => {
                    return RemoteOutcome {
                        has_read: false,
                        result: Err(err),
                    }
                }
            };
            let ctx = QueryContext {
                opts: RequestOptions {
                    include_memstore: query.include_memstore,
                    is_sub_query: query.is_sub_query,
                },
                ..Default::default()
            };
            let mut has_read = false;
            let result = scan.iterate(&ctx, &mut |_| Ok(()), &mut |key, vals| {
                has_read = true;
                on_row(key, vals)
            });
            RemoteOutcome {
                has_read,
                result,
            }
        }));

        db.register_query_handler(0, db.remote_query_handler()).unwrap();

        insert(&db, 10 * RES, "acme", 2.0);
        wait_for(|| db.table_stats("traffic").inserted_points == 1);

        let rows = Arc::new(Mutex::new(0usize));
        let sink = rows.clone();
        let result = db
            .query_cluster(
                &QueryContext::new(),
                RemoteQuery {
                    sql: "traffic".into(),
                    include_memstore: true,
                    ..Default::default()
                },
                move |_, _| {
                    *sink.lock() += 1;
                    Ok(true)
                },
            )
            .unwrap();

        assert_eq!(result.rows_by_partition, vec![1]);
        assert_eq!(*rows.lock(), 1);

        db.shutdown();
    }
}
