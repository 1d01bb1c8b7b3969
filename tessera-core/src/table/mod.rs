//! Tables: schema-defined aggregation over a stream
//!
//! A table follows its stream's WAL with a named reader, folds decoded
//! points into its memstore through a single-writer ingest queue, and
//! flushes aggregated sequences to cold storage on rotation boundaries or
//! under memory pressure. Queries scan the union of cold storage and (when
//! requested) the live memstore.

mod coldstore;
mod memstore;

pub use coldstore::ColdStore;
pub use memstore::Memstore;

use crate::clock::Clock;
use crate::core::{
    Fields, OnFields, OnRow, QueryContext, RowSource, Source, Vals,
};
use crate::encoding::{align_to, ByteMap, Sequence, Timestamp};
use crate::expr::Cond;
use crate::wal::{decode_parts, Offset, Wal};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Schema-derived table definition
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub name: String,
    /// The stream this table aggregates
    pub stream: String,
    pub fields: Fields,
    /// Bucket width in nanoseconds
    pub resolution: i64,
    /// Maximum age retained after flush, in nanoseconds
    pub retention: i64,
    /// How far back the memstore retains, in nanoseconds
    pub hot_period: i64,
    /// Virtual tables define fields over a stream but store nothing
    pub is_virtual: bool,
    /// Grouping dimensions; empty means group by all dims
    pub group_by: Vec<String>,
    /// Optional ingest filter over a point's dimensions
    pub filter: Option<Cond>,
}

impl TableConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("table name is empty".into()));
        }
        if self.fields.is_empty() {
            return Err(Error::Config(format!("table {} has no fields", self.name)));
        }
        if self.resolution <= 0 {
            return Err(Error::Config(format!(
                "table {} resolution must be positive",
                self.name
            )));
        }
        if self.hot_period <= 0 || self.retention <= 0 {
            return Err(Error::Config(format!(
                "table {} retention and hot period must be positive",
                self.name
            )));
        }
        for field in &self.fields {
            field.expr.validate()?;
            if field.expr.encoded_width() == 0 {
                return Err(Error::InvalidExpression(format!(
                    "field {} of table {} has zero encoded width",
                    field.name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Ingest counters for one table
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TableStats {
    pub filtered_points: u64,
    pub queued_points: u64,
    pub inserted_points: u64,
    pub dropped_points: u64,
    pub expired_values: u64,
}

enum IngestMsg {
    Entry(Vec<u8>, Offset),
    Flush(mpsc::Sender<Result<()>>),
    Stop,
}

/// A schema-defined aggregating table
pub struct Table {
    config: TableConfig,
    clock: Clock,
    memstore: Memstore,
    coldstore: ColdStore,
    stats: RwLock<TableStats>,
    wal: Option<Arc<Wal>>,
    ingest_tx: Option<SyncSender<IngestMsg>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Table {
    /// Create the table and, for non-virtual tables with a stream, start
    /// its WAL follower and ingest worker
    pub fn start(
        config: TableConfig,
        clock: Clock,
        wal: Option<Arc<Wal>>,
        data_dir: &Path,
    ) -> Result<Arc<Table>> {
        config.validate()?;
        let coldstore = ColdStore::open(data_dir.join("tables").join(&config.name))?;

        let ingest = match (&wal, config.is_virtual) {
            (Some(_), false) => Some(mpsc::sync_channel(crate::config::INGEST_QUEUE_DEPTH)),
            _ => None,
        };

        let table = Arc::new(Table {
            ingest_tx: ingest.as_ref().map(|(tx, _)| tx.clone()),
            wal: wal.clone(),
            config,
            clock,
            memstore: Memstore::new(),
            coldstore,
            stats: RwLock::new(TableStats::default()),
            threads: Mutex::new(Vec::new()),
        });

        if let (Some((tx, rx)), Some(wal)) = (ingest, wal) {
            // The reader's offset is checkpointed at flush time, so a
            // restart replays everything since the last flush back into
            // the memstore
            let mut reader = wal.reader(&table.reader_name(), None)?;
            reader.set_auto_persist(false);
            let mut threads = table.threads.lock();
            threads.push(spawn_wal_follower(table.clone(), reader, tx));
            threads.push(spawn_ingest_worker(table.clone(), rx));
            info!(table = %table.config.name, stream = %table.config.stream, "table started");
        }

        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn reader_name(&self) -> String {
        format!("table.{}", self.config.name)
    }

    pub fn stream(&self) -> &str {
        &self.config.stream
    }

    pub fn fields(&self) -> Fields {
        self.config.fields.clone()
    }

    pub fn resolution(&self) -> i64 {
        self.config.resolution
    }

    pub fn is_virtual(&self) -> bool {
        self.config.is_virtual
    }

    pub fn stats(&self) -> TableStats {
        *self.stats.read()
    }

    /// Current memstore byte-size estimate
    pub fn memstore_size(&self) -> usize {
        self.memstore.byte_size()
    }

    /// Flush the memstore to cold storage
    ///
    /// Callers serialize flushes through the database's process-wide
    /// flush mutex.
    pub fn force_flush(&self) -> Result<()> {
        match &self.ingest_tx {
            Some(tx) => {
                let (ack_tx, ack_rx) = mpsc::channel();
                tx.send(IngestMsg::Flush(ack_tx))
                    .map_err(|_| Error::Config("ingest worker has stopped".into()))?;
                ack_rx
                    .recv_timeout(Duration::from_secs(60))
                    .map_err(|_| Error::Config("flush timed out".into()))?
            }
            None => self.do_flush(),
        }
    }

    /// Merge accumulated cold storage files; driven by the database's
    /// round-robin maintenance cursor
    pub fn compact(&self) -> Result<bool> {
        let truncate_before = self.clock.now().saturating_sub(self.config.retention);
        self.coldstore.compact(
            &self.config.fields,
            self.config.resolution,
            truncate_before,
        )
    }

    /// A row source scanning this table
    pub fn scan(self: &Arc<Self>) -> TableScan {
        TableScan {
            table: self.clone(),
        }
    }

    /// Stop background threads; the WAL must be closed first so the
    /// follower unblocks
    pub fn stop(&self) {
        if let Some(tx) = &self.ingest_tx {
            let _ = tx.send(IngestMsg::Stop);
        }
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn process_entry(&self, data: &[u8]) {
        let (ts, dims_raw, vals_raw) = match decode_parts(data) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(table = %self.config.name, %err, "undecodable WAL entry");
                return;
            }
        };
        self.clock.advance(ts);

        let dims = ByteMap::from_bytes(dims_raw.to_vec());
        if let Some(cond) = &self.config.filter {
            if !cond.eval(Some(&dims)) {
                self.stats.write().filtered_points += 1;
                return;
            }
        }

        let now = self.clock.now();
        let truncate_before = now.saturating_sub(self.config.hot_period);
        if align_to(ts, self.config.resolution) < truncate_before {
            self.stats.write().expired_values += 1;
            return;
        }

        let vals = ByteMap::from_bytes(vals_raw.to_vec());
        let key = if self.config.group_by.is_empty() {
            dims.clone()
        } else {
            dims.project(&self.config.group_by)
        };

        let fields = &self.config.fields;
        self.memstore.apply(key.as_bytes(), fields.len(), |entry| {
            for (i, field) in fields.iter().enumerate() {
                let seq = std::mem::take(&mut entry[i]);
                entry[i] = seq.update(
                    ts,
                    &vals,
                    Some(&dims),
                    &field.expr,
                    self.config.resolution,
                    truncate_before,
                );
            }
        });
        self.stats.write().inserted_points += 1;
    }

    /// Flush, then checkpoint the WAL reader so replay resumes here
    fn flush_and_checkpoint(&self, offset: Option<Offset>) -> Result<()> {
        self.do_flush()?;
        if let (Some(wal), Some(offset)) = (&self.wal, offset) {
            wal.persist_offset(&self.reader_name(), offset)?;
        }
        Ok(())
    }

    fn do_flush(&self) -> Result<()> {
        let rows = self.memstore.swap_out();
        if rows.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        let horizon = now.saturating_sub(self.config.retention);
        let fields = &self.config.fields;
        let rows: Vec<(Vec<u8>, Vals)> = rows
            .into_iter()
            .map(|(key, vals)| {
                let vals = vals
                    .into_iter()
                    .enumerate()
                    .map(|(i, seq)| {
                        seq.truncate(
                            fields[i].expr.encoded_width(),
                            self.config.resolution,
                            horizon,
                        )
                    })
                    .collect::<Vals>();
                (key, vals)
            })
            .filter(|(_, vals)| vals.iter().any(|s| !s.is_empty()))
            .collect();

        self.coldstore.flush(&rows, (horizon, now))?;
        Ok(())
    }
}

fn spawn_wal_follower(
    table: Arc<Table>,
    mut reader: crate::wal::WalReader,
    tx: SyncSender<IngestMsg>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
            match reader.read() {
                Ok(Some((data, offset))) => {
                    table.stats.write().queued_points += 1;
                    match tx.try_send(IngestMsg::Entry(data, offset)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            table.stats.write().dropped_points += 1;
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
                Ok(None) => break,
                Err(err) if err.is_transient() => {
                    debug!(table = %table.config.name, %err, "transient WAL read error");
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    warn!(table = %table.config.name, %err, "WAL follower stopping");
                    break;
                }
            }
    })
}

fn spawn_ingest_worker(table: Arc<Table>, rx: Receiver<IngestMsg>) -> JoinHandle<()> {
    std::thread::spawn(move || {
            let rotation = Duration::from_nanos(table.config.hot_period.max(0) as u64);
            let mut last_flush = Instant::now();
            let mut last_offset: Option<Offset> = None;
            loop {
                match rx.recv_timeout(Duration::from_millis(500)) {
                    Ok(IngestMsg::Entry(data, offset)) => {
                        table.process_entry(&data);
                        last_offset = Some(offset);
                    }
                    Ok(IngestMsg::Flush(ack)) => {
                        let result = table.flush_and_checkpoint(last_offset);
                        last_flush = Instant::now();
                        let _ = ack.send(result);
                    }
                    Ok(IngestMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                // Rotation boundary: age the memstore out on the table's
                // hot period cadence
                if last_flush.elapsed() >= rotation && !table.memstore.is_empty() {
                    if let Err(err) = table.flush_and_checkpoint(last_offset) {
                        warn!(table = %table.config.name, %err, "rotation flush failed");
                    }
                    last_flush = Instant::now();
                }
            }
    })
}

/// A [`RowSource`] over one table's cold storage and memstore
pub struct TableScan {
    table: Arc<Table>,
}

impl Source for TableScan {
    fn fields(&self) -> Fields {
        self.table.fields()
    }

    fn resolution(&self) -> i64 {
        self.table.config.resolution
    }

    fn as_of(&self) -> Timestamp {
        self.table
            .clock
            .now()
            .saturating_sub(self.table.config.retention)
    }

    fn until(&self) -> Timestamp {
        self.table.clock.now()
    }

    fn describe(&self) -> String {
        format!("table {}", self.table.config.name)
    }
}

impl RowSource for TableScan {
    fn iterate(&self, ctx: &QueryContext, on_fields: OnFields, on_row: OnRow) -> Result<()> {
        let fields = self.table.fields();
        let resolution = self.table.config.resolution;
        let as_of = self.as_of();

        let mut map: BTreeMap<Vec<u8>, Vals> = BTreeMap::new();
        self.table
            .coldstore
            .read_into(&mut map, &fields, resolution, as_of)?;

        if ctx.opts.include_memstore {
            for (key, vals) in self.table.memstore.snapshot() {
                let entry = map
                    .entry(key)
                    .or_insert_with(|| vec![Sequence::empty(); fields.len()]);
                for (i, field) in fields.iter().enumerate() {
                    let existing = std::mem::take(&mut entry[i]);
                    entry[i] = existing.merge(vals[i].clone(), &field.expr, resolution, as_of);
                }
            }
        }

        on_fields(&fields)?;
        for (key, vals) in &map {
            ctx.check_deadline()?;
            if vals.iter().all(|s| s.is_empty()) {
                continue;
            }
            if !on_row(&ByteMap::from_bytes(key.clone()), vals)? {
                break;
            }
        }
        Ok(())
    }
}
