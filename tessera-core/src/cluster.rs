//! Partitioned cluster plumbing
//!
//! A passthrough node owns stream WALs but no memstores; followers own one
//! partition each and ingest the subset of WAL entries hashing to it.
//! Partition assignment uses murmur3 over the first configured partition
//! dimension present in an entry's dims (falling back to the whole dims
//! encoding), so entries sharing a partition key always land together.
//!
//! For queries, followers register handler functions with the passthrough;
//! fan-out acquires one handler per partition and streams rows back
//! through a shared, serialized callback under an adaptive timeout.

use crate::core::{QueryContext, Vals};
use crate::encoding::ByteMap;
use crate::wal::Offset;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// A follower's request to stream a partition of a stream's WAL
#[derive(Debug, Clone)]
pub struct Follow {
    pub stream: String,
    pub offset: Offset,
    pub partition: usize,
}

/// Assign a partition to an entry's dimensions
///
/// The first configured partition dimension present in the dims supplies
/// the hashed bytes; otherwise the whole canonical dims encoding is
/// hashed.
pub fn partition_for(
    dims: &ByteMap,
    partition_by: &[String],
    num_partitions: usize,
) -> Result<usize> {
    let mut data = dims.as_bytes();
    for dim in partition_by {
        if let Some(value) = dims.get(dim) {
            if !value.is_empty() {
                data = value;
                break;
            }
        }
    }
    let hash = murmur3::murmur3_32(&mut Cursor::new(data), 0)?;
    Ok(hash as usize % num_partitions.max(1))
}

/// A query forwarded to a partition's handler
#[derive(Debug, Clone, Default)]
pub struct RemoteQuery {
    pub sql: String,
    pub include_memstore: bool,
    pub is_sub_query: bool,
    pub sub_query_results: Vec<Vec<String>>,
}

impl RemoteQuery {
    /// The empty query used to freshen idle handler connections
    pub fn noop() -> RemoteQuery {
        RemoteQuery::default()
    }

    pub fn is_noop(&self) -> bool {
        self.sql.is_empty()
    }
}

/// What a remote handler reported back
pub struct RemoteOutcome {
    /// Whether any result was read before the error (if any); a failure
    /// before reading is retried on another handler
    pub has_read: bool,
    pub result: Result<()>,
}

/// Row callback passed into a remote handler
pub type RemoteRowFn<'a> = &'a (dyn Fn(&ByteMap, &Vals) -> Result<bool> + Sync);

/// A registered per-partition query handler
pub type QueryClusterFn = Arc<
    dyn for<'a> Fn(&'a QueryContext, &'a RemoteQuery, RemoteRowFn<'a>) -> RemoteOutcome
        + Send
        + Sync,
>;

struct Slot {
    tx: SyncSender<QueryClusterFn>,
    rx: Mutex<Receiver<QueryClusterFn>>,
}

/// Bounded per-partition queues of registered query handlers
///
/// Registration blocks once a partition's queue is full, pushing back on
/// over-eager followers. Acquisition never blocks; an empty queue means
/// the partition is unreachable for this query.
pub struct HandlerRegistry {
    slots: Vec<Slot>,
}

impl HandlerRegistry {
    pub fn new(num_partitions: usize) -> HandlerRegistry {
        let slots = (0..num_partitions.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::sync_channel(crate::config::HANDLER_QUEUE_DEPTH);
                Slot {
                    tx,
                    rx: Mutex::new(rx),
                }
            })
            .collect();
        HandlerRegistry { slots }
    }

    pub fn num_partitions(&self) -> usize {
        self.slots.len()
    }

    /// Queue a handler for its partition, blocking while the queue is full
    pub fn register(&self, partition: usize, handler: QueryClusterFn) -> Result<()> {
        let slot = self
            .slots
            .get(partition)
            .ok_or_else(|| Error::NotFound(format!("partition {}", partition)))?;
        slot.tx
            .send(handler)
            .map_err(|_| Error::Config("handler registry closed".into()))
    }

    /// Like register but never blocks; used by tests and freshen loops
    pub fn try_register(&self, partition: usize, handler: QueryClusterFn) -> Result<bool> {
        let slot = self
            .slots
            .get(partition)
            .ok_or_else(|| Error::NotFound(format!("partition {}", partition)))?;
        match slot.tx.try_send(handler) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::Config("handler registry closed".into()))
            }
        }
    }

    /// Take one handler for a partition, if any is queued
    pub fn try_acquire(&self, partition: usize) -> Option<QueryClusterFn> {
        let slot = self.slots.get(partition)?;
        slot.rx.lock().try_recv().ok()
    }

    /// Drain queued handlers, invoking each with a noop query so
    /// long-lived follower connections stay warm
    pub fn freshen(&self) {
        for partition in 0..self.slots.len() {
            loop {
                let Some(handler) = self.try_acquire(partition) else {
                    break;
                };
                std::thread::spawn(move || {
                    let ctx = QueryContext::new();
                    let noop = RemoteQuery::noop();
                    handler(&ctx, &noop, &|_, _| Ok(true));
                });
            }
        }
    }
}

/// How one cluster fan-out went
#[derive(Debug, Default)]
pub struct ClusterResult {
    /// Rows received per partition
    pub rows_by_partition: Vec<u64>,
    /// Partitions with no registered handler at fan-out time
    pub unreachable: Vec<usize>,
    /// Partitions still pending when the timeout fired, with the rows
    /// they had delivered so far
    pub missing: Vec<(usize, u64)>,
    pub timed_out: bool,
}

impl ClusterResult {
    /// Human-readable missing partitions diagnostic
    pub fn missing_diagnostic(&self) -> String {
        let mut parts: Vec<String> = self
            .unreachable
            .iter()
            .map(|p| format!("{} (unreachable)", p))
            .collect();
        parts.extend(
            self.missing
                .iter()
                .map(|(p, rows)| format!("{} ({})", p, rows)),
        );
        format!("Missing partitions: {}", parts.join(" | "))
    }
}

const INITIAL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const MIN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// After each completed partition, allow stragglers twice the slowest
/// completion observed so far, floored at ten minutes
fn adapted_timeout(max_delta: Duration) -> Duration {
    (max_delta * 2).max(MIN_TIMEOUT)
}

struct FanoutShared {
    timed_out: RwLock<bool>,
    counts: Vec<AtomicU64>,
    on_row: Mutex<Box<dyn FnMut(&ByteMap, &Vals) -> Result<bool> + Send>>,
    query: RemoteQuery,
    ctx: QueryContext,
}

struct PartitionReport {
    partition: usize,
    handler_found: bool,
    err: Option<Error>,
}

/// Fan a query out to every partition's handler
///
/// Rows stream back through `on_row`, serialized across partitions. Late
/// rows arriving after a timeout are dropped under the timed-out guard.
/// Handlers that fail before reading anything are retried with the next
/// queued handler for that partition.
pub fn query_cluster(
    registry: &Arc<HandlerRegistry>,
    ctx: &QueryContext,
    query: RemoteQuery,
    on_row: impl FnMut(&ByteMap, &Vals) -> Result<bool> + Send + 'static,
) -> Result<ClusterResult> {
    let num_partitions = registry.num_partitions();
    let shared = Arc::new(FanoutShared {
        timed_out: RwLock::new(false),
        counts: (0..num_partitions).map(|_| AtomicU64::new(0)).collect(),
        on_row: Mutex::new(Box::new(on_row)),
        query,
        ctx: ctx.clone(),
    });

    let (report_tx, report_rx) = mpsc::channel::<PartitionReport>();
    for partition in 0..num_partitions {
        let registry = registry.clone();
        let shared = shared.clone();
        let report_tx = report_tx.clone();
        std::thread::spawn(move || {
            run_partition(partition, &registry, &shared, &report_tx);
        });
    }
    drop(report_tx);

    let mut pending: BTreeMap<usize, ()> = (0..num_partitions).map(|p| (p, ())).collect();
    let mut result = ClusterResult {
        rows_by_partition: vec![0; num_partitions],
        ..Default::default()
    };
    let mut final_err: Option<Error> = None;
    let mut max_delta = Duration::ZERO;
    let mut timeout = INITIAL_TIMEOUT;

    for _ in 0..num_partitions {
        let wait_start = Instant::now();
        match report_rx.recv_timeout(timeout) {
            Ok(report) => {
                pending.remove(&report.partition);
                if !report.handler_found {
                    result.unreachable.push(report.partition);
                } else {
                    let delta = wait_start.elapsed();
                    if delta > max_delta {
                        max_delta = delta;
                    }
                    timeout = adapted_timeout(max_delta);
                }
                match report.err {
                    Some(err) if err.is_deadline() && final_err.is_none() => {
                        final_err = Some(err);
                    }
                    Some(err) if !err.is_deadline() => {
                        if !matches!(final_err, Some(ref e) if !e.is_deadline()) {
                            final_err = Some(err);
                        }
                    }
                    _ => {}
                }
                debug!(
                    partition = report.partition,
                    next_timeout = ?timeout,
                    "partition reported"
                );
            }
            Err(RecvTimeoutError::Timeout) => {
                *shared.timed_out.write() = true;
                result.timed_out = true;
                for (partition, _) in &pending {
                    result.missing.push((
                        *partition,
                        shared.counts[*partition].load(Ordering::Relaxed),
                    ));
                }
                warn!("{}", result.missing_diagnostic());
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for (partition, count) in shared.counts.iter().enumerate() {
        result.rows_by_partition[partition] = count.load(Ordering::Relaxed);
    }
    match final_err {
        Some(err) => Err(err),
        None => Ok(result),
    }
}

fn run_partition(
    partition: usize,
    registry: &HandlerRegistry,
    shared: &Arc<FanoutShared>,
    report_tx: &mpsc::Sender<PartitionReport>,
) {
    loop {
        let Some(handler) = registry.try_acquire(partition) else {
            error!(partition, "no query handler for partition, ignoring");
            let _ = report_tx.send(PartitionReport {
                partition,
                handler_found: false,
                err: None,
            });
            return;
        };

        let cb = |key: &ByteMap, vals: &Vals| -> Result<bool> {
            let timed_out = shared.timed_out.read();
            if *timed_out {
                return Ok(false);
            }
            shared.counts[partition].fetch_add(1, Ordering::Relaxed);
            let mut on_row = shared.on_row.lock();
            (*on_row)(key, vals)
        };

        let outcome = handler(&shared.ctx, &shared.query, &cb);
        match outcome.result {
            Err(err) if !outcome.has_read => {
                debug!(
                    partition,
                    %err,
                    "failed before reading anything, trying next handler"
                );
                continue;
            }
            result => {
                let _ = report_tx.send(PartitionReport {
                    partition,
                    handler_found: true,
                    err: result.err(),
                });
                return;
            }
        }
    }
}
