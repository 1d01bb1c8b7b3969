//! Dataflow pipeline
//!
//! Queries execute as trees of row-producing stages. A [`Source`] describes
//! its fields and time bounds; a transform owns one or more upstream
//! sources and is itself a source. Two row shapes flow through the tree:
//! dimensioned rows carrying full bucket sequences, and flattened rows
//! carrying one time slice of decoded values.
//!
//! Iteration contract: `on_fields` is invoked exactly once before any row;
//! a row callback returning `Ok(false)` halts that stage early without
//! error; exceeding the context deadline surfaces as
//! [`Error::DeadlineExceeded`] and already-delivered rows remain valid
//! partial results.

mod crosstab;
mod transform;

pub use crosstab::Crosstab;
pub use transform::{Flatten, Group, RowFilter, RowMerge, Unflatten};

use crate::encoding::{ByteMap, Sequence, Timestamp};
use crate::expr::Expr;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A named expression
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub expr: Expr,
}

impl Field {
    pub fn new(name: impl Into<String>, expr: Expr) -> Field {
        Field {
            name: name.into(),
            expr,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.expr)
    }
}

pub type Fields = Vec<Field>;

/// One sequence per field, keyed by a row's grouping dimensions
pub type Vals = Vec<Sequence>;

/// A materialized time slice of a dimension group
#[derive(Debug, Clone, Default)]
pub struct FlatRow {
    pub ts: Timestamp,
    pub key: ByteMap,
    /// Values for each field
    pub values: Vec<f64>,
    /// For crosstab queries, the total value for each input field
    pub totals: Vec<f64>,
}

/// Planner-attached options carried through a query
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub include_memstore: bool,
    pub is_sub_query: bool,
}

/// Cancellation and metadata for one query execution
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub deadline: Option<Instant>,
    pub opts: RequestOptions,
}

impl QueryContext {
    pub fn new() -> QueryContext {
        QueryContext::default()
    }

    pub fn with_timeout(timeout: Duration) -> QueryContext {
        QueryContext {
            deadline: Some(Instant::now() + timeout),
            opts: RequestOptions::default(),
        }
    }

    /// Errors with [`Error::DeadlineExceeded`] once the deadline passes
    pub fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

pub type OnFields<'a> = &'a mut (dyn FnMut(&Fields) -> Result<()> + Send);
pub type OnRow<'a> = &'a mut (dyn FnMut(&ByteMap, &Vals) -> Result<bool> + Send);
pub type OnFlatRow<'a> = &'a mut (dyn FnMut(&FlatRow) -> Result<bool> + Send);

/// Metadata common to every stage of a query tree
pub trait Source: Send + Sync {
    fn fields(&self) -> Fields;

    /// Bucket width in nanoseconds
    fn resolution(&self) -> i64;

    /// Oldest timestamp this source covers
    fn as_of(&self) -> Timestamp;

    /// Newest timestamp this source covers
    fn until(&self) -> Timestamp;

    fn describe(&self) -> String;
}

/// A source producing dimensioned rows of bucket sequences
pub trait RowSource: Source {
    fn iterate(&self, ctx: &QueryContext, on_fields: OnFields, on_row: OnRow) -> Result<()>;
}

/// A source producing flattened time-slice rows
pub trait FlatRowSource: Source {
    fn iterate_flat(
        &self,
        ctx: &QueryContext,
        on_fields: OnFields,
        on_row: OnFlatRow,
    ) -> Result<()>;
}

/// Pick the stage error to propagate: the first non-deadline error wins,
/// a deadline alone still surfaces
fn collect_errors(errors: Vec<Option<Error>>) -> Result<()> {
    let mut deadline = false;
    for err in errors.into_iter().flatten() {
        if err.is_deadline() {
            deadline = true;
        } else {
            return Err(err);
        }
    }
    if deadline {
        return Err(Error::DeadlineExceeded);
    }
    Ok(())
}

/// The sources a transform draws from
///
/// Field metadata is taken from source index 0; merged sources are assumed
/// homogeneous.
pub struct SourceBundle<S: ?Sized> {
    sources: Vec<Arc<S>>,
}

impl<S: ?Sized> SourceBundle<S> {
    pub fn new() -> SourceBundle<S> {
        SourceBundle {
            sources: Vec::new(),
        }
    }

    pub fn connect(&mut self, source: Arc<S>) {
        self.sources.push(source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, i: usize) -> &Arc<S> {
        &self.sources[i]
    }
}

impl<S: ?Sized> Default for SourceBundle<S> {
    fn default() -> Self {
        SourceBundle::new()
    }
}

impl<S: Source + ?Sized> SourceBundle<S> {
    pub fn fields(&self) -> Fields {
        self.sources[0].fields()
    }

    pub fn resolution(&self) -> i64 {
        self.sources[0].resolution()
    }

    pub fn as_of(&self) -> Timestamp {
        self.sources.iter().map(|s| s.as_of()).min().unwrap_or(0)
    }

    pub fn until(&self) -> Timestamp {
        self.sources.iter().map(|s| s.until()).max().unwrap_or(0)
    }
}

impl SourceBundle<dyn RowSource> {
    /// Iterate sources one after another in declaration order
    pub fn iterate_serial(
        &self,
        ctx: &QueryContext,
        on_fields: OnFields,
        on_row: OnRow,
    ) -> Result<()> {
        on_fields(&self.fields())?;
        let mut halted = false;
        for source in &self.sources {
            if halted {
                break;
            }
            source.iterate(ctx, &mut |_| Ok(()), &mut |key, vals| {
                let more = on_row(key, vals)?;
                if !more {
                    halted = true;
                }
                Ok(more)
            })?;
        }
        Ok(())
    }

    /// Iterate sources concurrently
    ///
    /// Row callbacks are serialized through a stage-owned mutex, so the
    /// downstream callback never sees overlapping invocations. A
    /// single-source bundle degenerates to serial iteration. Peer sources
    /// are drained even when one errors; the first non-deadline error is
    /// propagated.
    pub fn iterate_parallel(
        &self,
        ctx: &QueryContext,
        on_fields: OnFields,
        on_row: OnRow,
    ) -> Result<()> {
        if self.sources.len() == 1 {
            return self.iterate_serial(ctx, on_fields, on_row);
        }

        on_fields(&self.fields())?;
        let locked = Mutex::new(on_row);
        let halted = AtomicBool::new(false);

        let errors: Vec<Option<Error>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .sources
                .iter()
                .map(|source| {
                    let locked = &locked;
                    let halted = &halted;
                    scope.spawn(move || {
                        source
                            .iterate(ctx, &mut |_| Ok(()), &mut |key, vals| {
                                if halted.load(Ordering::Acquire) {
                                    return Ok(false);
                                }
                                let mut cb = locked.lock();
                                let more = (*cb)(key, vals)?;
                                if !more {
                                    halted.store(true, Ordering::Release);
                                }
                                Ok(more)
                            })
                            .err()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Some(Error::InvalidFormat("source worker panicked".into())))
                })
                .collect()
        });

        collect_errors(errors)
    }
}

impl SourceBundle<dyn FlatRowSource> {
    pub fn iterate_serial(
        &self,
        ctx: &QueryContext,
        on_fields: OnFields,
        on_row: OnFlatRow,
    ) -> Result<()> {
        on_fields(&self.fields())?;
        let mut halted = false;
        for source in &self.sources {
            if halted {
                break;
            }
            source.iterate_flat(ctx, &mut |_| Ok(()), &mut |row| {
                let more = on_row(row)?;
                if !more {
                    halted = true;
                }
                Ok(more)
            })?;
        }
        Ok(())
    }

    pub fn iterate_parallel(
        &self,
        ctx: &QueryContext,
        on_fields: OnFields,
        on_row: OnFlatRow,
    ) -> Result<()> {
        if self.sources.len() == 1 {
            return self.iterate_serial(ctx, on_fields, on_row);
        }

        on_fields(&self.fields())?;
        let locked = Mutex::new(on_row);
        let halted = AtomicBool::new(false);

        let errors: Vec<Option<Error>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .sources
                .iter()
                .map(|source| {
                    let locked = &locked;
                    let halted = &halted;
                    scope.spawn(move || {
                        source
                            .iterate_flat(ctx, &mut |_| Ok(()), &mut |row| {
                                if halted.load(Ordering::Acquire) {
                                    return Ok(false);
                                }
                                let mut cb = locked.lock();
                                let more = (*cb)(row)?;
                                if !more {
                                    halted.store(true, Ordering::Release);
                                }
                                Ok(more)
                            })
                            .err()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Some(Error::InvalidFormat("source worker panicked".into())))
                })
                .collect()
        });

        collect_errors(errors)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::HashMap;

    /// An in-memory row source for pipeline tests
    pub struct VecSource {
        pub fields: Fields,
        pub resolution: i64,
        pub as_of: Timestamp,
        pub until: Timestamp,
        pub rows: Vec<(ByteMap, Vals)>,
    }

    impl VecSource {
        pub fn new(fields: Fields, resolution: i64, rows: Vec<(ByteMap, Vals)>) -> VecSource {
            VecSource {
                fields,
                resolution,
                as_of: i64::MIN,
                until: i64::MAX,
                rows,
            }
        }
    }

    impl Source for VecSource {
        fn fields(&self) -> Fields {
            self.fields.clone()
        }

        fn resolution(&self) -> i64 {
            self.resolution
        }

        fn as_of(&self) -> Timestamp {
            self.as_of
        }

        fn until(&self) -> Timestamp {
            self.until
        }

        fn describe(&self) -> String {
            "vec".to_string()
        }
    }

    impl RowSource for VecSource {
        fn iterate(&self, ctx: &QueryContext, on_fields: OnFields, on_row: OnRow) -> Result<()> {
            on_fields(&self.fields)?;
            for (key, vals) in &self.rows {
                ctx.check_deadline()?;
                if !on_row(key, vals)? {
                    break;
                }
            }
            Ok(())
        }
    }

    /// Build a sequence by folding `(ts, value)` samples through an expr
    pub fn seq_of(e: &Expr, resolution: i64, samples: &[(Timestamp, f64)]) -> Sequence {
        let mut seq = Sequence::empty();
        for (ts, v) in samples {
            let mut p = HashMap::new();
            p.insert("v".to_string(), *v);
            seq = seq.update(*ts, &p, None, e, resolution, i64::MIN);
        }
        seq
    }
}
