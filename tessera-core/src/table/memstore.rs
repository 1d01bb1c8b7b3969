//! In-memory partial-aggregate store
//!
//! Maps a table's grouping dimensions (canonical byte-map keys) to one
//! sequence per field. Mutated only by the owning table's ingest worker;
//! queries take snapshots. The byte-size estimate feeds the process-wide
//! memory guard.

use crate::core::Vals;
use crate::encoding::Sequence;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

pub struct Memstore {
    entries: Mutex<HashMap<Vec<u8>, Vals>>,
    size: AtomicI64,
}

impl Memstore {
    pub fn new() -> Memstore {
        Memstore {
            entries: Mutex::new(HashMap::new()),
            size: AtomicI64::new(0),
        }
    }

    /// Mutate the sequences for a key, keeping the size estimate current
    pub fn apply<F>(&self, key: &[u8], num_fields: usize, f: F)
    where
        F: FnOnce(&mut Vals),
    {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_vec()).or_insert_with(|| {
            self.size.fetch_add(key.len() as i64, Ordering::Relaxed);
            vec![Sequence::empty(); num_fields]
        });
        let before: i64 = entry.iter().map(|s| s.byte_size() as i64).sum();
        f(entry);
        let after: i64 = entry.iter().map(|s| s.byte_size() as i64).sum();
        self.size.fetch_add(after - before, Ordering::Relaxed);
    }

    /// Estimated heap bytes held
    pub fn byte_size(&self) -> usize {
        self.size.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the current contents, sorted by key
    pub fn snapshot(&self) -> Vec<(Vec<u8>, Vals)> {
        let entries = self.entries.lock();
        let mut rows: Vec<_> = entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// Drain the store for a flush, resetting the size estimate to zero
    pub fn swap_out(&self) -> Vec<(Vec<u8>, Vals)> {
        let mut entries = self.entries.lock();
        let drained = std::mem::take(&mut *entries);
        self.size.store(0, Ordering::Relaxed);
        let mut rows: Vec<_> = drained.into_iter().collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

impl Default for Memstore {
    fn default() -> Self {
        Memstore::new()
    }
}
