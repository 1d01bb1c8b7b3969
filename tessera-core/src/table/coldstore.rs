//! Cold storage for flushed memstore contents
//!
//! Each flush writes one file of CRC-framed rows, named for the resolution
//! window it covers: `flush_<window_start>_<window_end>_<id>.dat`. Rows are
//! sorted by key. Background compaction merges accumulated flush files so
//! reads stay bounded.
//!
//! Row payload layout (lengths big-endian):
//!
//! ```text
//! ┌──────────┬───────┬────────────┬──────────────────────────┐
//! │ Key Len  │ Key   │ Seq Count  │ (Seq Len | Seq Bytes)*   │
//! │ (4)      │ (N)   │ (4)        │                          │
//! └──────────┴───────┴────────────┴──────────────────────────┘
//! ```

use crate::core::{Fields, Vals};
use crate::encoding::{self, Sequence, Timestamp};
use crate::wal::{frame, read_frame, Frame};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const MAGIC: &[u8] = b"tessera.flush.v1";

pub struct ColdStore {
    dir: PathBuf,
    next_id: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct FlushFile {
    pub path: PathBuf,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub id: u64,
}

impl ColdStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<ColdStore> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let max_id = list_files(&dir)?.iter().map(|f| f.id).max().unwrap_or(0);
        Ok(ColdStore {
            dir,
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    /// Write one flush file covering the given resolution window
    pub fn flush(
        &self,
        rows: &[(Vec<u8>, Vals)],
        window: (Timestamp, Timestamp),
    ) -> Result<PathBuf> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = self
            .dir
            .join(format!("flush_{}_{}_{:010}.dat", window.0, window.1, id));
        let tmp = path.with_extension("dat.tmp");

        {
            let mut file = File::create(&tmp)?;
            file.write_all(&frame(MAGIC))?;
            for (key, vals) in rows {
                file.write_all(&frame(&encode_row(key, vals)))?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        info!(path = ?path, rows = rows.len(), "flushed memstore to cold storage");
        Ok(path)
    }

    pub fn files(&self) -> Result<Vec<FlushFile>> {
        list_files(&self.dir)
    }

    /// Merge every stored row into `map`, truncating to the retention
    /// horizon as rows are read
    pub fn read_into(
        &self,
        map: &mut BTreeMap<Vec<u8>, Vals>,
        fields: &Fields,
        resolution: i64,
        truncate_before: Timestamp,
    ) -> Result<()> {
        for file in self.files()? {
            self.read_file_into(&file, map, fields, resolution, truncate_before)?;
        }
        Ok(())
    }

    /// Merge accumulated flush files into a single file
    ///
    /// Runs under the round-robin maintenance cursor. Returns false when
    /// there was nothing to do.
    pub fn compact(
        &self,
        fields: &Fields,
        resolution: i64,
        truncate_before: Timestamp,
    ) -> Result<bool> {
        let files = self.files()?;
        if files.len() < 2 {
            return Ok(false);
        }

        let mut map = BTreeMap::new();
        for file in &files {
            self.read_file_into(file, &mut map, fields, resolution, truncate_before)?;
        }

        let window_start = files.iter().map(|f| f.window_start).min().unwrap_or(0);
        let window_end = files.iter().map(|f| f.window_end).max().unwrap_or(0);
        let rows: Vec<(Vec<u8>, Vals)> = map
            .into_iter()
            .filter(|(_, vals)| vals.iter().any(|s| !s.is_empty()))
            .collect();
        self.flush(&rows, (window_start, window_end))?;

        for file in &files {
            fs::remove_file(&file.path)?;
        }
        debug!(merged = files.len(), rows = rows.len(), "compacted cold storage");
        Ok(true)
    }

    fn read_file_into(
        &self,
        file: &FlushFile,
        map: &mut BTreeMap<Vec<u8>, Vals>,
        fields: &Fields,
        resolution: i64,
        truncate_before: Timestamp,
    ) -> Result<()> {
        let data = fs::read(&file.path)?;
        let mut cursor = &data[..];
        let mut first = true;
        loop {
            match read_frame(cursor) {
                Frame::Ok { payload, consumed } => {
                    cursor = &cursor[consumed..];
                    if first {
                        first = false;
                        if payload != MAGIC {
                            return Err(Error::InvalidFormat(format!(
                                "unrecognized flush file {:?}",
                                file.path
                            )));
                        }
                        continue;
                    }
                    let (key, vals) = decode_row(payload)?;
                    merge_row(map, key, vals, fields, resolution, truncate_before);
                }
                Frame::NeedMore => break,
                Frame::Corrupt { .. } => {
                    warn!(path = ?file.path, "corrupt row in flush file, truncating read");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn merge_row(
    map: &mut BTreeMap<Vec<u8>, Vals>,
    key: Vec<u8>,
    vals: Vals,
    fields: &Fields,
    resolution: i64,
    truncate_before: Timestamp,
) {
    let entry = map
        .entry(key)
        .or_insert_with(|| vec![Sequence::empty(); fields.len()]);
    for (i, field) in fields.iter().enumerate() {
        if i >= vals.len() {
            break;
        }
        let existing = std::mem::take(&mut entry[i]);
        entry[i] = existing.merge(vals[i].clone(), &field.expr, resolution, truncate_before);
    }
}

fn encode_row(key: &[u8], vals: &Vals) -> Vec<u8> {
    let mut buf = Vec::new();
    encoding::put_u32(&mut buf, key.len() as u32);
    buf.extend_from_slice(key);
    encoding::put_u32(&mut buf, vals.len() as u32);
    for seq in vals {
        encoding::put_u32(&mut buf, seq.as_bytes().len() as u32);
        buf.extend_from_slice(seq.as_bytes());
    }
    buf
}

fn decode_row(data: &[u8]) -> Result<(Vec<u8>, Vals)> {
    if data.len() < 4 {
        return Err(Error::InvalidFormat("flush row too short".into()));
    }
    let (key_len, remain) = encoding::read_u32(data);
    if remain.len() < key_len as usize + 4 {
        return Err(Error::InvalidFormat("flush row key truncated".into()));
    }
    let (key, remain) = encoding::read_bytes(remain, key_len as usize);
    let (num_seqs, mut remain) = encoding::read_u32(remain);

    let mut vals = Vals::with_capacity(num_seqs as usize);
    for _ in 0..num_seqs {
        if remain.len() < 4 {
            return Err(Error::InvalidFormat("flush row sequence truncated".into()));
        }
        let (len, rest) = encoding::read_u32(remain);
        if rest.len() < len as usize {
            return Err(Error::InvalidFormat("flush row sequence truncated".into()));
        }
        let (seq, rest) = encoding::read_bytes(rest, len as usize);
        vals.push(Sequence::from_bytes(seq.to_vec()));
        remain = rest;
    }
    Ok((key.to_vec(), vals))
}

fn list_files(dir: &Path) -> Result<Vec<FlushFile>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for dirent in fs::read_dir(dir)? {
        let path = dirent?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name
            .strip_prefix("flush_")
            .and_then(|s| s.strip_suffix(".dat"))
        else {
            continue;
        };
        let parts: Vec<&str> = stem.splitn(3, '_').collect();
        if parts.len() != 3 {
            continue;
        }
        let (Ok(start), Ok(end), Ok(id)) = (
            parts[0].parse::<i64>(),
            parts[1].parse::<i64>(),
            parts[2].parse::<u64>(),
        ) else {
            continue;
        };
        files.push(FlushFile {
            path,
            window_start: start,
            window_end: end,
            id,
        });
    }
    files.sort_by_key(|f| f.id);
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Field;
    use crate::expr::Expr;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const RES: i64 = 60;

    fn sum_fields() -> Fields {
        vec![Field::new("v", Expr::sum(Expr::field("v")))]
    }

    fn seq(e: &Expr, samples: &[(i64, f64)]) -> Sequence {
        let mut s = Sequence::empty();
        for (ts, v) in samples {
            let mut p = HashMap::new();
            p.insert("v".to_string(), *v);
            s = s.update(*ts, &p, None, e, RES, i64::MIN);
        }
        s
    }

    #[test]
    fn test_flush_and_read_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = ColdStore::open(tmp.path()).unwrap();
        let fields = sum_fields();
        let e = &fields[0].expr;

        let rows = vec![
            (b"a".to_vec(), vec![seq(e, &[(0, 1.0)])]),
            (b"b".to_vec(), vec![seq(e, &[(RES, 2.0)])]),
        ];
        store.flush(&rows, (0, RES)).unwrap();

        let mut map = BTreeMap::new();
        store.read_into(&mut map, &fields, RES, i64::MIN).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&b"a".to_vec()][0].value_at(0, e).0, 1.0);
        assert_eq!(map[&b"b".to_vec()][0].value_at(0, e).0, 2.0);
    }

    #[test]
    fn test_read_merges_across_files() {
        let tmp = TempDir::new().unwrap();
        let store = ColdStore::open(tmp.path()).unwrap();
        let fields = sum_fields();
        let e = &fields[0].expr;

        store
            .flush(&[(b"k".to_vec(), vec![seq(e, &[(0, 1.0)])])], (0, 0))
            .unwrap();
        store
            .flush(&[(b"k".to_vec(), vec![seq(e, &[(0, 2.0)])])], (0, 0))
            .unwrap();

        let mut map = BTreeMap::new();
        store.read_into(&mut map, &fields, RES, i64::MIN).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&b"k".to_vec()][0].value_at(0, e).0, 3.0);
    }

    #[test]
    fn test_compact_collapses_files() {
        let tmp = TempDir::new().unwrap();
        let store = ColdStore::open(tmp.path()).unwrap();
        let fields = sum_fields();
        let e = &fields[0].expr;

        for i in 0..3 {
            store
                .flush(
                    &[(b"k".to_vec(), vec![seq(e, &[(i * RES, 1.0)])])],
                    (i * RES, i * RES),
                )
                .unwrap();
        }
        assert_eq!(store.files().unwrap().len(), 3);

        assert!(store.compact(&fields, RES, i64::MIN).unwrap());
        let files = store.files().unwrap();
        assert_eq!(files.len(), 1);

        let mut map = BTreeMap::new();
        store.read_into(&mut map, &fields, RES, i64::MIN).unwrap();
        let seq = &map[&b"k".to_vec()][0];
        assert_eq!(seq.num_periods(e.encoded_width()), 3);

        // Nothing further to compact
        assert!(!store.compact(&fields, RES, i64::MIN).unwrap());
    }

    #[test]
    fn test_retention_applied_on_read() {
        let tmp = TempDir::new().unwrap();
        let store = ColdStore::open(tmp.path()).unwrap();
        let fields = sum_fields();
        let e = &fields[0].expr;

        store
            .flush(
                &[(b"k".to_vec(), vec![seq(e, &[(0, 1.0), (10 * RES, 2.0)])])],
                (0, 10 * RES),
            )
            .unwrap();

        let mut map = BTreeMap::new();
        store.read_into(&mut map, &fields, RES, 5 * RES).unwrap();
        let seq = &map[&b"k".to_vec()][0];
        assert_eq!(seq.start(), 10 * RES);
        assert_eq!(seq.num_periods(e.encoded_width()), 6);
    }
}
