//! Per-stream write-ahead log
//!
//! An append-only log segmented by size. Appends return an [`Offset`]
//! (segment + position) that readers can resume from. Readers are named;
//! each name's last offset is persisted so a follower can pick up where it
//! left off after a crash.
//!
//! Aged segments are deleted by [`Wal::truncate_before_time`] and gzipped
//! in place by [`Wal::compress_before_time`]; readers tail across segment
//! rotation and transparently read compressed segments.

mod entry;
mod reader;

pub use entry::{decode_parts, decode_point, encode_point};
pub use reader::WalReader;

pub(crate) use entry::{frame, read_frame, Frame};

use crate::encoding::Timestamp;
use crate::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalOptions {
    /// Maximum segment size in bytes before rotation
    pub segment_size: usize,
    /// How often to fsync; zero means sync after every write
    pub sync_interval: Duration,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            segment_size: crate::config::WAL_SEGMENT_SIZE,
            sync_interval: Duration::ZERO,
        }
    }
}

/// Position of an entry in a WAL: segment id plus byte offset within it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Offset {
    pub segment: u64,
    pub position: u64,
}

impl Offset {
    /// The start of the log; readers clamp to the earliest live segment
    pub const BEGINNING: Offset = Offset {
        segment: 0,
        position: 0,
    };

    pub fn encode(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[..8].copy_from_slice(&self.segment.to_be_bytes());
        b[8..].copy_from_slice(&self.position.to_be_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Option<Offset> {
        if b.len() != 16 {
            return None;
        }
        Some(Offset {
            segment: u64::from_be_bytes(b[..8].try_into().unwrap()),
            position: u64::from_be_bytes(b[8..].try_into().unwrap()),
        })
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.segment, self.position)
    }
}

pub(crate) struct WriterState {
    file: File,
    pub segment: u64,
    pub position: u64,
    last_sync: Instant,
    pub closed: bool,
}

pub(crate) struct Shared {
    pub dir: PathBuf,
    opts: WalOptions,
    pub state: Mutex<WriterState>,
    pub data_ready: Condvar,
}

/// A single stream's write-ahead log
pub struct Wal {
    shared: Arc<Shared>,
}

impl Wal {
    /// Open or create a WAL in the given directory
    pub fn open(dir: impl Into<PathBuf>, opts: WalOptions) -> Result<Wal> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(dir.join("offsets"))?;

        let segment = list_segments(&dir)?
            .iter()
            .filter(|s| !s.compressed)
            .map(|s| s.id)
            .max()
            .unwrap_or(1);
        let path = segment_path(&dir, segment);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let position = file.metadata()?.len();

        info!(dir = ?dir, segment, position, "WAL opened");

        Ok(Wal {
            shared: Arc::new(Shared {
                dir,
                opts,
                state: Mutex::new(WriterState {
                    file,
                    segment,
                    position,
                    last_sync: Instant::now(),
                    closed: false,
                }),
                data_ready: Condvar::new(),
            }),
        })
    }

    /// Append a payload, returning the offset it was written at
    pub fn append(&self, payload: &[u8]) -> Result<Offset> {
        let framed = entry::frame(payload);
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(Error::WalClosed);
        }

        if state.position > 0
            && state.position as usize + framed.len() > self.shared.opts.segment_size
        {
            self.rotate(&mut *state)?;
        }

        let offset = Offset {
            segment: state.segment,
            position: state.position,
        };
        state.file.write_all(&framed)?;
        state.position += framed.len() as u64;

        let sync_now = self.shared.opts.sync_interval.is_zero()
            || state.last_sync.elapsed() >= self.shared.opts.sync_interval;
        if sync_now {
            state.file.sync_data()?;
            state.last_sync = Instant::now();
        }

        drop(state);
        self.shared.data_ready.notify_all();
        Ok(offset)
    }

    /// The offset the next append will be written at
    pub fn last_offset(&self) -> Offset {
        let state = self.shared.state.lock();
        Offset {
            segment: state.segment,
            position: state.position,
        }
    }

    /// Force an fsync of the active segment
    pub fn sync(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.file.sync_data()?;
        state.last_sync = Instant::now();
        Ok(())
    }

    /// Open a named reader
    ///
    /// With an explicit offset the reader starts there; otherwise it
    /// resumes from the name's persisted offset, or the start of the log.
    pub fn reader(&self, name: &str, offset: Option<Offset>) -> Result<WalReader> {
        let start = match offset {
            Some(o) => o,
            None => fs::read(offset_path(&self.shared.dir, name))
                .ok()
                .and_then(|b| Offset::decode(&b))
                .unwrap_or(Offset::BEGINNING),
        };
        debug!(name, offset = %start, "WAL reader opened");
        Ok(WalReader::new(self.shared.clone(), name.to_string(), start))
    }

    /// Persist a named reader's offset explicitly
    ///
    /// Used by consumers that checkpoint their position themselves (for
    /// example, tables persist at flush time so replay after a crash
    /// rebuilds the memstore).
    pub fn persist_offset(&self, name: &str, offset: Offset) -> Result<()> {
        fs::write(offset_path(&self.shared.dir, name), offset.encode())?;
        Ok(())
    }

    /// Delete closed segments whose newest entry is older than `t`
    pub fn truncate_before_time(&self, t: Timestamp) -> Result<usize> {
        let active = self.shared.state.lock().segment;
        let mut removed = 0;
        for seg in list_segments(&self.shared.dir)? {
            if seg.id >= active {
                continue;
            }
            match last_entry_ts(&seg)? {
                Some(ts) if ts >= t => {}
                _ => {
                    fs::remove_file(&seg.path)?;
                    removed += 1;
                    debug!(segment = seg.id, "truncated aged WAL segment");
                }
            }
        }
        Ok(removed)
    }

    /// Gzip closed segments whose newest entry is older than `t`
    pub fn compress_before_time(&self, t: Timestamp) -> Result<usize> {
        let active = self.shared.state.lock().segment;
        let mut compressed = 0;
        for seg in list_segments(&self.shared.dir)? {
            if seg.id >= active || seg.compressed {
                continue;
            }
            match last_entry_ts(&seg)? {
                Some(ts) if ts >= t => {}
                _ => {
                    compress_segment(&seg.path)?;
                    compressed += 1;
                    debug!(segment = seg.id, "compressed aged WAL segment");
                }
            }
        }
        Ok(compressed)
    }

    /// Close the WAL, waking any blocked readers
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        drop(state);
        self.shared.data_ready.notify_all();
    }

    fn rotate(&self, state: &mut WriterState) -> Result<()> {
        state.file.sync_data()?;
        state.segment += 1;
        let path = segment_path(&self.shared.dir, state.segment);
        state.file = OpenOptions::new().create(true).append(true).open(&path)?;
        state.position = 0;
        debug!(segment = state.segment, "WAL segment rotated");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SegmentFile {
    pub id: u64,
    pub path: PathBuf,
    pub compressed: bool,
}

pub(crate) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log", id))
}

pub(crate) fn compressed_segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log.gz", id))
}

pub(crate) fn offset_path(dir: &Path, name: &str) -> PathBuf {
    dir.join("offsets").join(name)
}

pub(crate) fn list_segments(dir: &Path) -> Result<Vec<SegmentFile>> {
    let mut segments = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let path = dirent?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_prefix("wal_") else {
            continue;
        };
        let (id_str, compressed) = match stem.strip_suffix(".log.gz") {
            Some(s) => (s, true),
            None => match stem.strip_suffix(".log") {
                Some(s) => (s, false),
                None => continue,
            },
        };
        if let Ok(id) = id_str.parse::<u64>() {
            segments.push(SegmentFile {
                id,
                path,
                compressed,
            });
        }
    }
    segments.sort_by_key(|s| s.id);
    Ok(segments)
}

pub(crate) fn read_segment_bytes(seg: &SegmentFile) -> Result<Vec<u8>> {
    let raw = fs::read(&seg.path)?;
    if !seg.compressed {
        return Ok(raw);
    }
    let mut decoder = GzDecoder::new(&raw[..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Timestamp of the newest entry in a segment, scanning its frames
fn last_entry_ts(seg: &SegmentFile) -> Result<Option<Timestamp>> {
    let data = read_segment_bytes(seg)?;
    let mut last = None;
    let mut cursor = &data[..];
    loop {
        match entry::read_frame(cursor) {
            entry::Frame::Ok { payload, consumed } => {
                if payload.len() >= 8 {
                    last = Some(i64::from_be_bytes(payload[..8].try_into().unwrap()));
                }
                cursor = &cursor[consumed..];
            }
            entry::Frame::NeedMore => break,
            entry::Frame::Corrupt { .. } => {
                warn!(segment = seg.id, "corrupt frame while scanning segment");
                break;
            }
        }
    }
    Ok(last)
}

fn compress_segment(path: &Path) -> Result<()> {
    let data = fs::read(path)?;
    let gz_path = path.with_extension("log.gz");
    let tmp_path = path.with_extension("log.gz.tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&data)?;
        let file = encoder.finish()?;
        file.sync_data()?;
    }
    fs::rename(&tmp_path, &gz_path)?;
    fs::remove_file(path)?;
    Ok(())
}
