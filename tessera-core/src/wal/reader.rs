//! Blocking, resumable WAL readers
//!
//! A reader tails its WAL: at the end of a closed segment it moves to the
//! next one, and at the tail of the active segment it blocks until the
//! writer appends more data or closes the log. Each successful read
//! persists the reader's named offset for crash-safe resume.

use super::entry::{read_frame, Frame};
use super::{
    compressed_segment_path, list_segments, offset_path, read_segment_bytes, segment_path, Offset,
    SegmentFile, Shared,
};
use crate::Result;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use tracing::{debug, warn};

enum Source {
    /// The live segment file, read incrementally
    Live(File),
    /// A closed (possibly gzipped) segment, fully buffered
    Buffered,
}

/// A named reader over a [`super::Wal`]
pub struct WalReader {
    shared: Arc<Shared>,
    name: String,
    segment: u64,
    /// Offset of the first unconsumed byte within the segment
    position: u64,
    buf: Vec<u8>,
    source: Option<Source>,
    auto_persist: bool,
}

impl WalReader {
    pub(crate) fn new(shared: Arc<Shared>, name: String, start: Offset) -> WalReader {
        WalReader {
            shared,
            name,
            segment: start.segment,
            position: start.position,
            buf: Vec::new(),
            source: None,
            auto_persist: true,
        }
    }

    /// Disable per-read offset persistence for consumers that checkpoint
    /// their position themselves
    pub fn set_auto_persist(&mut self, auto_persist: bool) {
        self.auto_persist = auto_persist;
    }

    /// The reader's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The offset of the next entry to be read
    pub fn offset(&self) -> Offset {
        Offset {
            segment: self.segment,
            position: self.position,
        }
    }

    /// Read the next entry, blocking until one is available
    ///
    /// Returns `None` when the WAL has been closed and fully drained.
    /// Empty payloads are skipped. Corrupt frames are logged and skipped
    /// by resynchronizing to the next segment or the writer's position.
    pub fn read(&mut self) -> Result<Option<(Vec<u8>, Offset)>> {
        loop {
            if self.source.is_none() && !self.open_source()? {
                return Ok(None);
            }

            match read_frame(&self.buf) {
                Frame::Ok { payload, consumed } => {
                    let payload = payload.to_vec();
                    self.position += consumed as u64;
                    self.buf.drain(..consumed);
                    let offset = self.offset();
                    if self.auto_persist {
                        self.persist_offset(offset);
                    }
                    if payload.is_empty() {
                        continue;
                    }
                    return Ok(Some((payload, offset)));
                }
                Frame::Corrupt { expected, actual } => {
                    warn!(
                        name = %self.name,
                        segment = self.segment,
                        position = self.position,
                        expected,
                        actual,
                        "corrupt WAL frame, resynchronizing"
                    );
                    self.resync();
                }
                Frame::NeedMore => {
                    if !self.fill()? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Open the segment at the reader's position, skipping forward past
    /// truncated segments. Returns false when the WAL is closed and no
    /// data remains.
    fn open_source(&mut self) -> Result<bool> {
        loop {
            let plain = segment_path(&self.shared.dir, self.segment);
            if plain.exists() {
                let mut file = File::open(&plain)?;
                file.seek(SeekFrom::Start(self.position))?;
                self.source = Some(Source::Live(file));
                return Ok(true);
            }
            let gz = compressed_segment_path(&self.shared.dir, self.segment);
            if gz.exists() {
                let seg = SegmentFile {
                    id: self.segment,
                    path: gz,
                    compressed: true,
                };
                let data = read_segment_bytes(&seg)?;
                let from = (self.position as usize).min(data.len());
                self.buf = data[from..].to_vec();
                self.source = Some(Source::Buffered);
                return Ok(true);
            }

            // Segment is gone (aged out) or not yet created; skip to the
            // next existing one, or to the writer's active segment
            let next = list_segments(&self.shared.dir)?
                .iter()
                .map(|s| s.id)
                .filter(|id| *id > self.segment)
                .min();
            match next {
                Some(id) => {
                    debug!(name = %self.name, from = self.segment, to = id, "skipping to next segment");
                    self.segment = id;
                    self.position = 0;
                }
                None => {
                    let state = self.shared.state.lock();
                    if state.closed {
                        return Ok(false);
                    }
                    if state.segment > self.segment {
                        self.segment = state.segment;
                        self.position = 0;
                    } else if self.segment > state.segment {
                        // Offset from a future that never happened; clamp
                        // to the writer's tail
                        self.segment = state.segment;
                        self.position = state.position;
                    } else {
                        // The active segment should exist; if we raced its
                        // creation, retry
                        drop(state);
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    /// Pull more bytes into the parse buffer, blocking at the live tail.
    /// Returns false when the WAL is closed and drained.
    fn fill(&mut self) -> Result<bool> {
        let advance = match self.source {
            Some(Source::Live(ref mut file)) => {
                let mut chunk = [0u8; 8192];
                let n = file.read(&mut chunk)?;
                if n > 0 {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                // At the end of this file: either the writer moved on to a
                // newer segment, or we wait for more data
                let consumed_through = self.position + self.buf.len() as u64;
                let mut state = self.shared.state.lock();
                loop {
                    if state.segment > self.segment {
                        break true;
                    }
                    if state.segment == self.segment && state.position > consumed_through {
                        break false;
                    }
                    if state.closed {
                        return Ok(false);
                    }
                    self.shared.data_ready.wait(&mut state);
                }
            }
            Some(Source::Buffered) => {
                // Closed segments are fully buffered; nothing more here
                self.position += self.buf.len() as u64;
                true
            }
            None => return Ok(true),
        };

        if advance {
            self.advance_segment();
        }
        Ok(true)
    }

    fn advance_segment(&mut self) {
        self.segment += 1;
        self.position = 0;
        self.buf.clear();
        self.source = None;
    }

    /// Skip past a corrupt region: jump to the next segment, or to the
    /// writer's current position when already on the active segment
    fn resync(&mut self) {
        let state = self.shared.state.lock();
        if state.segment > self.segment {
            drop(state);
            self.advance_segment();
        } else {
            self.position = state.position;
            drop(state);
            self.buf.clear();
            self.source = None;
        }
    }

    fn persist_offset(&self, offset: Offset) {
        let path = offset_path(&self.shared.dir, &self.name);
        if let Err(err) = fs::write(&path, offset.encode()) {
            debug!(name = %self.name, %err, "unable to persist reader offset");
        }
    }
}
