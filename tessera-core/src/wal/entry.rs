//! WAL entry payloads and record framing
//!
//! A point entry payload is the bit-exact ingest layout, all big-endian:
//!
//! ```text
//! ┌───────────┬───────────┬───────────┬───────────┐
//! │ Timestamp │ Dims Len  │ Dims      │ Values    │
//! │ (8)       │ (4)       │ (N)       │ (rest)    │
//! └───────────┴───────────┴───────────┴───────────┘
//! ```
//!
//! On disk each payload is framed with a length prefix and a CRC32
//! checksum so torn writes and corruption are detectable on replay:
//!
//! ```text
//! ┌───────────┬───────────┬───────────┐
//! │ Length    │ CRC32     │ Payload   │
//! │ (4)       │ (4)       │ (N)       │
//! └───────────┴───────────┴───────────┘
//! ```

use crate::encoding::{self, ByteMap, Timestamp};
use crate::{Error, Result};

/// Frame header width: length + checksum
pub(crate) const FRAME_HEADER: usize = 8;

/// Encode a point for the WAL
pub fn encode_point(ts: Timestamp, dims: &ByteMap, vals: &ByteMap) -> Vec<u8> {
    let dims_bytes = dims.as_bytes();
    let mut buf = Vec::with_capacity(12 + dims_bytes.len() + vals.as_bytes().len());
    encoding::put_i64(&mut buf, ts);
    encoding::put_u32(&mut buf, dims_bytes.len() as u32);
    buf.extend_from_slice(dims_bytes);
    buf.extend_from_slice(vals.as_bytes());
    buf
}

/// Decode a point payload into borrowed parts
pub fn decode_parts(data: &[u8]) -> Result<(Timestamp, &[u8], &[u8])> {
    if data.len() < 12 {
        return Err(Error::InvalidFormat("point entry too short".into()));
    }
    let (ts, remain) = encoding::read_i64(data);
    let (dims_len, remain) = encoding::read_u32(remain);
    if remain.len() < dims_len as usize {
        return Err(Error::InvalidFormat("point entry dims truncated".into()));
    }
    let (dims, vals) = encoding::read_bytes(remain, dims_len as usize);
    Ok((ts, dims, vals))
}

/// Decode a point payload into owned maps
pub fn decode_point(data: &[u8]) -> Result<(Timestamp, ByteMap, ByteMap)> {
    let (ts, dims, vals) = decode_parts(data)?;
    Ok((
        ts,
        ByteMap::from_bytes(dims.to_vec()),
        ByteMap::from_bytes(vals.to_vec()),
    ))
}

/// Frame a payload for appending to a segment
pub(crate) fn frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Outcome of attempting to read one frame from a buffer
pub(crate) enum Frame<'a> {
    /// A complete, checksum-valid payload and the bytes consumed
    Ok { payload: &'a [u8], consumed: usize },
    /// Not enough bytes buffered yet
    NeedMore,
    /// The frame is complete but its checksum does not match
    Corrupt { expected: u32, actual: u32 },
}

/// Try to read one frame from the front of `data`
pub(crate) fn read_frame(data: &[u8]) -> Frame<'_> {
    if data.len() < FRAME_HEADER {
        return Frame::NeedMore;
    }
    let len = u32::from_be_bytes(data[..4].try_into().unwrap()) as usize;
    let expected = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if data.len() < FRAME_HEADER + len {
        return Frame::NeedMore;
    }
    let payload = &data[FRAME_HEADER..FRAME_HEADER + len];
    let actual = crc32fast::hash(payload);
    if actual != expected {
        return Frame::Corrupt { expected, actual };
    }
    Frame::Ok {
        payload,
        consumed: FRAME_HEADER + len,
    }
}
