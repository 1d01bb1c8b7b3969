//! Time-bucket sequences
//!
//! A sequence is a single byte buffer holding a contiguous run of
//! fixed-width aggregation states, newest first:
//!
//! ```text
//! ┌───────────┬──────────┬──────────┬─────┐
//! │ start_ts  │ bucket 0 │ bucket 1 │ ... │
//! │ (8, BE)   │ (W)      │ (W)      │     │
//! └───────────┴──────────┴──────────┴─────┘
//! ```
//!
//! Bucket `i` covers the interval starting at `start_ts - i * resolution`.
//! Folding in a newer sample prepends buckets (zero-filling any gap) and
//! moves `start_ts` forward; folding in an older sample grows the tail.

use super::{align_to, Timestamp};
use crate::expr::{Expr, Params};
use crate::encoding::ByteMap;
use serde::{Deserialize, Serialize};

const HEADER: usize = 8;

/// A newest-first, fixed-width bucket time series
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sequence(Vec<u8>);

impl Sequence {
    /// An empty sequence holding no buckets
    pub fn empty() -> Sequence {
        Sequence(Vec::new())
    }

    /// Wrap raw encoded bytes without validation
    pub fn from_bytes(b: Vec<u8>) -> Sequence {
        Sequence(b)
    }

    /// The encoded form
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() < HEADER
    }

    /// Timestamp of bucket 0, the newest bucket
    pub fn start(&self) -> Timestamp {
        if self.is_empty() {
            return 0;
        }
        i64::from_be_bytes(self.0[..HEADER].try_into().unwrap())
    }

    fn set_start(&mut self, ts: Timestamp) {
        self.0[..HEADER].copy_from_slice(&ts.to_be_bytes());
    }

    /// Number of buckets held, given the expression's encoded width
    pub fn num_periods(&self, width: usize) -> usize {
        if self.is_empty() || width == 0 {
            return 0;
        }
        (self.0.len() - HEADER) / width
    }

    /// Approximate heap footprint in bytes
    pub fn byte_size(&self) -> usize {
        self.0.len()
    }

    fn bucket(&self, i: usize, width: usize) -> &[u8] {
        let off = HEADER + i * width;
        &self.0[off..off + width]
    }

    fn bucket_mut(&mut self, i: usize, width: usize) -> &mut [u8] {
        let off = HEADER + i * width;
        &mut self.0[off..off + width]
    }

    /// Decode the value at bucket `i`
    pub fn value_at(&self, i: usize, e: &Expr) -> (f64, bool) {
        let width = e.encoded_width();
        if i >= self.num_periods(width) {
            return (0.0, false);
        }
        let (value, set, _) = e.get(self.bucket(i, width));
        (value, set)
    }

    /// Decode the value of the bucket covering `ts`
    pub fn value_at_time(&self, ts: Timestamp, e: &Expr, resolution: i64) -> (f64, bool) {
        if self.is_empty() {
            return (0.0, false);
        }
        let bucket_ts = align_to(ts, resolution);
        let start = self.start();
        if bucket_ts > start {
            return (0.0, false);
        }
        self.value_at(((start - bucket_ts) / resolution) as usize, e)
    }

    /// Fold another sequence's buckets into this one through a sub-merger
    ///
    /// Used when re-aggregating a composite expression (such as an average)
    /// from a subexpression's partial states. The sequence is expanded to
    /// cover the other's range; each of the other's buckets is folded into
    /// the aligned bucket here.
    pub fn sub_merge_from(
        mut self,
        other: &Sequence,
        own_width: usize,
        other_width: usize,
        resolution: i64,
        metadata: Option<&ByteMap>,
        f: &crate::expr::SubMerger,
    ) -> Sequence {
        if other.is_empty() || other_width == 0 || own_width == 0 {
            return self;
        }
        let o_n = other.num_periods(other_width);
        let o_start = other.start();
        let o_end = o_start - (o_n as i64 - 1) * resolution;

        if self.is_empty() {
            self.0 = vec![0u8; HEADER + o_n * own_width];
            self.set_start(o_start);
        } else {
            let s_n = self.num_periods(own_width);
            let s_end = self.start() - (s_n as i64 - 1) * resolution;
            let start = self.start().max(o_start);
            let end = s_end.min(o_end);
            let total = ((start - end) / resolution) as usize + 1;
            let shift = ((start - self.start()) / resolution) as usize;

            let mut buf = vec![0u8; HEADER + total * own_width];
            buf[..HEADER].copy_from_slice(&start.to_be_bytes());
            let src = &self.0[HEADER..];
            buf[HEADER + shift * own_width..HEADER + shift * own_width + src.len()]
                .copy_from_slice(src);
            self.0 = buf;
        }

        let start = self.start();
        for i in 0..o_n {
            let ts = o_start - i as i64 * resolution;
            let own_i = ((start - ts) / resolution) as usize;
            let off = HEADER + own_i * own_width;
            f(
                &mut self.0[off..off + own_width],
                other.bucket(i, other_width),
                metadata,
            );
        }
        self
    }

    /// Fold a timestamped sample into the sequence
    ///
    /// The timestamp is aligned down to `resolution`. Buckets older than
    /// `truncate_before` are dropped after the fold.
    pub fn update(
        mut self,
        ts: Timestamp,
        params: &dyn Params,
        metadata: Option<&ByteMap>,
        e: &Expr,
        resolution: i64,
        truncate_before: Timestamp,
    ) -> Sequence {
        let width = e.encoded_width();
        debug_assert!(width > 0, "zero-width expression in sequence");
        let bucket_ts = align_to(ts, resolution);

        if bucket_ts < truncate_before {
            // Sample already aged out; don't grow the tail just to drop it
            return self.truncate(width, resolution, truncate_before);
        }

        if self.is_empty() {
            self.0 = vec![0u8; HEADER + width];
            self.set_start(bucket_ts);
            e.update(self.bucket_mut(0, width), params, metadata);
            return self.truncate(width, resolution, truncate_before);
        }

        let start = self.start();
        let idx = if bucket_ts > start {
            // Prepend, zero-filling the gap, and shift the start forward
            let new_buckets = ((bucket_ts - start) / resolution) as usize;
            let mut buf = vec![0u8; self.0.len() + new_buckets * width];
            buf[HEADER + new_buckets * width..].copy_from_slice(&self.0[HEADER..]);
            self.0 = buf;
            self.set_start(bucket_ts);
            0
        } else {
            let idx = ((start - bucket_ts) / resolution) as usize;
            if idx >= self.num_periods(width) {
                // Append past the tail, zero-filling intermediate buckets
                self.0.resize(HEADER + (idx + 1) * width, 0);
            }
            idx
        };

        e.update(self.bucket_mut(idx, width), params, metadata);
        self.truncate(width, resolution, truncate_before)
    }

    /// Drop trailing buckets strictly older than `truncate_before`
    pub fn truncate(
        mut self,
        width: usize,
        resolution: i64,
        truncate_before: Timestamp,
    ) -> Sequence {
        if self.is_empty() || width == 0 {
            return self;
        }
        let start = self.start();
        if start < truncate_before {
            return Sequence::empty();
        }
        // Oldest surviving index: the last i with start - i*res >= cutoff
        let keep = ((start - truncate_before) / resolution) as usize + 1;
        let n = self.num_periods(width);
        if keep < n {
            self.0.truncate(HEADER + keep * width);
        }
        self
    }

    /// Merge another sequence of the same expression and resolution
    ///
    /// The result spans the union of both ranges; overlapping buckets are
    /// combined with the expression's merge.
    pub fn merge(
        self,
        other: Sequence,
        e: &Expr,
        resolution: i64,
        truncate_before: Timestamp,
    ) -> Sequence {
        let width = e.encoded_width();
        if self.is_empty() {
            return other.truncate(width, resolution, truncate_before);
        }
        if other.is_empty() {
            return self.truncate(width, resolution, truncate_before);
        }

        let (a, b) = (&self, &other);
        let start = a.start().max(b.start());
        let a_end = a.start() - (a.num_periods(width) as i64 - 1) * resolution;
        let b_end = b.start() - (b.num_periods(width) as i64 - 1) * resolution;
        let end = a_end.min(b_end);
        let total = ((start - end) / resolution) as usize + 1;

        let mut out = vec![0u8; HEADER + total * width];
        out[..HEADER].copy_from_slice(&start.to_be_bytes());

        let empty: &[u8] = &[];
        for i in 0..total {
            let ts = start - i as i64 * resolution;
            let xa = Self::bucket_at(a, ts, width, resolution).unwrap_or(empty);
            let xb = Self::bucket_at(b, ts, width, resolution).unwrap_or(empty);
            let off = HEADER + i * width;
            e.merge(&mut out[off..off + width], xa, xb);
        }

        Sequence(out).truncate(width, resolution, truncate_before)
    }

    fn bucket_at<'a>(
        seq: &'a Sequence,
        ts: Timestamp,
        width: usize,
        resolution: i64,
    ) -> Option<&'a [u8]> {
        let start = seq.start();
        if ts > start {
            return None;
        }
        let i = ((start - ts) / resolution) as usize;
        if i >= seq.num_periods(width) {
            return None;
        }
        Some(seq.bucket(i, width))
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "Sequence(empty)");
        }
        write!(
            f,
            "Sequence(start={}, {} bytes)",
            self.start(),
            self.0.len() - HEADER
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const RES: i64 = 60_000_000_000; // one minute
    const EPOCH: Timestamp = 1_430_895_000_000_000_000;

    fn sum_expr() -> Expr {
        Expr::sum(Expr::field("v"))
    }

    fn insert(seq: Sequence, e: &Expr, ts: Timestamp, v: f64, truncate_before: Timestamp) -> Sequence {
        let mut p = HashMap::new();
        p.insert("v".to_string(), v);
        seq.update(ts, &p, None, e, RES, truncate_before)
    }

    fn values(seq: &Sequence, e: &Expr) -> Vec<f64> {
        let width = e.encoded_width();
        (0..seq.num_periods(width))
            .map(|i| seq.value_at(i, e).0)
            .collect()
    }

    #[test]
    fn test_scattered_inserts() {
        // Newest-first layout with zero-filled gaps
        let e = sum_expr();
        let mut seq = Sequence::empty();
        seq = insert(seq, &e, EPOCH + 10 * RES, 6.0, i64::MIN);
        seq = insert(seq, &e, EPOCH + 7 * RES, 5.0, i64::MIN);
        seq = insert(seq, &e, EPOCH + 5 * RES, 4.0, i64::MIN);

        assert_eq!(seq.start(), EPOCH + 10 * RES);
        assert_eq!(values(&seq, &e), [6.0, 0.0, 0.0, 5.0, 0.0, 4.0]);
    }

    #[test]
    fn test_scattered_inserts_with_retention() {
        // Three retained buckets: everything older than start - 2*res drops
        let e = sum_expr();
        let mut seq = Sequence::empty();
        let trunc = EPOCH + 8 * RES;
        seq = insert(seq, &e, EPOCH + 10 * RES, 6.0, trunc);
        seq = insert(seq, &e, EPOCH + 7 * RES, 5.0, trunc);
        seq = insert(seq, &e, EPOCH + 5 * RES, 4.0, trunc);

        assert_eq!(values(&seq, &e), [6.0, 0.0, 0.0]);
    }

    #[test]
    fn test_prepend_append_update() {
        let e = sum_expr();
        let mut seq = Sequence::empty();

        // Set something on an empty sequence
        seq = insert(seq, &e, EPOCH, 2.0, i64::MIN);
        assert_eq!(values(&seq, &e), [2.0]);

        // Prepend
        seq = insert(seq, &e, EPOCH + 2 * RES, 1.0, i64::MIN);
        assert_eq!(values(&seq, &e), [1.0, 0.0, 2.0]);

        // Append
        seq = insert(seq, &e, EPOCH - RES, 3.0, i64::MIN);
        assert_eq!(values(&seq, &e), [1.0, 0.0, 2.0, 3.0]);

        // Append deep
        seq = insert(seq, &e, EPOCH - 3 * RES, 4.0, i64::MIN);
        assert_eq!(values(&seq, &e), [1.0, 0.0, 2.0, 3.0, 0.0, 4.0]);

        // Update an existing bucket in place
        seq = insert(seq, &e, EPOCH, 5.0, i64::MIN);
        assert_eq!(values(&seq, &e), [1.0, 0.0, 7.0, 3.0, 0.0, 4.0]);
    }

    #[test]
    fn test_insertion_order_irrelevant() {
        let e = sum_expr();
        let samples: Vec<(i64, f64)> = vec![
            (EPOCH, 2.0),
            (EPOCH + 2 * RES, 1.0),
            (EPOCH - RES, 3.0),
            (EPOCH + 5 * RES, 9.0),
            (EPOCH, 4.0),
        ];

        let build = |order: &[usize]| {
            let mut seq = Sequence::empty();
            for &i in order {
                let (ts, v) = samples[i];
                seq = insert(seq, &e, ts, v, i64::MIN);
            }
            seq
        };

        let reference = build(&[0, 1, 2, 3, 4]);
        for order in [
            [4, 3, 2, 1, 0],
            [2, 0, 4, 1, 3],
            [3, 1, 0, 4, 2],
        ] {
            assert_eq!(build(&order).as_bytes(), reference.as_bytes());
        }
    }

    #[test]
    fn test_truncation_bounds() {
        let e = sum_expr();
        let width = e.encoded_width();
        let mut seq = Sequence::empty();
        for i in 0..10 {
            seq = insert(seq, &e, EPOCH + i * RES, 1.0, i64::MIN);
        }

        let trunc = EPOCH + 6 * RES;
        let seq = seq.truncate(width, RES, trunc);
        assert_eq!(seq.num_periods(width), 4);
        assert_eq!(seq.start(), EPOCH + 9 * RES);

        // Truncating past the head empties the sequence
        let seq = seq.truncate(width, RES, EPOCH + 100 * RES);
        assert!(seq.is_empty());
    }

    #[test]
    fn test_expired_insert_is_noop() {
        let e = sum_expr();
        let trunc = EPOCH + 5 * RES;
        let mut seq = Sequence::empty();
        seq = insert(seq, &e, EPOCH + 8 * RES, 1.0, trunc);
        let before = seq.clone();

        // A sample far behind the retention window leaves nothing behind
        seq = insert(seq, &e, EPOCH - 10 * RES, 9.0, trunc);
        assert_eq!(seq.as_bytes(), before.as_bytes());
    }

    #[test]
    fn test_merge_overlapping() {
        let e = sum_expr();
        let mut a = Sequence::empty();
        a = insert(a, &e, EPOCH + 2 * RES, 1.0, i64::MIN);
        a = insert(a, &e, EPOCH + RES, 2.0, i64::MIN);

        let mut b = Sequence::empty();
        b = insert(b, &e, EPOCH + RES, 10.0, i64::MIN);
        b = insert(b, &e, EPOCH, 20.0, i64::MIN);

        let merged = a.clone().merge(b.clone(), &e, RES, i64::MIN);
        assert_eq!(merged.start(), EPOCH + 2 * RES);
        assert_eq!(values(&merged, &e), [1.0, 12.0, 20.0]);

        // Merge is symmetric
        let merged2 = b.merge(a, &e, RES, i64::MIN);
        assert_eq!(merged.as_bytes(), merged2.as_bytes());
    }

    #[test]
    fn test_merge_disjoint() {
        let e = sum_expr();
        let mut a = Sequence::empty();
        a = insert(a, &e, EPOCH + 4 * RES, 1.0, i64::MIN);

        let mut b = Sequence::empty();
        b = insert(b, &e, EPOCH, 2.0, i64::MIN);

        let merged = a.merge(b, &e, RES, i64::MIN);
        assert_eq!(values(&merged, &e), [1.0, 0.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_merge_with_empty() {
        let e = sum_expr();
        let mut a = Sequence::empty();
        a = insert(a, &e, EPOCH, 7.0, i64::MIN);

        let merged = a.clone().merge(Sequence::empty(), &e, RES, i64::MIN);
        assert_eq!(merged.as_bytes(), a.as_bytes());

        let merged = Sequence::empty().merge(a.clone(), &e, RES, i64::MIN);
        assert_eq!(merged.as_bytes(), a.as_bytes());
    }
}
