//! Canonical sorted byte-map
//!
//! A self-describing blob of `name -> bytes` entries, sorted by name. Two
//! maps holding the same entries encode to identical bytes, so map equality
//! is byte equality and encoded maps can be used directly as lookup keys.
//!
//! Entry layout, repeated in key order:
//!
//! ```text
//! ┌──────────┬──────────┬───────────┬───────────┐
//! │ Key Len  │ Key      │ Value Len │ Value     │
//! │ (2, BE)  │ (N)      │ (4, BE)   │ (M)       │
//! └──────────┴──────────┴───────────┴───────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An immutable, canonically-encoded map of named byte values
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ByteMap(Vec<u8>);

impl ByteMap {
    /// Build a map from name/value pairs; input order is irrelevant
    pub fn build<K, V, I>(entries: I) -> ByteMap
    where
        K: AsRef<str>,
        V: AsRef<[u8]>,
        I: IntoIterator<Item = (K, V)>,
    {
        let sorted: BTreeMap<String, Vec<u8>> = entries
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_vec()))
            .collect();

        let mut buf = Vec::new();
        for (k, v) in &sorted {
            buf.extend_from_slice(&(k.len() as u16).to_be_bytes());
            buf.extend_from_slice(k.as_bytes());
            buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
            buf.extend_from_slice(v);
        }
        ByteMap(buf)
    }

    /// Build a map of string values
    pub fn of_strings<I, K, V>(entries: I) -> ByteMap
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        ByteMap::build(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().as_bytes().to_vec())),
        )
    }

    /// Build a map of big-endian 64-bit float values
    pub fn of_floats<I, K>(entries: I) -> ByteMap
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, f64)>,
    {
        ByteMap::build(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_string(), v.to_be_bytes().to_vec())),
        )
    }

    /// Wrap raw canonical bytes without validation
    pub fn from_bytes(b: Vec<u8>) -> ByteMap {
        ByteMap(b)
    }

    /// The canonical encoded form
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the map, yielding its canonical bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up the value for a name
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.iter().find(|(k, _)| *k == name).map(|(_, v)| v)
    }

    /// Look up a value previously stored with [`ByteMap::of_floats`]
    pub fn get_float(&self, name: &str) -> Option<f64> {
        let v = self.get(name)?;
        let arr: [u8; 8] = v.try_into().ok()?;
        Some(f64::from_be_bytes(arr))
    }

    /// Look up a value previously stored with [`ByteMap::of_strings`]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Split off one entry, returning `(selected, remainder)`
    ///
    /// The selected map is empty when the name is absent. Both halves remain
    /// canonically encoded.
    pub fn split(&self, name: &str) -> (ByteMap, ByteMap) {
        let mut selected = Vec::new();
        let mut remainder = Vec::new();
        for (k, v, raw) in self.raw_entries() {
            let _ = v;
            if k == name {
                selected.extend_from_slice(raw);
            } else {
                remainder.extend_from_slice(raw);
            }
        }
        (ByteMap(selected), ByteMap(remainder))
    }

    /// Project onto a subset of names, preserving canonical encoding
    pub fn project(&self, names: &[String]) -> ByteMap {
        let mut buf = Vec::new();
        for (k, _, raw) in self.raw_entries() {
            if names.iter().any(|n| n == k) {
                buf.extend_from_slice(raw);
            }
        }
        ByteMap(buf)
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.raw_entries().map(|(k, v, _)| (k, v))
    }

    fn raw_entries(&self) -> RawEntries<'_> {
        RawEntries { buf: &self.0 }
    }
}

struct RawEntries<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for RawEntries<'a> {
    type Item = (&'a str, &'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < 2 {
            return None;
        }
        let key_len = u16::from_be_bytes(self.buf[..2].try_into().unwrap()) as usize;
        let val_start = 2 + key_len + 4;
        if self.buf.len() < val_start {
            return None;
        }
        let key = std::str::from_utf8(&self.buf[2..2 + key_len]).ok()?;
        let val_len =
            u32::from_be_bytes(self.buf[2 + key_len..val_start].try_into().unwrap()) as usize;
        if self.buf.len() < val_start + val_len {
            return None;
        }
        let val = &self.buf[val_start..val_start + val_len];
        let (raw, rest) = self.buf.split_at(val_start + val_len);
        self.buf = rest;
        Some((key, val, raw))
    }
}

impl fmt::Debug for ByteMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut m = f.debug_map();
        for (k, v) in self.iter() {
            match std::str::from_utf8(v) {
                Ok(s) => m.entry(&k, &s),
                Err(_) => m.entry(&k, &v),
            };
        }
        m.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_ordering() {
        let a = ByteMap::of_strings([("b", "2"), ("a", "1")]);
        let b = ByteMap::of_strings([("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_get() {
        let m = ByteMap::of_strings([("client", "acme"), ("country", "de")]);
        assert_eq!(m.get("client"), Some("acme".as_bytes()));
        assert_eq!(m.get_str("country"), Some("de"));
        assert_eq!(m.get("missing"), None);
    }

    #[test]
    fn test_float_values() {
        let m = ByteMap::of_floats([("requests", 10.5), ("errors", 2.0)]);
        assert_eq!(m.get_float("requests"), Some(10.5));
        assert_eq!(m.get_float("errors"), Some(2.0));
        assert_eq!(m.get_float("latency"), None);
    }

    #[test]
    fn test_split() {
        let m = ByteMap::of_strings([("a", "1"), ("_crosstab", "x"), ("z", "9")]);
        let (ct, rest) = m.split("_crosstab");
        assert_eq!(ct.get_str("_crosstab"), Some("x"));
        assert_eq!(ct.iter().count(), 1);
        assert_eq!(rest.get_str("a"), Some("1"));
        assert_eq!(rest.get_str("z"), Some("9"));
        assert!(rest.get("_crosstab").is_none());

        // Splitting an absent name leaves the remainder untouched
        let (none, rest) = m.split("nope");
        assert!(none.is_empty());
        assert_eq!(rest, m);
    }

    #[test]
    fn test_project() {
        let m = ByteMap::of_strings([("a", "1"), ("b", "2"), ("c", "3")]);
        let p = m.project(&["c".to_string(), "a".to_string()]);
        assert_eq!(p, ByteMap::of_strings([("a", "1"), ("c", "3")]));
    }

    #[test]
    fn test_iteration_order() {
        let m = ByteMap::of_strings([("z", "1"), ("a", "2"), ("m", "3")]);
        let keys: Vec<&str> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "m", "z"]);
    }
}
