//! Call metadata and trailers.
//!
//! Keys are lowercase ASCII. Each key maps to an ordered list of values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Service names the caller declared as dependencies.
pub const SERVICE_DEPS: &str = "tether-servicedeps";
/// Software features the caller depends on.
pub const SOFTWARE_DEPS: &str = "tether-softwaredeps";
/// Present (value "1") when `SOFTWARE_DEPS` was sent, even if empty.
pub const HAS_SOFTWARE_DEPS: &str = "tether-hassoftwaredeps";
pub const LABELS: &str = "tether-labels";

/// Trailer: JSON timing log of the call.
pub const TIMING: &str = "tether-timing";
/// Trailer: server-side path of the call's output directory.
pub const OUTDIR: &str = "tether-outdir";
/// Trailer: last log sequence number emitted when the call ended.
pub const LAST_LOG_SEQ: &str = "tether-lastlogseq";

pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Vec<String>>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all values of `key`.
    pub fn insert(&mut self, key: &str, values: Vec<String>) {
        debug_assert!(is_valid_key(key), "invalid metadata key {key:?}");
        self.0.insert(key.to_string(), values);
    }

    pub fn insert_one(&mut self, key: &str, value: impl Into<String>) {
        self.insert(key, vec![value.into()]);
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}
