//! Data model (spec §3): `SegmentEntry`, `CacheEntry`, and the catalog
//! record shape persisted to `catalog.json`.

use std::fmt;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, globally unique identifier of a Usenet segment.
///
/// Printable ASCII, at most 250 bytes per spec §3. Wrapped rather than
/// passed around as a bare `String` so the catalog key, the coalescer
/// key, and the `.seg` filename digest input are all the same type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for MessageId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Immutable per-file segment layout, built once per file open from file
/// metadata (spec §3).
///
/// Invariant (checked by [`validate_entries`]): entries are sorted by
/// `file_start`, contiguous (`entries[i].file_end == entries[i+1].file_start`),
/// start at 0, and end at the file size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub message_id: MessageId,
    pub file_start: u64,
    pub file_end: u64,
    /// Opaque, carried only for error messages (spec §3).
    pub groups: Vec<String>,
}

impl SegmentEntry {
    pub fn len(&self) -> u64 {
        self.file_end - self.file_start
    }

    pub fn is_empty(&self) -> bool {
        self.file_end == self.file_start
    }
}

/// Validates the §3 layout invariant for a file's segment list.
pub fn validate_entries(entries: &[SegmentEntry], file_size: u64) -> Result<(), String> {
    if entries.is_empty() {
        return if file_size == 0 {
            Ok(())
        } else {
            Err(format!(
                "empty segment list for non-empty file (size {file_size})"
            ))
        };
    }
    if entries[0].file_start != 0 {
        return Err(format!(
            "first segment starts at {}, expected 0",
            entries[0].file_start
        ));
    }
    for w in entries.windows(2) {
        if w[0].file_end != w[1].file_start {
            return Err(format!(
                "gap or overlap between segments ending at {} and starting at {}",
                w[0].file_end, w[1].file_start
            ));
        }
    }
    let last = entries.last().unwrap();
    if last.file_end != file_size {
        return Err(format!(
            "last segment ends at {}, expected file size {}",
            last.file_end, file_size
        ));
    }
    Ok(())
}

/// Mutable per-stored-segment bookkeeping (spec §3).
///
/// `seq` is the LRU tie-breaker (spec §9 open question): a monotonically
/// increasing insertion counter, consulted only when two entries share a
/// `last_access` at sub-second-equal wall-clock resolution. It is process-
/// local bookkeeping, not part of the on-disk catalog: spec.md §6 declares
/// `catalog.json`'s per-entry shape (`data_path`, `size`, `last_access`,
/// `created`) bit-exact across implementations, so `seq` is skipped on
/// both sides of serialization. `Store::startup` reassigns it from
/// catalog iteration order after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data_path: std::path::PathBuf,
    pub size: u64,
    pub last_access: DateTime<Utc>,
    pub created: DateTime<Utc>,
    #[serde(skip)]
    pub seq: u64,
}

/// On-disk shape of `catalog.json`: `{ "<messageID>": CacheEntry, ... }`.
pub type Catalog = std::collections::HashMap<MessageId, CacheEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, start: u64, end: u64) -> SegmentEntry {
        SegmentEntry {
            message_id: MessageId::new(id),
            file_start: start,
            file_end: end,
            groups: vec![],
        }
    }

    #[test]
    fn validates_contiguous_layout() {
        let entries = vec![entry("a", 0, 1000), entry("b", 1000, 2000), entry("c", 2000, 2500)];
        assert!(validate_entries(&entries, 2500).is_ok());
    }

    #[test]
    fn rejects_gap() {
        let entries = vec![entry("a", 0, 1000), entry("b", 1100, 2000)];
        assert!(validate_entries(&entries, 2000).is_err());
    }

    #[test]
    fn rejects_wrong_file_size() {
        let entries = vec![entry("a", 0, 1000)];
        assert!(validate_entries(&entries, 2000).is_err());
    }

    #[test]
    fn empty_file_has_no_segments() {
        assert!(validate_entries(&[], 0).is_ok());
    }
}
