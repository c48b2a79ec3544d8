//! On-disk layout, limits, and the entity ID type.
//!
//! ## Public invariants (must not change without a migration)
//!
//! All per-entity state lives under `<entity>/`:
//!
//! - `<entity>/metadata.json`: the metadata snapshot.
//! - `<entity>/known_items/<n>.txt`: identifier log segment `n` (1-based), newline-delimited.
//! - `<entity>/known_items/temp/<n>.txt`: temp buffer batch `n` (1-based), write-once.
//! - `<entity>/external_links.txt`: `item_id<TAB>url` lines, append-only.
//!
//! Attachment output goes to a caller-supplied directory, never under these paths.

use crate::error::{StoreError, StoreResult};
use std::fmt;

/// Default maximum lines per log segment.
pub const DEFAULT_SEGMENT_CAPACITY: usize = 5000;
/// Smallest segment capacity a caller may request.
pub const MIN_SEGMENT_CAPACITY: usize = 1000;
/// Largest segment capacity a caller may request.
pub const MAX_SEGMENT_CAPACITY: usize = 10_000;

/// Default number of newest IDs loaded per query.
pub const DEFAULT_LOAD_LIMIT: usize = 3000;
/// Cap for bounded loads; larger requests are clamped to it.
pub const MAX_LOAD_LIMIT: usize = 10_000;

/// Metadata keys used by the log store and the sync engine.
pub mod keys {
    /// Number of the head segment.
    pub const LOG_SEGMENT_COUNT: &str = "log.segment_count";
    /// Per-segment line counts, index = segment number - 1.
    pub const LOG_SEGMENT_LINE_COUNTS: &str = "log.segment_line_counts";
    /// The whole temp buffer sub-record.
    pub const TEMP: &str = "temp";
    /// Number of staged temp batches.
    pub const TEMP_SEGMENT_COUNT: &str = "temp.segment_count";
    /// Batches already appended by an unfinished consolidation.
    pub const TEMP_DRAINED_BATCHES: &str = "temp.drained_batches";
    /// Items processed across all runs.
    pub const ITEM_COUNT: &str = "item_count";
    /// Items that link outward.
    pub const ITEMS_WITH_EXTERNAL_LINK_COUNT: &str = "items_with_external_link_count";
    /// Attachments downloaded across all runs.
    pub const ATTACHMENTS_DOWNLOADED: &str = "attachments_downloaded";
    /// Remote requests made across all runs.
    pub const REQUESTS_MADE: &str = "requests_made";
}

const MAX_ENTITY_ID_LEN: usize = 128;

/// Identifier of the account whose history is tracked.
///
/// The ID names the entity's state directory, so it is restricted to a path-safe alphabet:
/// ASCII alphanumerics plus `-_.()[] `, not `.` or `..`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(String);

impl EntityId {
    /// Validate and wrap an entity ID.
    pub fn new(id: impl Into<String>) -> StoreResult<Self> {
        let id = id.into();
        let allowed = |c: char| c.is_ascii_alphanumeric() || "-_.()[] ".contains(c);
        if id.is_empty()
            || id.len() > MAX_ENTITY_ID_LEN
            || id == "."
            || id == ".."
            || id.trim() != id
            || !id.chars().all(allowed)
        {
            return Err(StoreError::InvalidEntity(id));
        }
        Ok(Self(id))
    }

    /// The raw ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for EntityId {
    type Error = StoreError;

    fn try_from(value: &str) -> StoreResult<Self> {
        Self::new(value)
    }
}

/// Maximum lines per segment, clamped to
/// [`MIN_SEGMENT_CAPACITY`, `MAX_SEGMENT_CAPACITY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity(usize);

impl Capacity {
    /// Clamp a requested capacity into the allowed range.
    pub fn clamped(requested: usize) -> Self {
        Self(requested.clamp(MIN_SEGMENT_CAPACITY, MAX_SEGMENT_CAPACITY))
    }

    /// Resolve an optional hint, falling back to [`DEFAULT_SEGMENT_CAPACITY`].
    pub fn from_hint(hint: Option<usize>) -> Self {
        Self::clamped(hint.unwrap_or(DEFAULT_SEGMENT_CAPACITY))
    }

    /// Lines per segment.
    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self(DEFAULT_SEGMENT_CAPACITY)
    }
}

/// How many IDs a newest-first load may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadLimit {
    /// The entire history.
    All,
    /// At most this many IDs. Loads treat `0` as [`LoadLimit::All`] and cap anything above
    /// [`MAX_LOAD_LIMIT`]; see [`LoadLimit::normalized`].
    AtMost(usize),
}

impl LoadLimit {
    /// Interpret a signed limit: `<= 0` means everything, larger than
    /// [`MAX_LOAD_LIMIT`] is clamped to it.
    pub fn from_raw(limit: i64) -> Self {
        if limit <= 0 {
            return Self::All;
        }
        let n = usize::try_from(limit).unwrap_or(MAX_LOAD_LIMIT);
        Self::AtMost(n.min(MAX_LOAD_LIMIT))
    }

    /// The limit a load actually applies: `AtMost(0)` is `All`, larger than
    /// [`MAX_LOAD_LIMIT`] is clamped to it.
    pub fn normalized(self) -> Self {
        match self {
            Self::AtMost(0) => Self::All,
            Self::AtMost(n) => Self::AtMost(n.min(MAX_LOAD_LIMIT)),
            Self::All => Self::All,
        }
    }

    pub(crate) fn is_reached(self, collected: usize) -> bool {
        match self {
            Self::All => false,
            Self::AtMost(n) => collected >= n,
        }
    }
}

impl Default for LoadLimit {
    fn default() -> Self {
        Self::AtMost(DEFAULT_LOAD_LIMIT)
    }
}

/// `<entity>/metadata.json`
pub fn metadata_path(entity: &EntityId) -> String {
    format!("{entity}/metadata.json")
}

/// `<entity>/known_items`
pub fn log_dir(entity: &EntityId) -> String {
    format!("{entity}/known_items")
}

/// `<entity>/known_items/<segment>.txt`
pub fn segment_path(entity: &EntityId, segment: u64) -> String {
    format!("{entity}/known_items/{segment}.txt")
}

/// `<entity>/known_items/temp`
pub fn temp_dir(entity: &EntityId) -> String {
    format!("{entity}/known_items/temp")
}

/// `<entity>/known_items/temp/<batch>.txt`
pub fn temp_path(entity: &EntityId, batch: u64) -> String {
    format!("{entity}/known_items/temp/{batch}.txt")
}

/// `<entity>/external_links.txt`
pub fn external_links_path(entity: &EntityId) -> String {
    format!("{entity}/external_links.txt")
}

/// Parse a numbered file name (`<n>.txt`) as written by the log store.
pub(crate) fn parse_numbered(name: &str) -> Option<u64> {
    let n = name.strip_suffix(".txt")?.parse::<u64>().ok()?;
    (n >= 1).then_some(n)
}

/// Item IDs are stored one per line and read back trimmed, so they must be non-empty,
/// free of line breaks, and free of surrounding whitespace.
pub(crate) fn validate_item_id(id: &str) -> StoreResult<()> {
    if id.is_empty() || id.trim() != id || id.contains(['\n', '\r']) {
        return Err(StoreError::InvalidItemId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ids_must_be_path_safe() {
        assert!(EntityId::new("1234567890").is_ok());
        assert!(EntityId::new("user_(alt) [2]").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", " padded", "tab\there", "ü"] {
            assert!(EntityId::new(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(EntityId::new("x".repeat(129)).is_err());
    }

    #[test]
    fn capacity_is_clamped() {
        assert_eq!(Capacity::from_hint(None).get(), 5000);
        assert_eq!(Capacity::from_hint(Some(1)).get(), 1000);
        assert_eq!(Capacity::from_hint(Some(2500)).get(), 2500);
        assert_eq!(Capacity::from_hint(Some(1_000_000)).get(), 10_000);
    }

    #[test]
    fn load_limit_interprets_raw_values() {
        assert_eq!(LoadLimit::from_raw(0), LoadLimit::All);
        assert_eq!(LoadLimit::from_raw(-5), LoadLimit::All);
        assert_eq!(LoadLimit::from_raw(1500), LoadLimit::AtMost(1500));
        assert_eq!(LoadLimit::from_raw(20_000), LoadLimit::AtMost(10_000));
        assert_eq!(LoadLimit::default(), LoadLimit::AtMost(3000));
    }

    #[test]
    fn unchecked_limits_normalize_like_raw_ones() {
        assert_eq!(LoadLimit::AtMost(0).normalized(), LoadLimit::All);
        assert_eq!(LoadLimit::AtMost(50_000).normalized(), LoadLimit::AtMost(10_000));
        assert_eq!(LoadLimit::AtMost(7).normalized(), LoadLimit::AtMost(7));
        assert_eq!(LoadLimit::All.normalized(), LoadLimit::All);
    }

    #[test]
    fn numbered_names() {
        assert_eq!(parse_numbered("12.txt"), Some(12));
        assert_eq!(parse_numbered("0.txt"), None);
        assert_eq!(parse_numbered("1.txt.tmp"), None);
        assert_eq!(parse_numbered("temp"), None);
    }

    #[test]
    fn item_ids_must_round_trip_as_lines() {
        assert!(validate_item_id("1604012345678").is_ok());
        for bad in ["", " 1", "1 ", "a\nb", "a\rb"] {
            assert!(validate_item_id(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
