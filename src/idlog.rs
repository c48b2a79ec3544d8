//! Rotating identifier log.
//!
//! Records processed item IDs per entity across capacity-bounded segment files, plus a
//! temp buffer of staged batches that are later consolidated into the main log.
//!
//! ## Public invariants
//!
//! - Segments are numbered `1..=log.segment_count`; segment 1 is oldest. Within a segment,
//!   earlier lines are older.
//! - `log.segment_line_counts[k - 1]` is the exact number of lines in segment `k`. It is
//!   authoritative: normal operation never re-scans files to count lines. Only
//!   [`IdLog::repair`] recounts.
//! - Every segment below the head holds exactly `capacity` lines (for the capacity it was
//!   written with); the head holds `0..=capacity`.
//! - The temp buffer is either absent or fully drained and deleted by a consolidation.
//!
//! The log performs no dedup on append; callers de-duplicate. Loads skip exact repeats as a
//! guard against accidental double writes.

use crate::error::{StoreError, StoreResult};
use crate::layout::{self, keys, Capacity, EntityId, LoadLimit};
use crate::metadata::{MetadataStore, Update};
use crate::revlines::{ReverseLines, DEFAULT_BLOCK_BYTES};
use crate::storage::Directory;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of [`IdLog::consolidate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConsolidateReport {
    /// Temp batches drained into the main log.
    pub batches: usize,
    /// IDs appended to the main log.
    pub ids: usize,
}

/// Outcome of [`IdLog::repair`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RepairReport {
    /// Segment files found (and now numbered `1..=segments`).
    pub segments: usize,
    /// Segment files that had to be renumbered to close gaps.
    pub renumbered: usize,
    /// Recounted line count per segment.
    pub line_counts: Vec<u64>,
}

/// Identifier log store over a [`Directory`].
///
/// Bookkeeping lives in the entity's metadata record, so every operation takes the
/// [`MetadataStore`]. Callers flush the metadata store to persist it.
pub struct IdLog {
    dir: Arc<dyn Directory>,
    read_block_bytes: usize,
}

impl IdLog {
    /// Create a log store over `dir`.
    pub fn new(dir: impl Into<Arc<dyn Directory>>) -> Self {
        Self {
            dir: dir.into(),
            read_block_bytes: DEFAULT_BLOCK_BYTES,
        }
    }

    /// Block size for newest-first reads (clamped by [`ReverseLines`]).
    pub fn with_read_block_bytes(mut self, bytes: usize) -> Self {
        self.read_block_bytes = bytes;
        self
    }

    /// The backing directory.
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.dir
    }

    /// Append `ids` (oldest first) to the entity's log.
    ///
    /// Fills the head segment up to `capacity` lines (default 5000, clamped to
    /// `[1000, 10000]`), then rotates into new segments for the remainder. Returns the
    /// number of IDs written.
    ///
    /// Counts are updated only after a segment write succeeds. A write that fails partway
    /// leaves uncounted lines behind; see [`IdLog::repair`].
    pub fn append<S: AsRef<str>>(
        &self,
        meta: &mut MetadataStore,
        entity: &EntityId,
        ids: &[S],
        capacity: Option<usize>,
    ) -> StoreResult<usize> {
        for id in ids {
            layout::validate_item_id(id.as_ref())?;
        }
        if ids.is_empty() {
            return Ok(0);
        }
        let capacity = Capacity::from_hint(capacity).get() as u64;
        let mut segment = meta.get_u64_or(entity, keys::LOG_SEGMENT_COUNT, 1)?.max(1);
        let mut rest = ids;

        loop {
            let index = segment_index(segment)?;
            let lines = meta.get_u64_at_or(entity, keys::LOG_SEGMENT_LINE_COUNTS, index, 0)?;
            let room = usize::try_from(capacity.saturating_sub(lines)).unwrap_or(usize::MAX);
            let take = room.min(rest.len());
            if take > 0 {
                self.write_lines(&layout::segment_path(entity, segment), &rest[..take])?;
            }
            meta.update_at(entity, keys::LOG_SEGMENT_LINE_COUNTS, index, |prev| {
                let before = prev.and_then(Value::as_u64).unwrap_or(0);
                Update::Set(json!(before + take as u64))
            })?;
            debug!(entity = %entity, segment, lines = lines + take as u64, "appended ids");

            rest = &rest[take..];
            if rest.is_empty() {
                break;
            }
            segment += 1;
            meta.set(entity, keys::LOG_SEGMENT_COUNT, json!(segment))?;
            info!(entity = %entity, segment, capacity, "rotated to new log segment");
        }
        Ok(ids.len())
    }

    /// Durably record a batch in the temp buffer, verbatim. Returns the batch number.
    pub fn stage<S: AsRef<str>>(
        &self,
        meta: &mut MetadataStore,
        entity: &EntityId,
        ids: &[S],
    ) -> StoreResult<u64> {
        for id in ids {
            layout::validate_item_id(id.as_ref())?;
        }
        // Batches written before a crash may be on disk without having been counted.
        let recorded = meta.get_u64_or(entity, keys::TEMP_SEGMENT_COUNT, 0)?;
        let batch = recorded.max(self.highest_temp_batch(entity)?) + 1;

        self.dir
            .atomic_write(&layout::temp_path(entity, batch), &encode_lines(ids))?;
        meta.set(entity, keys::TEMP_SEGMENT_COUNT, json!(batch))?;
        debug!(entity = %entity, batch, ids = ids.len(), "staged batch");
        Ok(batch)
    }

    /// Drain the temp buffer into the main log, most recently staged batch first, then
    /// delete it. A missing temp buffer is a no-op.
    ///
    /// Each batch is recorded in `temp.drained_batches` as soon as it is appended and its
    /// file is removed right after, so a retry after a failed pass appends only what is left.
    pub fn consolidate(
        &self,
        meta: &mut MetadataStore,
        entity: &EntityId,
        capacity: Option<usize>,
    ) -> StoreResult<ConsolidateReport> {
        let recorded = meta.get_u64_or(entity, keys::TEMP_SEGMENT_COUNT, 0)?;
        let highest = recorded.max(self.highest_temp_batch(entity)?);
        let temp_dir = layout::temp_dir(entity);
        if highest == 0 && !self.dir.exists(&temp_dir) {
            return Ok(ConsolidateReport::default());
        }
        let drained: HashSet<u64> = meta
            .get_or(entity, keys::TEMP_DRAINED_BATCHES, json!([]))?
            .as_array()
            .map(|xs| xs.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();

        let mut report = ConsolidateReport::default();
        for batch in (1..=highest).rev() {
            let path = layout::temp_path(entity, batch);
            let exists = self.dir.exists(&path);
            if drained.contains(&batch) {
                if exists {
                    self.dir.delete(&path)?;
                    debug!(entity = %entity, batch, "removed already drained batch");
                }
                continue;
            }
            if !exists {
                warn!(entity = %entity, batch, "staged batch missing; skipping");
                continue;
            }
            let ids = self.read_lines(&path)?;
            report.ids += self.append(meta, entity, &ids, capacity)?;
            report.batches += 1;
            meta.update(entity, keys::TEMP_DRAINED_BATCHES, |prev| {
                let mut done = prev.and_then(Value::as_array).cloned().unwrap_or_default();
                done.push(json!(batch));
                Update::Set(Value::Array(done))
            })?;
            self.dir.delete(&path)?;
        }

        self.dir.delete(&temp_dir)?;
        meta.delete(entity, keys::TEMP)?;
        info!(
            entity = %entity,
            batches = report.batches,
            ids = report.ids,
            "consolidated temp buffer"
        );
        Ok(report)
    }

    /// Up to `limit` IDs, newest first, starting at `from_segment` (default: the head).
    ///
    /// `limit` is [normalized](LoadLimit::normalized) first. Exact repeats are skipped. A missing segment 1 means empty history; any other
    /// missing segment is a [`StoreError::LogIntegrity`] error.
    pub fn load(
        &self,
        meta: &mut MetadataStore,
        entity: &EntityId,
        limit: LoadLimit,
        from_segment: Option<u64>,
    ) -> StoreResult<Vec<String>> {
        let limit = limit.normalized();
        let mut segment = match from_segment {
            Some(s) => s,
            None => meta.get_u64_or(entity, keys::LOG_SEGMENT_COUNT, 1)?,
        };
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        while segment >= 1 && !limit.is_reached(out.len()) {
            let path = layout::segment_path(entity, segment);
            if !self.dir.exists(&path) {
                if segment > 1 {
                    return Err(StoreError::LogIntegrity {
                        entity: entity.to_string(),
                        segment,
                    });
                }
                break;
            }
            let reader = self.dir.open_file(&path)?;
            for line in ReverseLines::with_block_size(reader, self.read_block_bytes)? {
                if limit.is_reached(out.len()) {
                    break;
                }
                let line = line?;
                if seen.insert(line.clone()) {
                    out.push(line);
                }
            }
            segment -= 1;
        }
        debug!(entity = %entity, ids = out.len(), "loaded known ids");
        Ok(out)
    }

    /// Number of the head segment.
    pub fn segment_count(&self, meta: &mut MetadataStore, entity: &EntityId) -> StoreResult<u64> {
        meta.get_u64_or(entity, keys::LOG_SEGMENT_COUNT, 1)
    }

    /// Total IDs recorded, from bookkeeping (no file scan).
    pub fn len(&self, meta: &mut MetadataStore, entity: &EntityId) -> StoreResult<u64> {
        let counts = meta.get_or(entity, keys::LOG_SEGMENT_LINE_COUNTS, json!([]))?;
        Ok(counts
            .as_array()
            .map(|xs| xs.iter().filter_map(Value::as_u64).sum())
            .unwrap_or(0))
    }

    /// Whether nothing has been recorded for `entity`.
    pub fn is_empty(&self, meta: &mut MetadataStore, entity: &EntityId) -> StoreResult<bool> {
        Ok(self.len(meta, entity)? == 0)
    }

    /// Rebuild bookkeeping from the segment files on disk.
    ///
    /// Renumbers segments to close gaps (keeping their order), recounts every segment, and
    /// rewrites `log.segment_count` / `log.segment_line_counts`.
    ///
    /// This is also the way back after a failed or interrupted append: a write that errors
    /// partway can leave lines in the head segment that bookkeeping never counted, and the
    /// next append writes after them. Loads stay correct (they read files, not counts), but
    /// `len` and rotation run on the recorded counts until a repair recounts them.
    pub fn repair(&self, meta: &mut MetadataStore, entity: &EntityId) -> StoreResult<RepairReport> {
        let mut found: Vec<u64> = self
            .dir
            .list_dir(&layout::log_dir(entity))?
            .iter()
            .filter_map(|name| layout::parse_numbered(name))
            .collect();
        found.sort_unstable();

        let mut report = RepairReport::default();
        for (i, &segment) in found.iter().enumerate() {
            // Targets never exceed their source and lower slots are already settled.
            let target = i as u64 + 1;
            if segment != target {
                self.dir.atomic_rename(
                    &layout::segment_path(entity, segment),
                    &layout::segment_path(entity, target),
                )?;
                warn!(entity = %entity, from = segment, to = target, "renumbered log segment");
                report.renumbered += 1;
            }
            let lines = self.read_lines(&layout::segment_path(entity, target))?;
            report.line_counts.push(lines.len() as u64);
        }
        report.segments = found.len();

        let head = found.len().max(1) as u64;
        meta.set(entity, keys::LOG_SEGMENT_COUNT, json!(head))?;
        meta.set(
            entity,
            keys::LOG_SEGMENT_LINE_COUNTS,
            json!(report.line_counts),
        )?;
        info!(
            entity = %entity,
            segments = report.segments,
            renumbered = report.renumbered,
            "repaired identifier log"
        );
        Ok(report)
    }

    fn highest_temp_batch(&self, entity: &EntityId) -> StoreResult<u64> {
        Ok(self
            .dir
            .list_dir(&layout::temp_dir(entity))?
            .iter()
            .filter_map(|name| layout::parse_numbered(name))
            .max()
            .unwrap_or(0))
    }

    fn write_lines<S: AsRef<str>>(&self, path: &str, ids: &[S]) -> StoreResult<()> {
        let mut w = self.dir.append_file(path)?;
        w.write_all(&encode_lines(ids))?;
        w.flush()?;
        Ok(())
    }

    /// All non-blank lines of `path`, trimmed, in file order.
    fn read_lines(&self, path: &str) -> StoreResult<Vec<String>> {
        let mut text = String::new();
        self.dir.open_file(path)?.read_to_string(&mut text)?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn encode_lines<S: AsRef<str>>(ids: &[S]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ids.iter().map(|s| s.as_ref().len() + 1).sum());
    for id in ids {
        buf.extend_from_slice(id.as_ref().as_bytes());
        buf.push(b'\n');
    }
    buf
}

fn segment_index(segment: u64) -> StoreResult<usize> {
    usize::try_from(segment - 1)
        .map_err(|_| StoreError::Format(format!("segment number {segment} overflows usize")))
}
