//! Per-entity metadata store.
//!
//! Each entity owns one nested JSON record (counters and log bookkeeping) addressed by dotted
//! paths such as `"log.segment_count"`. Records are loaded lazily, mutated in memory, and
//! written back only for entities marked dirty.
//!
//! ## Contract
//!
//! - A mutation that stores a value different from the previous one marks the entity dirty.
//!   Storing an equal value, `null`, or returning [`Update::Unchanged`] is a no-op.
//! - `flush()` writes the full record of every dirty entity with `Directory::atomic_write`
//!   (temp file + rename), so a crash mid-flush leaves the previous snapshot intact.
//! - Keys this crate does not know about are preserved verbatim across load/flush.
//! - Structural errors (non-mapping path prefix, wrong kind, bad index) are returned, never
//!   swallowed, unless the caller supplied a default.

use crate::error::{StoreError, StoreResult};
use crate::layout::{self, EntityId};
use crate::storage::{Directory, DurableDirectory};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of an update function: keep the previous value or store a new one.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Leave the stored value alone.
    Unchanged,
    /// Store this value.
    Set(Value),
}

/// The record a new entity starts with.
pub fn default_record() -> Value {
    json!({
        "log": {
            "segment_count": 1,
            "segment_line_counts": [],
        },
        "temp": {
            "segment_count": 0,
        },
        "item_count": 0,
        "items_with_external_link_count": 0,
        "attachments_downloaded": 0,
        "requests_made": 0,
    })
}

/// Dotted-path resolution over nested JSON mappings.
mod keypath {
    use crate::error::{StoreError, StoreResult};
    use serde_json::map::Entry;
    use serde_json::{Map, Value};

    pub(super) fn kind(v: &Value) -> &'static str {
        match v {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "sequence",
            Value::Object(_) => "mapping",
        }
    }

    fn split(path: &str) -> StoreResult<Vec<&str>> {
        let parts: Vec<&str> = path.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(StoreError::PathType {
                path: path.to_string(),
                reason: "empty path segment".into(),
            });
        }
        Ok(parts)
    }

    fn not_a_mapping(path: &str, prefix: &[&str], found: &Value) -> StoreError {
        let at = if prefix.is_empty() {
            "<root>".to_string()
        } else {
            prefix.join(".")
        };
        StoreError::PathType {
            path: path.to_string(),
            reason: format!("`{at}` is a {}, not a mapping", kind(found)),
        }
    }

    /// Resolve `path`; `Ok(None)` if some key along it is absent.
    pub(super) fn get<'v>(root: &'v Value, path: &str) -> StoreResult<Option<&'v Value>> {
        let parts = split(path)?;
        let mut cur = root;
        for (depth, part) in parts.iter().enumerate() {
            let Value::Object(map) = cur else {
                return Err(not_a_mapping(path, &parts[..depth], cur));
            };
            match map.get(*part) {
                Some(v) => cur = v,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    /// Resolve the mapping that holds the last key of `path`.
    ///
    /// With `create`, absent intermediate mappings are created; otherwise `Ok(None)` is
    /// returned when one is absent.
    pub(super) fn parent_mut<'v, 'p>(
        root: &'v mut Value,
        path: &'p str,
        create: bool,
    ) -> StoreResult<Option<(&'v mut Map<String, Value>, &'p str)>> {
        let parts = split(path)?;
        let Some((last, prefix)) = parts.split_last() else {
            return Err(StoreError::PathType {
                path: path.to_string(),
                reason: "empty path".into(),
            });
        };
        let mut cur = root;
        for (depth, part) in prefix.iter().enumerate() {
            let map = match cur {
                Value::Object(map) => map,
                other => return Err(not_a_mapping(path, &parts[..depth], other)),
            };
            cur = match map.entry(*part) {
                Entry::Occupied(o) => o.into_mut(),
                Entry::Vacant(v) if create => v.insert(Value::Object(Map::new())),
                Entry::Vacant(_) => return Ok(None),
            };
        }
        match cur {
            Value::Object(map) => Ok(Some((map, *last))),
            other => Err(not_a_mapping(path, prefix, other)),
        }
    }
}

/// Store of per-entity metadata records.
///
/// Owns the loaded records and the dirty set; callers pass it by `&mut` to whatever needs
/// it. One writer per entity at a time (callers serialize runs per entity).
pub struct MetadataStore {
    dir: Arc<dyn Directory>,
    records: HashMap<EntityId, Value>,
    dirty: BTreeSet<EntityId>,
    durable_flush: bool,
}

impl MetadataStore {
    /// Create a store backed by `dir`.
    pub fn new(dir: impl Into<Arc<dyn Directory>>) -> Self {
        Self {
            dir: dir.into(),
            records: HashMap::new(),
            dirty: BTreeSet::new(),
            durable_flush: false,
        }
    }

    /// Use [`DurableDirectory::atomic_write_durable`] for snapshot writes.
    ///
    /// Requires a filesystem-backed directory; flushing fails with `NotSupported` otherwise.
    pub fn with_durable_flush(mut self, durable: bool) -> Self {
        self.durable_flush = durable;
        self
    }

    /// Load `id` into memory if it is not already loaded.
    ///
    /// Reads the on-disk snapshot if present; otherwise initializes [`default_record`] and
    /// marks the entity dirty so the defaults are persisted on the next flush.
    pub fn load(&mut self, id: &EntityId) -> StoreResult<()> {
        if self.records.contains_key(id) {
            return Ok(());
        }
        let path = layout::metadata_path(id);
        if self.dir.exists(&path) {
            let mut bytes = Vec::new();
            self.dir.open_file(&path)?.read_to_end(&mut bytes)?;
            let record: Value = serde_json::from_slice(&bytes)?;
            if !record.is_object() {
                return Err(StoreError::Format(format!(
                    "metadata snapshot for {id} is a {}, not a mapping",
                    keypath::kind(&record)
                )));
            }
            debug!(entity = %id, bytes = bytes.len(), "loaded metadata snapshot");
            self.records.insert(id.clone(), record);
        } else {
            debug!(entity = %id, "no metadata snapshot; using defaults");
            self.records.insert(id.clone(), default_record());
            self.dirty.insert(id.clone());
        }
        Ok(())
    }

    fn record(&mut self, id: &EntityId) -> StoreResult<&Value> {
        self.load(id)?;
        self.records
            .get(id)
            .ok_or_else(|| StoreError::NotFound(format!("metadata record for {id}")))
    }

    /// The whole record for `id`.
    pub fn get_record(&mut self, id: &EntityId) -> StoreResult<Value> {
        self.record(id).cloned()
    }

    /// The value at `path`. An absent key is a `PathType` error.
    pub fn get(&mut self, id: &EntityId, path: &str) -> StoreResult<Value> {
        match keypath::get(self.record(id)?, path)? {
            Some(v) => Ok(v.clone()),
            None => Err(StoreError::PathType {
                path: path.to_string(),
                reason: "key not found".into(),
            }),
        }
    }

    /// The value at `path`, or `default` if some key along it is absent.
    ///
    /// A path prefix that resolves to a non-mapping is still an error.
    pub fn get_or(&mut self, id: &EntityId, path: &str, default: Value) -> StoreResult<Value> {
        Ok(keypath::get(self.record(id)?, path)?
            .cloned()
            .unwrap_or(default))
    }

    /// Element `index` of the sequence at `path`.
    pub fn get_at(&mut self, id: &EntityId, path: &str, index: usize) -> StoreResult<Value> {
        let Some(v) = keypath::get(self.record(id)?, path)? else {
            return Err(StoreError::PathType {
                path: path.to_string(),
                reason: "key not found".into(),
            });
        };
        let Value::Array(items) = v else {
            return Err(StoreError::TypeKind {
                path: path.to_string(),
                expected: "sequence",
                actual: keypath::kind(v),
            });
        };
        items.get(index).cloned().ok_or_else(|| StoreError::Index {
            path: path.to_string(),
            index,
            len: items.len(),
        })
    }

    /// Element `index` of the sequence at `path`, or `default` when the key is absent, the
    /// value is not a sequence, the index is out of range, or the slot is a placeholder.
    pub fn get_at_or(
        &mut self,
        id: &EntityId,
        path: &str,
        index: usize,
        default: Value,
    ) -> StoreResult<Value> {
        let found = keypath::get(self.record(id)?, path)?
            .and_then(Value::as_array)
            .and_then(|items| items.get(index))
            .filter(|v| !v.is_null());
        Ok(found.cloned().unwrap_or(default))
    }

    /// Unsigned counter at `path`, or `default` when absent.
    pub fn get_u64_or(&mut self, id: &EntityId, path: &str, default: u64) -> StoreResult<u64> {
        match self.get_or(id, path, Value::Null)? {
            Value::Null => Ok(default),
            v => v.as_u64().ok_or_else(|| StoreError::TypeKind {
                path: path.to_string(),
                expected: "unsigned integer",
                actual: keypath::kind(&v),
            }),
        }
    }

    /// Unsigned element `index` of the sequence at `path`, or `default` when absent.
    pub fn get_u64_at_or(
        &mut self,
        id: &EntityId,
        path: &str,
        index: usize,
        default: u64,
    ) -> StoreResult<u64> {
        match self.get_at_or(id, path, index, Value::Null)? {
            Value::Null => Ok(default),
            v => v.as_u64().ok_or_else(|| StoreError::TypeKind {
                path: path.to_string(),
                expected: "unsigned integer",
                actual: keypath::kind(&v),
            }),
        }
    }

    /// Store `value` at `path`, creating intermediate mappings. Returns whether anything
    /// changed.
    pub fn set(&mut self, id: &EntityId, path: &str, value: Value) -> StoreResult<bool> {
        self.update(id, path, |_| Update::Set(value))
    }

    /// Compute a new value at `path` from the previous one (`None` if absent).
    pub fn update<F>(&mut self, id: &EntityId, path: &str, f: F) -> StoreResult<bool>
    where
        F: FnOnce(Option<&Value>) -> Update,
    {
        self.load(id)?;
        let changed = {
            let Some(record) = self.records.get_mut(id) else {
                return Err(StoreError::NotFound(format!("metadata record for {id}")));
            };
            let Some((map, key)) = keypath::parent_mut(record, path, true)? else {
                return Err(StoreError::PathType {
                    path: path.to_string(),
                    reason: "could not create intermediate mapping".into(),
                });
            };
            match f(map.get(key)) {
                Update::Unchanged => false,
                Update::Set(v) if v.is_null() || map.get(key) == Some(&v) => false,
                Update::Set(v) => {
                    map.insert(key.to_string(), v);
                    true
                }
            }
        };
        if changed {
            self.dirty.insert(id.clone());
        }
        Ok(changed)
    }

    /// Store `value` at element `index` of the sequence at `path`.
    ///
    /// A shorter (or absent) sequence is extended with `null` placeholders up to `index`.
    pub fn set_at(
        &mut self,
        id: &EntityId,
        path: &str,
        index: usize,
        value: Value,
    ) -> StoreResult<bool> {
        self.update_at(id, path, index, |_| Update::Set(value))
    }

    /// Compute element `index` of the sequence at `path` from its previous value (`None` if
    /// absent or a placeholder).
    pub fn update_at<F>(
        &mut self,
        id: &EntityId,
        path: &str,
        index: usize,
        f: F,
    ) -> StoreResult<bool>
    where
        F: FnOnce(Option<&Value>) -> Update,
    {
        self.load(id)?;
        let changed = {
            let Some(record) = self.records.get_mut(id) else {
                return Err(StoreError::NotFound(format!("metadata record for {id}")));
            };
            let Some((map, key)) = keypath::parent_mut(record, path, true)? else {
                return Err(StoreError::PathType {
                    path: path.to_string(),
                    reason: "could not create intermediate mapping".into(),
                });
            };
            match map.get_mut(key) {
                Some(Value::Array(items)) => apply_at(items, index, f),
                Some(other) => {
                    return Err(StoreError::TypeKind {
                        path: path.to_string(),
                        expected: "sequence",
                        actual: keypath::kind(other),
                    })
                }
                None => {
                    let mut items = Vec::new();
                    let changed = apply_at(&mut items, index, f);
                    if changed {
                        map.insert(key.to_string(), Value::Array(items));
                    }
                    changed
                }
            }
        };
        if changed {
            self.dirty.insert(id.clone());
        }
        Ok(changed)
    }

    /// Remove the value at `path`. Returns whether something was removed.
    pub fn delete(&mut self, id: &EntityId, path: &str) -> StoreResult<bool> {
        self.load(id)?;
        let removed = match self.records.get_mut(id) {
            Some(record) => match keypath::parent_mut(record, path, false)? {
                Some((map, key)) => map.remove(key).is_some(),
                None => false,
            },
            None => false,
        };
        if removed {
            self.dirty.insert(id.clone());
        }
        Ok(removed)
    }

    /// Drop the in-memory record for `id` (and its dirty mark) without touching disk.
    ///
    /// The next access reloads the on-disk snapshot.
    pub fn evict(&mut self, id: &EntityId) -> bool {
        self.dirty.remove(id);
        self.records.remove(id).is_some()
    }

    /// Whether `id` has unflushed changes.
    pub fn is_dirty(&self, id: &EntityId) -> bool {
        self.dirty.contains(id)
    }

    /// Entities currently loaded in memory.
    pub fn loaded_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.records.keys()
    }

    /// Write the record of every dirty entity. Returns how many snapshots were written.
    ///
    /// On error the failing entity (and any not yet reached) stays dirty.
    pub fn flush(&mut self) -> StoreResult<usize> {
        let pending: Vec<EntityId> = self.dirty.iter().cloned().collect();
        let mut written = 0usize;
        for id in pending {
            let Some(record) = self.records.get(&id) else {
                self.dirty.remove(&id);
                continue;
            };
            let bytes = serde_json::to_vec_pretty(record)?;
            let path = layout::metadata_path(&id);
            if self.durable_flush {
                self.dir.atomic_write_durable(&path, &bytes)?;
            } else {
                self.dir.atomic_write(&path, &bytes)?;
            }
            self.dirty.remove(&id);
            written += 1;
            debug!(entity = %id, bytes = bytes.len(), "flushed metadata snapshot");
        }
        if written > 0 {
            info!(snapshots = written, "metadata flushed");
        }
        Ok(written)
    }
}

fn apply_at<F>(items: &mut Vec<Value>, index: usize, f: F) -> bool
where
    F: FnOnce(Option<&Value>) -> Update,
{
    let update = f(items.get(index).filter(|v| !v.is_null()));
    match update {
        Update::Unchanged => false,
        Update::Set(v) if v.is_null() || items.get(index) == Some(&v) => false,
        Update::Set(v) => {
            if items.len() <= index {
                items.resize(index + 1, Value::Null);
            }
            items[index] = v;
            true
        }
    }
}

/// Add `delta` to an unsigned counter, treating an absent value as zero.
pub fn add_u64(delta: u64) -> impl FnOnce(Option<&Value>) -> Update {
    move |prev| {
        if delta == 0 {
            return Update::Unchanged;
        }
        let base = prev.and_then(Value::as_u64).unwrap_or(0);
        Update::Set(Value::from(base.saturating_add(delta)))
    }
}
