//! Store configuration loaded from defaults and environment variables.

use crate::error::{StoreError, StoreResult};
use crate::idlog::IdLog;
use crate::layout::{Capacity, LoadLimit, DEFAULT_LOAD_LIMIT};
use crate::metadata::MetadataStore;
use crate::storage::{Directory, FsDirectory};
use crate::sync::{CommitStrategy, SyncOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration shared by the stores and the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding every entity's state.
    pub root: PathBuf,
    /// Lines per log segment; clamped to `[1000, 10000]`.
    pub segment_capacity: usize,
    /// Newest known IDs checked per run; `0` means the whole history.
    pub known_limit: usize,
    pub commit: CommitStrategy,
    /// fsync metadata snapshots and their directory on flush.
    pub durable_flush: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("seenlog-data"),
            segment_capacity: Capacity::default().get(),
            known_limit: DEFAULT_LOAD_LIMIT,
            commit: CommitStrategy::default(),
            durable_flush: false,
        }
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    ///
    /// All optional:
    /// - `SEENLOG_ROOT`: state directory (default: `seenlog-data`)
    /// - `SEENLOG_SEGMENT_CAPACITY`: lines per segment (default: 5000, clamped)
    /// - `SEENLOG_KNOWN_LIMIT`: known IDs loaded per run (default: 3000, `0` = all)
    /// - `SEENLOG_COMMIT`: `append` or `stage` (default: `append`)
    /// - `SEENLOG_DURABLE_FLUSH`: `1`/`true`/`yes` or `0`/`false`/`no` (default: off)
    pub fn from_env() -> StoreResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`StoreConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StoreResult<Self> {
        let mut cfg = Self::default();
        if let Some(root) = lookup("SEENLOG_ROOT").filter(|v| !v.trim().is_empty()) {
            cfg.root = PathBuf::from(root);
        }
        if let Some(raw) = lookup("SEENLOG_SEGMENT_CAPACITY") {
            let requested = parse_number("SEENLOG_SEGMENT_CAPACITY", &raw)?;
            cfg.segment_capacity = Capacity::clamped(requested).get();
        }
        if let Some(raw) = lookup("SEENLOG_KNOWN_LIMIT") {
            cfg.known_limit = parse_number("SEENLOG_KNOWN_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("SEENLOG_COMMIT") {
            cfg.commit = raw
                .parse()
                .map_err(|e: String| StoreError::InvalidConfig(format!("SEENLOG_COMMIT: {e}")))?;
        }
        if let Some(raw) = lookup("SEENLOG_DURABLE_FLUSH") {
            cfg.durable_flush = parse_flag("SEENLOG_DURABLE_FLUSH", &raw)?;
        }

        tracing::info!(
            root = %cfg.root.display(),
            segment_capacity = cfg.segment_capacity,
            known_limit = cfg.known_limit,
            commit = ?cfg.commit,
            durable_flush = cfg.durable_flush,
            "seenlog configuration loaded"
        );
        Ok(cfg)
    }

    /// Open the metadata store and identifier log over a filesystem directory at `root`.
    pub fn open(&self) -> StoreResult<(MetadataStore, IdLog)> {
        let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(self.root.clone())?);
        let meta = MetadataStore::new(dir.clone()).with_durable_flush(self.durable_flush);
        Ok((meta, IdLog::new(dir)))
    }

    /// The known-ID window as a load limit.
    pub fn load_limit(&self) -> LoadLimit {
        LoadLimit::from_raw(i64::try_from(self.known_limit).unwrap_or(i64::MAX))
    }
}

impl SyncOptions {
    /// Run options derived from `cfg`; attachments go under `<root>/attachments`.
    pub fn from_config(cfg: &StoreConfig) -> Self {
        Self {
            known_limit: cfg.load_limit(),
            capacity: Some(cfg.segment_capacity),
            commit: cfg.commit,
            attachment_dir: cfg.root.join("attachments"),
            ..Self::default()
        }
    }
}

fn parse_number(key: &str, raw: &str) -> StoreResult<usize> {
    raw.trim()
        .parse()
        .map_err(|e| StoreError::InvalidConfig(format!("{key}={raw:?}: {e}")))
}

fn parse_flag(key: &str, raw: &str) -> StoreResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(StoreError::InvalidConfig(format!(
            "{key}={raw:?}: expected a boolean"
        ))),
    }
}
