//! Filesystem-backed `Directory` wrapper with targeted fault injection.
//!
//! Important: this file lives under `tests/support/` so it is **not** compiled as a standalone
//! integration test target.

#![allow(dead_code)]

use seenlog::storage::{Directory, FsDirectory, ReadSeek};
use seenlog::StoreResult;
use std::io;
use std::sync::{Arc, Mutex};

/// Fault-injection configuration for metadata snapshots and log files.
#[derive(Default)]
pub struct FaultConfig {
    /// Fail `atomic_write` of `<entity>/metadata.json`.
    pub fail_metadata_write: bool,
    /// Fail opening an append handle for a log segment.
    pub fail_segment_append: bool,
    /// Fail `atomic_write` of a temp buffer batch.
    pub fail_temp_write: bool,
    /// Fail deleting the temp buffer directory.
    pub fail_temp_delete: bool,
    /// Hide `file_path()` everywhere (simulates "cannot prove durability").
    pub hide_file_path: bool,
    /// Metadata snapshot writes attempted.
    pub metadata_writes: usize,
    /// Segment append handles requested.
    pub segment_appends: usize,
}

/// A filesystem-backed `Directory` wrapper with targeted fault injection.
pub struct FaultyDirectory {
    inner: FsDirectory,
    cfg: Arc<Mutex<FaultConfig>>,
}

impl FaultyDirectory {
    /// Wrap an existing `FsDirectory`.
    pub fn new(inner: FsDirectory) -> Self {
        Self {
            inner,
            cfg: Arc::new(Mutex::new(FaultConfig::default())),
        }
    }

    /// Access the shared fault config (for toggling failpoints and reading counters).
    pub fn cfg(&self) -> Arc<Mutex<FaultConfig>> {
        self.cfg.clone()
    }

    fn is_metadata(path: &str) -> bool {
        path.ends_with("/metadata.json")
    }

    fn is_temp(path: &str) -> bool {
        path.contains("/known_items/temp")
    }

    fn is_segment(path: &str) -> bool {
        path.contains("/known_items/") && !Self::is_temp(path)
    }

    fn injected(what: &str) -> seenlog::StoreError {
        io::Error::new(io::ErrorKind::Other, format!("injected {what} failure")).into()
    }
}

impl Directory for FaultyDirectory {
    fn open_file(&self, path: &str) -> StoreResult<Box<dyn ReadSeek>> {
        self.inner.open_file(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        let cfg = self.cfg.lock().unwrap();
        if cfg.fail_temp_delete && Self::is_temp(path) {
            return Err(Self::injected("temp delete"));
        }
        drop(cfg);
        self.inner.delete(path)
    }

    fn atomic_rename(&self, from: &str, to: &str) -> StoreResult<()> {
        self.inner.atomic_rename(from, to)
    }

    fn list_dir(&self, path: &str) -> StoreResult<Vec<String>> {
        self.inner.list_dir(path)
    }

    fn append_file(&self, path: &str) -> StoreResult<Box<dyn io::Write>> {
        let mut cfg = self.cfg.lock().unwrap();
        if Self::is_segment(path) {
            cfg.segment_appends += 1;
            if cfg.fail_segment_append {
                return Err(Self::injected("segment append"));
            }
        }
        drop(cfg);
        self.inner.append_file(path)
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let mut cfg = self.cfg.lock().unwrap();
        if Self::is_metadata(path) {
            cfg.metadata_writes += 1;
            if cfg.fail_metadata_write {
                return Err(Self::injected("metadata write"));
            }
        }
        if cfg.fail_temp_write && Self::is_temp(path) {
            return Err(Self::injected("temp write"));
        }
        drop(cfg);
        self.inner.atomic_write(path, data)
    }

    fn file_path(&self, path: &str) -> Option<std::path::PathBuf> {
        if self.cfg.lock().unwrap().hide_file_path {
            return None;
        }
        self.inner.file_path(path)
    }
}
