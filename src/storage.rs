//! Storage abstraction for entity state.
//!
//! Vocabulary note:
//! - Snapshot writes require **atomicity** (temp file + rename), so a crash mid-write leaves
//!   the previous snapshot intact.
//! - Stable-storage **durability** (survives power loss after reporting success)
//!   additionally requires explicit `fsync`/`sync_all` barriers and parent-directory sync
//!   after renames. That is opt-in via [`DurableDirectory`].

use crate::error::{StoreError, StoreResult};
use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// A readable, seekable file handle.
///
/// Segment files are read newest-first, so readers must be able to seek from the end.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Attempt to `fsync`/`sync_all` the file at `path`.
///
/// Requires a backend that exposes `file_path()`; other backends get `NotSupported`.
/// This does **not** sync the parent directory; see [`sync_parent_dir`].
pub fn sync_file<D: Directory + ?Sized>(dir: &D, path: &str) -> StoreResult<()> {
    let Some(p) = dir.file_path(path) else {
        return Err(StoreError::NotSupported(
            "sync_file requires Directory::file_path()".into(),
        ));
    };
    let f = std::fs::OpenOptions::new().read(true).open(&p)?;
    f.sync_all()?;
    Ok(())
}

/// Attempt to `fsync`/`sync_all` the parent directory of `path`.
///
/// This is the commonly-missed step needed to make a rename durable.
pub fn sync_parent_dir<D: Directory + ?Sized>(dir: &D, path: &str) -> StoreResult<()> {
    let Some(p) = dir.file_path(path) else {
        return Err(StoreError::NotSupported(
            "sync_parent_dir requires Directory::file_path()".into(),
        ));
    };
    let Some(parent) = p.parent() else {
        return Err(StoreError::InvalidConfig(format!(
            "path has no parent directory: {p:?}"
        )));
    };
    let f = std::fs::File::open(parent)?;
    f.sync_all()?;
    Ok(())
}

/// Trait for directory-like storage backends.
///
/// Paths are `/`-separated and relative to the backend root.
pub trait Directory: Send + Sync {
    /// Open an existing file for reading.
    fn open_file(&self, path: &str) -> StoreResult<Box<dyn ReadSeek>>;
    /// Return whether a file or directory exists at `path`.
    fn exists(&self, path: &str) -> bool;
    /// Delete a file or directory (directories recursively). Missing paths are not an error.
    fn delete(&self, path: &str) -> StoreResult<()>;
    /// Atomically rename/move a file.
    fn atomic_rename(&self, from: &str, to: &str) -> StoreResult<()>;
    /// List the immediate entries of a directory, sorted. Missing directories list as empty.
    fn list_dir(&self, path: &str) -> StoreResult<Vec<String>>;
    /// Open a file for appending (creating it and its parents if missing).
    fn append_file(&self, path: &str) -> StoreResult<Box<dyn Write>>;
    /// Atomically replace the contents of `path`.
    fn atomic_write(&self, path: &str, data: &[u8]) -> StoreResult<()>;
    /// Optional filesystem path for backends that support it.
    fn file_path(&self, path: &str) -> Option<PathBuf>;
}

/// Opt-in stable-storage durability operations for a `Directory`.
///
/// Default implementations use [`sync_file`] / [`sync_parent_dir`], which require
/// `Directory::file_path()`. For non-filesystem backends, these return `NotSupported`.
pub trait DurableDirectory: Directory {
    /// Atomically write bytes to `path`, then sync the file and its parent directory.
    ///
    /// If a barrier fails after the rename, the new contents may be visible; the error means
    /// "not proven durable".
    fn atomic_write_durable(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        // Fail fast on backends that can't provide stable-storage semantics.
        if self.file_path(path).is_none() {
            return Err(StoreError::NotSupported(
                "atomic_write_durable requires Directory::file_path()".into(),
            ));
        }
        self.atomic_write(path, data)?;
        sync_file(self, path)?;
        sync_parent_dir(self, path)?;
        Ok(())
    }
}

impl<T: Directory + ?Sized> DurableDirectory for T {}

/// Filesystem-backed `Directory` rooted at a local path.
pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    /// Create (or open) a filesystem directory backend rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl Directory for FsDirectory {
    fn open_file(&self, path: &str) -> StoreResult<Box<dyn ReadSeek>> {
        let full_path = self.resolve_path(path);
        if !full_path.exists() {
            return Err(StoreError::MissingPath(full_path));
        }
        Ok(Box::new(std::fs::File::open(full_path)?))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve_path(path).exists()
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        let full_path = self.resolve_path(path);
        if full_path.is_dir() {
            std::fs::remove_dir_all(full_path)?;
        } else if full_path.exists() {
            std::fs::remove_file(full_path)?;
        }
        Ok(())
    }

    fn atomic_rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        if let Some(parent) = to_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(from_path, to_path)?;
        Ok(())
    }

    fn list_dir(&self, path: &str) -> StoreResult<Vec<String>> {
        let full_path = self.resolve_path(path);
        if !full_path.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(full_path)? {
            let entry = entry?;
            out.push(entry.file_name().to_string_lossy().to_string());
        }
        out.sort();
        Ok(out)
    }

    fn append_file(&self, path: &str) -> StoreResult<Box<dyn Write>> {
        let full_path = self.resolve_path(path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(full_path)?;
        Ok(Box::new(file))
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let temp_path = format!("{path}.tmp");
        let full_temp_path = self.resolve_path(&temp_path);
        if let Some(parent) = full_temp_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut temp_file = std::fs::File::create(&full_temp_path)?;
        temp_file.write_all(data)?;
        temp_file.sync_all()?;

        let full_path = self.resolve_path(path);
        std::fs::rename(&full_temp_path, &full_path)?;

        if let Some(parent) = full_path.parent() {
            if let Ok(parent_file) = std::fs::File::open(parent) {
                let _ = parent_file.sync_all();
            }
        }
        Ok(())
    }

    fn file_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.resolve_path(path))
    }
}

type FileMap = Arc<RwLock<HashMap<String, Vec<u8>>>>;

/// In-memory `Directory` used for tests.
///
/// Directories are implicit: a directory exists while some file lives under it.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    files: FileMap,
}

impl MemoryDirectory {
    /// Create an empty in-memory directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_failed() -> StoreError {
        StoreError::LockFailed {
            resource: "memory directory".to_string(),
            reason: "lock poisoned".to_string(),
        }
    }

    fn dir_prefix(path: &str) -> String {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        }
    }
}

impl Directory for MemoryDirectory {
    fn open_file(&self, path: &str) -> StoreResult<Box<dyn ReadSeek>> {
        let files = self.files.read().map_err(|_| Self::lock_failed())?;
        let data = files
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?
            .clone();
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    fn exists(&self, path: &str) -> bool {
        let prefix = Self::dir_prefix(path);
        self.files
            .read()
            .map(|f| f.contains_key(path) || f.keys().any(|k| k.starts_with(&prefix)))
            .unwrap_or(false)
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        let prefix = Self::dir_prefix(path);
        let mut files = self.files.write().map_err(|_| Self::lock_failed())?;
        files.remove(path);
        files.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    fn atomic_rename(&self, from: &str, to: &str) -> StoreResult<()> {
        let mut files = self.files.write().map_err(|_| Self::lock_failed())?;
        match files.remove(from) {
            Some(data) => {
                files.insert(to.to_string(), data);
                Ok(())
            }
            None => Err(StoreError::NotFound(from.to_string())),
        }
    }

    fn list_dir(&self, path: &str) -> StoreResult<Vec<String>> {
        let files = self.files.read().map_err(|_| Self::lock_failed())?;
        let prefix = Self::dir_prefix(path);
        let names: BTreeSet<String> = files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    fn append_file(&self, path: &str) -> StoreResult<Box<dyn Write>> {
        // Ensure the file exists, then append in-place.
        {
            let mut files = self.files.write().map_err(|_| Self::lock_failed())?;
            files.entry(path.to_string()).or_default();
        }
        Ok(Box::new(MemoryAppendWriter {
            files: self.files.clone(),
            path: path.to_string(),
        }))
    }

    fn atomic_write(&self, path: &str, data: &[u8]) -> StoreResult<()> {
        let mut files = self.files.write().map_err(|_| Self::lock_failed())?;
        files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn file_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

struct MemoryAppendWriter {
    files: FileMap,
    path: String,
}

impl Write for MemoryAppendWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut files = self
            .files
            .write()
            .map_err(|_| std::io::Error::other("lock poisoned"))?;
        files
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
