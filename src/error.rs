//! Error types for `seenlog`.

use std::path::PathBuf;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the metadata store, the identifier log, and the sync engine.
///
/// Structural errors (`PathType`, `Index`, `TypeKind`) are programmer errors: the stores never
/// catch them internally. Run-level remote failures are not represented here; see
/// [`crate::sync::FetchError`].
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization error.
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// A dotted path could not be resolved.
    ///
    /// Raised when a prefix of the path resolves to a non-mapping value, or (without a
    /// default) when a key along the path is absent.
    #[error("path error at `{path}`: {reason}")]
    PathType {
        /// The dotted path as given by the caller.
        path: String,
        /// What went wrong while walking it.
        reason: String,
    },

    /// A sequence index was out of range.
    #[error("index {index} out of range at `{path}` (len {len})")]
    Index {
        /// The dotted path of the sequence.
        path: String,
        /// Requested index.
        index: usize,
        /// Actual sequence length.
        len: usize,
    },

    /// A value had the wrong kind for the requested operation.
    #[error("type error at `{path}`: expected {expected}, found {actual}")]
    TypeKind {
        /// The dotted path of the value.
        path: String,
        /// Kind the operation needed.
        expected: &'static str,
        /// Kind actually stored.
        actual: &'static str,
    },

    /// A segment of an entity's identifier log is missing.
    #[error("log for entity {entity} requires repair: segment {segment} is missing")]
    LogIntegrity {
        /// Owning entity.
        entity: String,
        /// Segment number that was expected on disk.
        segment: u64,
    },

    /// Entity IDs double as directory names and must be path-safe.
    #[error("invalid entity id: {0:?}")]
    InvalidEntity(String),

    /// Item IDs must survive the newline-delimited segment format.
    #[error("invalid item id: {0:?}")]
    InvalidItemId(String),

    /// Malformed on-disk content.
    #[error("format error: {0}")]
    Format(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not supported by this backend.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Lock acquisition failed.
    #[error("lock failed on {resource}: {reason}")]
    LockFailed {
        /// What we were trying to lock.
        resource: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Requested path does not exist.
    #[error("missing path: {0}")]
    MissingPath(PathBuf),
}

impl StoreError {
    /// Whether this error means the entity's log needs [`crate::idlog::IdLog::repair`].
    pub fn requires_repair(&self) -> bool {
        matches!(self, StoreError::LogIntegrity { .. })
    }
}
