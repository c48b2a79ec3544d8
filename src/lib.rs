//! `seenlog`: processed-item history for incremental feed sync.
//!
//! Scope:
//! - directory abstraction (`storage`)
//! - on-disk layout, limits and entity IDs (`layout`)
//! - per-entity metadata records with dotted-path addressing (`metadata`)
//! - rotating identifier log with a temp buffer (`idlog`)
//! - the incremental sync engine and its collaborator traits (`sync`)
//! - configuration (`config`)
//!
//! Non-goal: talking to any particular remote API. Sources and downloaders are traits.
//!
//! ## Contract (what you can rely on)
//!
//! - **Newest-first reads stay cheap.** Loading the newest `n` IDs reads segment files
//!   backwards and stops as soon as `n` distinct IDs are collected.
//! - **Bookkeeping is authoritative.** Segment line counts live in the entity's metadata
//!   record; normal operation never re-scans files. [`IdLog::repair`] is the explicit
//!   recovery path.
//! - **Metadata snapshots are replaced atomically** (temp file + rename). A crash mid-flush
//!   leaves the previous snapshot intact. Opt into fsync barriers with
//!   [`StoreConfig::durable_flush`].
//! - **A run never loses what it saw.** Remote failures become a [`HaltReason`] and the
//!   newly seen IDs are committed either way; a clean rerun adds nothing twice.
//!
//! Callers must serialize runs per entity. Nothing here locks.

pub mod config;
pub mod error;
pub mod idlog;
pub mod layout;
pub mod metadata;
pub mod revlines;
pub mod storage;
pub mod sync;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use idlog::{ConsolidateReport, IdLog, RepairReport};
pub use layout::{Capacity, EntityId, LoadLimit};
pub use metadata::{MetadataStore, Update};
pub use storage::{Directory, DurableDirectory, FsDirectory, MemoryDirectory};
pub use sync::{
    BudgetedSource, CommitStrategy, Downloader, FeedItem, FeedSource, FetchError, HaltReason,
    Page, RunReport, RunState, SyncEngine, SyncOptions,
};
