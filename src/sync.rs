//! Incremental sync engine.
//!
//! One [`SyncEngine::run`] fetches pages for an entity newest-first, records every item it
//! has not seen before, and stops at the first item already in the entity's log: the feed is
//! reverse-chronological, so everything past a known item is known too.
//!
//! Remote failures never escape a run. They become a [`HaltReason`], and whatever the run
//! collected up to that point is committed like a normal completion.
//!
//! State per run: `Idle -> Fetching -> {Halted(reason), Completed}`; every terminal state
//! goes through the same commit step.

use crate::error::StoreResult;
use crate::idlog::IdLog;
use crate::layout::{self, keys, EntityId, LoadLimit};
use crate::metadata::{add_u64, MetadataStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Pages a [`BudgetedSource`] may fetch per run unless configured otherwise.
pub const DEFAULT_REQUEST_BUDGET: usize = 50;

/// A binary attachment of a feed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    /// File name suggested by the source, if any.
    pub file_name: Option<String>,
}

/// One item of a feed page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: String,
    pub attachments: Vec<Attachment>,
    /// Outward links the source classified as external.
    pub external_links: Vec<String>,
}

impl FeedItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_attachment(mut self, url: impl Into<String>, file_name: Option<&str>) -> Self {
        self.attachments.push(Attachment {
            url: url.into(),
            file_name: file_name.map(str::to_string),
        });
        self
    }

    pub fn with_external_link(mut self, url: impl Into<String>) -> Self {
        self.external_links.push(url.into());
        self
    }

    /// Whether the item links outward.
    pub fn links_outward(&self) -> bool {
        !self.external_links.is_empty()
    }
}

/// One page of a feed, newest item first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<FeedItem>,
    /// Cursor for the next (older) page; `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Run-level failures reported by a [`FeedSource`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request budget of {limit} exhausted")]
    RequestBudgetExceeded { limit: usize },
    #[error("unsuccessful response ({status}): {message}")]
    Unsuccessful { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Remote feed client.
pub trait FeedSource {
    /// Fetch the page at `cursor` (`None` = newest page).
    fn fetch_page(&mut self, entity: &EntityId, cursor: Option<&str>) -> Result<Page, FetchError>;

    /// Called once at the start of every [`SyncEngine::run`], before the first fetch.
    fn begin_run(&mut self) {}
}

impl<S: FeedSource + ?Sized> FeedSource for &mut S {
    fn fetch_page(&mut self, entity: &EntityId, cursor: Option<&str>) -> Result<Page, FetchError> {
        (**self).fetch_page(entity, cursor)
    }

    fn begin_run(&mut self) {
        (**self).begin_run()
    }
}

impl<S: FeedSource + ?Sized> FeedSource for Box<S> {
    fn fetch_page(&mut self, entity: &EntityId, cursor: Option<&str>) -> Result<Page, FetchError> {
        (**self).fetch_page(entity, cursor)
    }

    fn begin_run(&mut self) {
        (**self).begin_run()
    }
}

/// Attachment downloader. Failures are counted by the engine, never fatal.
pub trait Downloader {
    fn download(&mut self, url: &str, dest: &Path) -> io::Result<()>;
}

impl<D: Downloader + ?Sized> Downloader for &mut D {
    fn download(&mut self, url: &str, dest: &Path) -> io::Result<()> {
        (**self).download(url, dest)
    }
}

impl<D: Downloader + ?Sized> Downloader for Box<D> {
    fn download(&mut self, url: &str, dest: &Path) -> io::Result<()> {
        (**self).download(url, dest)
    }
}

/// Wraps a source and refuses to fetch once `max_requests` pages were requested in the
/// current run. The budget starts over at each [`SyncEngine::run`].
pub struct BudgetedSource<S> {
    inner: S,
    max_requests: usize,
    made: usize,
}

impl<S> BudgetedSource<S> {
    pub fn new(inner: S, max_requests: usize) -> Self {
        Self {
            inner,
            max_requests,
            made: 0,
        }
    }

    /// Requests issued in the current run.
    pub fn requests_made(&self) -> usize {
        self.made
    }

    /// Start a fresh budget.
    pub fn reset(&mut self) {
        self.made = 0;
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: FeedSource> FeedSource for BudgetedSource<S> {
    fn fetch_page(&mut self, entity: &EntityId, cursor: Option<&str>) -> Result<Page, FetchError> {
        if self.made >= self.max_requests {
            return Err(FetchError::RequestBudgetExceeded {
                limit: self.max_requests,
            });
        }
        self.made += 1;
        self.inner.fetch_page(entity, cursor)
    }

    fn begin_run(&mut self) {
        self.reset();
        self.inner.begin_run();
    }
}

/// Why a run stopped before running out of pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    /// An already-known item was reached; everything older is known.
    DuplicateFound { item_id: String },
    /// The request budget for this run ran out.
    RequestLimitExceeded,
    /// The source answered with a failure.
    UnsuccessfulResponse { message: String },
}

impl From<FetchError> for HaltReason {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::RequestBudgetExceeded { .. } => Self::RequestLimitExceeded,
            other => Self::UnsuccessfulResponse {
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateFound { item_id } => write!(f, "reached known item {item_id}"),
            Self::RequestLimitExceeded => f.write_str("request limit exceeded"),
            Self::UnsuccessfulResponse { message } => write!(f, "unsuccessful response: {message}"),
        }
    }
}

/// Lifecycle of the engine's current (or last) run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Fetching,
    Halted(HaltReason),
    Completed,
}

/// How a run commits its new IDs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStrategy {
    /// Append straight into the log.
    #[default]
    Append,
    /// Stage the batch in the temp buffer first, then consolidate.
    Stage,
}

impl FromStr for CommitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "stage" => Ok(Self::Stage),
            other => Err(format!("unknown commit strategy {other:?} (expected append|stage)")),
        }
    }
}

/// Per-run options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// How many of the newest known IDs to check against.
    pub known_limit: LoadLimit,
    /// Resume from this cursor instead of the newest page.
    pub cursor: Option<String>,
    /// Process known items instead of halting on them.
    pub ignore_known: bool,
    /// Segment capacity hint for commits.
    pub capacity: Option<usize>,
    pub commit: CommitStrategy,
    /// Where attachments are saved.
    pub attachment_dir: PathBuf,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            known_limit: LoadLimit::default(),
            cursor: None,
            ignore_known: false,
            capacity: None,
            commit: CommitStrategy::default(),
            attachment_dir: PathBuf::from("attachments"),
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// `None` when the source ran out of pages.
    pub halt: Option<HaltReason>,
    /// Newly seen IDs, in received (newest-first) order.
    pub new_ids: Vec<String>,
    pub pages_fetched: usize,
    pub requests_made: usize,
    pub attachments_downloaded: usize,
    pub attachments_failed: usize,
    /// New items that link outward.
    pub external_link_items: usize,
    /// Cursor to pass to resume a run halted by the source.
    pub resume_cursor: Option<String>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.halt.is_none()
    }
}

/// Drives runs against a source, committing into a [`MetadataStore`] / [`IdLog`] pair.
///
/// Callers must serialize runs per entity.
pub struct SyncEngine<S, D> {
    source: S,
    downloader: D,
    state: RunState,
}

impl<S: FeedSource, D: Downloader> SyncEngine<S, D> {
    pub fn new(source: S, downloader: D) -> Self {
        Self {
            source,
            downloader,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_parts(self) -> (S, D) {
        (self.source, self.downloader)
    }

    /// Run one incremental sync for `entity`.
    ///
    /// Errors are store failures only; remote failures end up in [`RunReport::halt`].
    pub fn run(
        &mut self,
        meta: &mut MetadataStore,
        log: &IdLog,
        entity: &EntityId,
        options: &SyncOptions,
    ) -> StoreResult<RunReport> {
        meta.load(entity)?;
        let leftover = log.consolidate(meta, entity, options.capacity)?;
        if leftover.batches > 0 {
            warn!(
                entity = %entity,
                batches = leftover.batches,
                ids = leftover.ids,
                "consolidated batches left by an earlier run"
            );
        }

        let known: HashSet<String> = if options.ignore_known {
            HashSet::new()
        } else {
            log.load(meta, entity, options.known_limit, None)?
                .into_iter()
                .collect()
        };
        debug!(entity = %entity, known = known.len(), "starting run");

        self.source.begin_run();
        self.state = RunState::Fetching;
        let mut report = RunReport::default();
        let mut links = Vec::new();
        let mut run = RunScratch {
            known: &known,
            seen: HashSet::new(),
            options,
        };
        let mut cursor = options.cursor.clone();

        let halt = loop {
            let page = match self.source.fetch_page(entity, cursor.as_deref()) {
                Ok(page) => page,
                Err(e) => {
                    if !matches!(e, FetchError::RequestBudgetExceeded { .. }) {
                        report.requests_made += 1;
                    }
                    warn!(entity = %entity, error = %e, "fetch halted the run");
                    report.resume_cursor = cursor.clone();
                    break Some(HaltReason::from(e));
                }
            };
            report.requests_made += 1;
            report.pages_fetched += 1;
            debug!(
                entity = %entity,
                cursor = cursor.as_deref().unwrap_or("<newest>"),
                items = page.items.len(),
                "fetched page"
            );

            if let Some(halt) = self.process_page(&mut run, &page, &mut report, &mut links) {
                info!(entity = %entity, reason = %halt, "run halted");
                break Some(halt);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break None,
            }
        };

        self.state = match &halt {
            Some(reason) => RunState::Halted(reason.clone()),
            None => RunState::Completed,
        };
        report.halt = halt;

        commit(meta, log, entity, options, &report, &links)?;
        info!(
            entity = %entity,
            new_ids = report.new_ids.len(),
            pages = report.pages_fetched,
            attachments = report.attachments_downloaded,
            complete = report.is_complete(),
            "run committed"
        );
        Ok(report)
    }

    fn process_page(
        &mut self,
        run: &mut RunScratch<'_>,
        page: &Page,
        report: &mut RunReport,
        links: &mut Vec<(String, String)>,
    ) -> Option<HaltReason> {
        for item in &page.items {
            if !run.options.ignore_known && run.known.contains(&item.id) {
                return Some(HaltReason::DuplicateFound {
                    item_id: item.id.clone(),
                });
            }
            if layout::validate_item_id(&item.id).is_err() {
                warn!(item = ?item.id, "skipping item with unusable id");
                continue;
            }
            // Pages may overlap while the feed shifts under us.
            if !run.seen.insert(item.id.clone()) {
                debug!(item = %item.id, "item repeated within run");
                continue;
            }

            for (n, attachment) in item.attachments.iter().enumerate() {
                let dest = run
                    .options
                    .attachment_dir
                    .join(attachment_file_name(item, attachment, n));
                match self.downloader.download(&attachment.url, &dest) {
                    Ok(()) => report.attachments_downloaded += 1,
                    Err(e) => {
                        report.attachments_failed += 1;
                        warn!(item = %item.id, url = %attachment.url, error = %e, "attachment download failed");
                    }
                }
            }
            if item.links_outward() {
                report.external_link_items += 1;
                links.extend(
                    item.external_links
                        .iter()
                        .map(|url| (item.id.clone(), url.clone())),
                );
            }
            report.new_ids.push(item.id.clone());
        }
        None
    }
}

struct RunScratch<'a> {
    known: &'a HashSet<String>,
    seen: HashSet<String>,
    options: &'a SyncOptions,
}

fn commit(
    meta: &mut MetadataStore,
    log: &IdLog,
    entity: &EntityId,
    options: &SyncOptions,
    report: &RunReport,
    links: &[(String, String)],
) -> StoreResult<()> {
    // The log is oldest-first; the run saw items newest-first.
    let chronological: Vec<&str> = report.new_ids.iter().rev().map(String::as_str).collect();
    match options.commit {
        CommitStrategy::Append => {
            log.append(meta, entity, &chronological, options.capacity)?;
        }
        CommitStrategy::Stage => {
            if !chronological.is_empty() {
                log.stage(meta, entity, &chronological)?;
                meta.flush()?;
            }
            log.consolidate(meta, entity, options.capacity)?;
        }
    }

    meta.update(entity, keys::ITEM_COUNT, add_u64(report.new_ids.len() as u64))?;
    meta.update(
        entity,
        keys::ATTACHMENTS_DOWNLOADED,
        add_u64(report.attachments_downloaded as u64),
    )?;
    meta.update(entity, keys::REQUESTS_MADE, add_u64(report.requests_made as u64))?;
    meta.update(
        entity,
        keys::ITEMS_WITH_EXTERNAL_LINK_COUNT,
        add_u64(report.external_link_items as u64),
    )?;
    append_external_links(log, entity, links)?;
    meta.flush()?;
    Ok(())
}

fn append_external_links(
    log: &IdLog,
    entity: &EntityId,
    links: &[(String, String)],
) -> StoreResult<()> {
    if links.is_empty() {
        return Ok(());
    }
    let mut buf = String::new();
    for (id, url) in links {
        if url.contains(['\t', '\n', '\r']) {
            warn!(item = %id, url = ?url, "skipping unrecordable external link");
            continue;
        }
        buf.push_str(id);
        buf.push('\t');
        buf.push_str(url);
        buf.push('\n');
    }
    let mut w = log
        .directory()
        .append_file(&layout::external_links_path(entity))?;
    w.write_all(buf.as_bytes())?;
    w.flush()?;
    Ok(())
}

/// `<source file name>`, or `<item id>_<n>` when the source gives none.
fn attachment_file_name(item: &FeedItem, attachment: &Attachment, n: usize) -> String {
    let suggested = attachment
        .file_name
        .as_deref()
        .and_then(|name| Path::new(name).file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty());
    match suggested {
        Some(name) => name.to_string(),
        None => format!("{}_{n}", item.id.replace(['/', '\\'], "_")),
    }
}
