//! End-to-end: sync runs against a scripted feed, with state on the filesystem.

use seenlog::layout::keys;
use seenlog::{
    BudgetedSource, CommitStrategy, Downloader, EntityId, FeedItem, FeedSource, FetchError,
    HaltReason, LoadLimit, Page, StoreConfig, SyncEngine, SyncOptions,
};
use serde_json::json;
use std::io;
use std::path::Path;

/// A reverse-chronological feed of `ids`, `per_page` items per page.
struct Feed {
    ids: Vec<String>,
    per_page: usize,
}

impl Feed {
    fn newest_first(newest: u32, oldest: u32, per_page: usize) -> Self {
        Self {
            ids: (oldest..=newest).rev().map(|i| i.to_string()).collect(),
            per_page,
        }
    }
}

impl FeedSource for Feed {
    fn fetch_page(&mut self, _: &EntityId, cursor: Option<&str>) -> Result<Page, FetchError> {
        let start: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| FetchError::Unsuccessful {
                    status: 400,
                    message: format!("bad cursor {c}"),
                })?,
            None => 0,
        };
        let end = (start + self.per_page).min(self.ids.len());
        let items = self.ids[start.min(end)..end]
            .iter()
            .map(|id| {
                let name = format!("{id}.bin");
                FeedItem::new(id.clone())
                    .with_attachment(format!("https://cdn/{id}"), Some(name.as_str()))
            })
            .collect();
        Ok(Page {
            items,
            next_cursor: (end < self.ids.len()).then(|| end.to_string()),
        })
    }
}

/// Writes the URL into the destination file.
struct FileWriter;

impl Downloader for FileWriter {
    fn download(&mut self, url: &str, dest: &Path) -> io::Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, url)
    }
}

fn config(root: &Path, commit: CommitStrategy) -> StoreConfig {
    StoreConfig {
        root: root.to_path_buf(),
        commit,
        ..StoreConfig::default()
    }
}

#[test]
fn incremental_runs_pick_up_only_new_items() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), CommitStrategy::Append);
    let e = EntityId::new("31337").unwrap();
    let options = SyncOptions::from_config(&cfg);

    // First run: everything is new.
    {
        let (mut meta, log) = cfg.open().unwrap();
        let mut engine = SyncEngine::new(Feed::newest_first(20, 1, 7), FileWriter);
        let report = engine.run(&mut meta, &log, &e, &options).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.new_ids.len(), 20);
        assert_eq!(report.pages_fetched, 3);
        assert_eq!(report.attachments_downloaded, 20);
        assert!(tmp.path().join("attachments/20.bin").is_file());
    }

    // Second run after a restart: five newer items appeared on top.
    let (mut meta, log) = cfg.open().unwrap();
    let mut engine = SyncEngine::new(Feed::newest_first(25, 1, 7), FileWriter);
    let report = engine.run(&mut meta, &log, &e, &options).unwrap();
    assert_eq!(report.new_ids, vec!["25", "24", "23", "22", "21"]);
    assert_eq!(
        report.halt,
        Some(HaltReason::DuplicateFound {
            item_id: "20".into()
        })
    );

    let newest = log
        .load(&mut meta, &e, LoadLimit::AtMost(6), None)
        .unwrap();
    assert_eq!(newest, vec!["25", "24", "23", "22", "21", "20"]);
    assert_eq!(meta.get(&e, keys::ITEM_COUNT).unwrap(), json!(25));
    assert_eq!(meta.get(&e, keys::REQUESTS_MADE).unwrap(), json!(4));
    assert_eq!(meta.get(&e, keys::ATTACHMENTS_DOWNLOADED).unwrap(), json!(25));
}

#[test]
fn budget_halt_then_resume_from_cursor() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path(), CommitStrategy::Stage);
    let e = EntityId::new("31337").unwrap();
    let (mut meta, log) = cfg.open().unwrap();

    let mut engine = SyncEngine::new(
        BudgetedSource::new(Feed::newest_first(30, 1, 5), 2),
        FileWriter,
    );
    let first = engine
        .run(&mut meta, &log, &e, &SyncOptions::from_config(&cfg))
        .unwrap();
    assert_eq!(first.halt, Some(HaltReason::RequestLimitExceeded));
    assert_eq!(first.new_ids.len(), 10);
    assert!(!tmp.path().join("31337/known_items/temp").exists());

    // Continue where the budget ran out; the next run starts with a fresh budget.
    let resume = SyncOptions {
        cursor: first.resume_cursor.clone(),
        ..SyncOptions::from_config(&cfg)
    };
    let second = engine.run(&mut meta, &log, &e, &resume).unwrap();
    assert_eq!(second.halt, Some(HaltReason::RequestLimitExceeded));
    assert_eq!(second.new_ids.first().map(String::as_str), Some("20"));

    let all = log.load(&mut meta, &e, LoadLimit::All, None).unwrap();
    assert_eq!(all.len(), 20);
    assert_eq!(meta.get(&e, keys::ITEM_COUNT).unwrap(), json!(20));
}
