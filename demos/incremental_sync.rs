//! Minimal consumer of `seenlog`: two incremental runs against a scripted feed.
//!
//! The first run records the whole feed. Between runs a few newer items appear; the second
//! run picks up only those and halts at the first item it already knows.
//!
//! Run:
//! `RUST_LOG=seenlog=debug cargo run --example incremental_sync`

use seenlog::{
    BudgetedSource, Downloader, EntityId, FeedItem, FeedSource, FetchError, LoadLimit, Page,
    StoreConfig, SyncEngine, SyncOptions,
};
use std::io;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Newest-first feed over IDs `oldest..=newest`, `per_page` items per page.
struct ScriptedFeed {
    newest: u64,
    oldest: u64,
    per_page: u64,
}

impl FeedSource for ScriptedFeed {
    fn fetch_page(&mut self, _: &EntityId, cursor: Option<&str>) -> Result<Page, FetchError> {
        let top = match cursor {
            Some(c) => c.parse().map_err(|_| FetchError::Unsuccessful {
                status: 400,
                message: format!("invalid cursor {c:?}"),
            })?,
            None => self.newest,
        };
        let bottom = top.saturating_sub(self.per_page - 1).max(self.oldest);
        let items = (bottom..=top)
            .rev()
            .map(|id| {
                let item = FeedItem::new(id.to_string())
                    .with_attachment(format!("https://cdn.example/{id}.jpg"), None);
                if id % 5 == 0 {
                    item.with_external_link(format!("https://elsewhere.example/{id}"))
                } else {
                    item
                }
            })
            .collect();
        let next_cursor = (bottom > self.oldest).then(|| (bottom - 1).to_string());
        Ok(Page { items, next_cursor })
    }
}

/// Pretends to download by writing the URL into the destination file.
struct Stub;

impl Downloader for Stub {
    fn download(&mut self, url: &str, dest: &Path) -> io::Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, url)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let tmp = tempfile::tempdir()?;
    let cfg = StoreConfig {
        root: tmp.path().to_path_buf(),
        ..StoreConfig::from_env()?
    };
    let options = SyncOptions::from_config(&cfg);
    let entity = EntityId::new("783214")?;

    for (run, newest) in [(1, 40u64), (2, 47)] {
        let (mut meta, log) = cfg.open()?;
        let feed = ScriptedFeed {
            newest,
            oldest: 1,
            per_page: 10,
        };
        let mut engine = SyncEngine::new(BudgetedSource::new(feed, 50), Stub);
        let report = engine.run(&mut meta, &log, &entity, &options)?;

        println!(
            "run {run}: {} new, {} pages, halt: {}",
            report.new_ids.len(),
            report.pages_fetched,
            report
                .halt
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none (feed exhausted)".into()),
        );
        println!("  report: {}", serde_json::to_string(&report)?);

        let newest_known = log.load(&mut meta, &entity, LoadLimit::AtMost(5), None)?;
        println!("  newest known: {newest_known:?}");
        println!("  totals: {}", serde_json::to_string(&meta.get_record(&entity)?)?);
    }
    Ok(())
}
