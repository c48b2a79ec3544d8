//! End-to-end: staging batches in the temp buffer and consolidating them.

use seenlog::layout::keys;
use seenlog::storage::{Directory, FsDirectory};
use seenlog::{ConsolidateReport, EntityId, IdLog, LoadLimit, MetadataStore};
use serde_json::Value;
use std::sync::Arc;

fn open(root: &std::path::Path) -> (Arc<dyn Directory>, MetadataStore, IdLog) {
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::new(root).unwrap());
    (dir.clone(), MetadataStore::new(dir.clone()), IdLog::new(dir))
}

#[test]
fn staged_batches_survive_restart_and_drain_newest_batch_first() {
    let tmp = tempfile::tempdir().unwrap();
    let e = EntityId::new("777").unwrap();
    {
        let (_dir, mut meta, log) = open(tmp.path());
        log.append(&mut meta, &e, &["h1", "h2"], None).unwrap();
        log.stage(&mut meta, &e, &["a1", "a2"]).unwrap();
        log.stage(&mut meta, &e, &["b1", "b2"]).unwrap();
        meta.flush().unwrap();
    }

    let (dir, mut meta, log) = open(tmp.path());
    assert!(dir.exists("777/known_items/temp/1.txt"));
    assert!(dir.exists("777/known_items/temp/2.txt"));

    let report = log.consolidate(&mut meta, &e, None).unwrap();
    assert_eq!(report, ConsolidateReport { batches: 2, ids: 4 });
    assert!(!dir.exists("777/known_items/temp"));
    assert_eq!(
        meta.get_or(&e, keys::TEMP_SEGMENT_COUNT, Value::Null).unwrap(),
        Value::Null
    );
    meta.flush().unwrap();

    // Main log order: h1 h2 | b1 b2 | a1 a2.
    let all = log.load(&mut meta, &e, LoadLimit::All, None).unwrap();
    assert_eq!(all, vec!["a2", "a1", "b2", "b1", "h2", "h1"]);
    assert_eq!(log.len(&mut meta, &e).unwrap(), 6);
}

#[test]
fn consolidation_rotates_like_append() {
    let tmp = tempfile::tempdir().unwrap();
    let e = EntityId::new("777").unwrap();
    let (_dir, mut meta, log) = open(tmp.path());

    let batch: Vec<String> = (0..700).map(|i| format!("s{i}")).collect();
    log.stage(&mut meta, &e, &batch).unwrap();
    log.stage(&mut meta, &e, &batch[..400]).unwrap();
    log.consolidate(&mut meta, &e, Some(1000)).unwrap();

    assert_eq!(log.segment_count(&mut meta, &e).unwrap(), 2);
    assert_eq!(
        meta.get(&e, keys::LOG_SEGMENT_LINE_COUNTS).unwrap(),
        serde_json::json!([1000, 100])
    );
}

#[test]
fn consolidate_without_temp_buffer_is_a_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let e = EntityId::new("777").unwrap();
    let (_dir, mut meta, log) = open(tmp.path());
    meta.load(&e).unwrap();
    meta.flush().unwrap();

    assert_eq!(
        log.consolidate(&mut meta, &e, None).unwrap(),
        ConsolidateReport::default()
    );
    assert!(!meta.is_dirty(&e));
}
