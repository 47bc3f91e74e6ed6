use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use mindex::{Config, MergeIndex, Posting, StreamItem};
use tempfile::TempDir;
use walkdir::WalkDir;

const INDEX: &[u8] = b"idx";
const FIELD: &[u8] = b"fld";

fn posting(term: &[u8], value: &[u8], timestamp: u64, props: Option<&[u8]>) -> Posting {
    Posting {
        index: INDEX.to_vec(),
        field: FIELD.to_vec(),
        term: term.to_vec(),
        value: value.to_vec(),
        timestamp,
        props: props.map(|p| p.to_vec()),
    }
}

fn stream_term(store: &MergeIndex, term: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let (sink, results) = std::sync::mpsc::sync_channel(64);
    store.stream(INDEX, FIELD, term, sink, None).unwrap();
    let mut all = Vec::new();
    for item in results {
        match item {
            StreamItem::Batch(mut batch) => all.append(&mut batch),
            StreamItem::Done => break,
        }
    }
    all
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

fn file_names(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn reopen_replays_the_buffer_log() {
    let dir = TempDir::new().unwrap();
    {
        let store = MergeIndex::open(dir.path(), Config::default()).unwrap();
        store
            .index(vec![
                posting(b"x", b"d1", 1, Some(b"p1")),
                posting(b"x", b"d2", 2, Some(b"p2")),
            ])
            .unwrap();
    }

    let store = MergeIndex::open(dir.path(), Config::default()).unwrap();
    assert_eq!(
        stream_term(&store, b"x"),
        vec![
            (b"d1".to_vec(), b"p1".to_vec()),
            (b"d2".to_vec(), b"p2".to_vec()),
        ]
    );
}

#[test]
fn torn_log_tail_is_truncated_on_replay() {
    let dir = TempDir::new().unwrap();
    {
        let store = MergeIndex::open(dir.path(), Config::default()).unwrap();
        store
            .index(vec![posting(b"x", b"d1", 1, Some(b"p1"))])
            .unwrap();
    }

    // crash mid-append: half a record at the tail of the head buffer
    let head = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| {
            p.file_name()
                .map_or(false, |n| n.to_string_lossy().starts_with("buffer."))
        })
        .expect("head buffer on disk");
    let mut log = fs::OpenOptions::new().append(true).open(&head).unwrap();
    log.write_all(b"{\"index\":[105,100,120],\"fie").unwrap();
    drop(log);

    let store = MergeIndex::open(dir.path(), Config::default()).unwrap();
    assert_eq!(
        stream_term(&store, b"x"),
        vec![(b"d1".to_vec(), b"p1".to_vec())]
    );
    // the store accepts writes again after the truncation
    store
        .index(vec![posting(b"x", b"d2", 2, Some(b"p2"))])
        .unwrap();
    assert_eq!(stream_term(&store, b"x").len(), 2);
}

#[test]
fn sweep_collects_flagged_wreckage() {
    let dir = TempDir::new().unwrap();
    // a half-written compaction output, killed before its flag was cleared
    for name in ["segment.5.data", "segment.5.offsets", "segment.5.deleted"] {
        File::create(dir.path().join(name)).unwrap();
    }

    let store = MergeIndex::open(dir.path(), Config::default()).unwrap();
    assert!(store.is_empty().unwrap());
    let names = file_names(dir.path());
    assert!(!names.iter().any(|name| name.starts_with("segment.5")));
}

#[test]
fn leftover_buffers_are_converted_on_startup() {
    let dir = TempDir::new().unwrap();

    // a sealed buffer left behind by a crashed session: same wire format
    // the store writes, two acknowledged postings
    let mut log = BufWriter::new(File::create(dir.path().join("buffer.3")).unwrap());
    serde_json::to_writer(&mut log, &posting(b"x", b"d1", 1, Some(b"p1"))).unwrap();
    serde_json::to_writer(&mut log, &posting(b"x", b"d2", 2, Some(b"p2"))).unwrap();
    log.flush().unwrap();
    drop(log);
    // the head the crashed session was writing into
    File::create(dir.path().join("buffer.9")).unwrap();

    let store = MergeIndex::open(dir.path(), Config::default()).unwrap();

    // buffer.3 is not the head, so it is handed to the converter
    assert!(
        wait_until(Duration::from_secs(10), || {
            let names = file_names(dir.path());
            names.contains(&"segment.3.data".to_owned())
                && !names.contains(&"buffer.3".to_owned())
        }),
        "files: {:?}",
        file_names(dir.path())
    );

    assert_eq!(
        stream_term(&store, b"x"),
        vec![
            (b"d1".to_vec(), b"p1".to_vec()),
            (b"d2".to_vec(), b"p2".to_vec()),
        ]
    );
}

#[test]
fn buffer_ids_stay_monotone_across_restart() {
    let dir = TempDir::new().unwrap();
    let config = Config::default().buffer_rollover_size(512);

    {
        let store = MergeIndex::open(dir.path(), config.clone()).unwrap();
        for i in 0..20u64 {
            let value = format!("d{:04}", i);
            store
                .index(vec![posting(b"x", value.as_bytes(), i, Some(b"p"))])
                .unwrap();
        }
    }

    let max_seen = |root: &Path| -> u64 {
        file_names(root)
            .iter()
            .filter_map(|name| {
                let mut parts = name.split('.');
                match (parts.next(), parts.next(), parts.next()) {
                    (Some("buffer"), Some(id), None) => id.parse().ok(),
                    (Some("segment"), Some(id), _) => id.parse().ok(),
                    _ => None,
                }
            })
            .max()
            .unwrap_or(0)
    };
    let before = max_seen(dir.path());
    assert!(before > 1, "expected several buffers, saw max id {}", before);

    let store = MergeIndex::open(dir.path(), config).unwrap();
    for i in 0..20u64 {
        let value = format!("e{:04}", i);
        store
            .index(vec![posting(b"y", value.as_bytes(), 100 + i, Some(b"p"))])
            .unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        max_seen(dir.path()) > before
    }));
}

#[test]
fn fresh_head_id_follows_the_largest_segment() {
    let dir = TempDir::new().unwrap();
    {
        // a store whose buffers were all converted: only segments remain
        let store = MergeIndex::open(dir.path(), Config::default()).unwrap();
        store
            .index(vec![posting(b"x", b"d1", 1, Some(b"p"))])
            .unwrap();
        drop(store);
        // simulate full conversion by renaming the lone buffer out of the way
        let names = file_names(dir.path());
        let head = names
            .iter()
            .find(|name| name.starts_with("buffer."))
            .expect("head buffer on disk")
            .clone();
        fs::remove_file(dir.path().join(&head)).unwrap();
        for name in ["segment.7.data", "segment.7.offsets"] {
            let writer = File::create(dir.path().join(name)).unwrap();
            if name.ends_with(".offsets") {
                serde_json::to_writer(writer, &Vec::<()>::new()).unwrap();
            }
        }
    }

    let _store = MergeIndex::open(dir.path(), Config::default()).unwrap();
    assert!(file_names(dir.path()).contains(&"buffer.8".to_owned()));
}
