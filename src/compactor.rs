//! Compaction: candidate selection and the background merge task.
//!
//! Selection prefers merging many small segments at once while leaving
//! large, already-compacted segments untouched: candidates are the
//! segments smaller than the mean size plus 1 KiB (the bias keeps a brand
//! new, nearly empty segment eligible), capped by configuration, and
//! nothing happens below three candidates.
//!
//! The merge task streams the candidates through the same combinator the
//! readers use and writes every posting it sees; duplicate and tombstone
//! collapse stay read-time concerns, which keeps compaction
//! order-preserving and safe to retry after a crash.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info};
use md5::{Digest, Md5};
use rand::Rng;

use crate::flags::{self, FileId};
use crate::merge;
use crate::segment::{Segment, SegmentWriter};
use crate::store::Command;
use crate::Result;

/// Pick the segments one compaction run should merge. Empty when there is
/// nothing worth doing.
pub(crate) fn plan(segments: &[Arc<Segment>], max_segments: usize) -> Vec<Arc<Segment>> {
    if segments.is_empty() {
        return Vec::new();
    }
    let mut by_size: Vec<Arc<Segment>> = segments.to_vec();
    by_size.sort_by_key(|segment| segment.filesize());

    let total: u64 = by_size.iter().map(|segment| segment.filesize()).sum();
    let avg = total / by_size.len() as u64 + 1024;

    let candidates: Vec<Arc<Segment>> = by_size
        .into_iter()
        .filter(|segment| segment.filesize() < avg)
        .take(max_segments)
        .collect();

    if candidates.len() <= 2 {
        Vec::new()
    } else {
        candidates
    }
}

/// Spawn the merge task for `candidates`. Completion or failure is
/// reported back to the coordinator over `commands`, tagged with `gen` so
/// a result that outlived its store generation can be discarded.
pub(crate) fn spawn(
    root: PathBuf,
    candidates: Vec<Arc<Segment>>,
    commands: Sender<Command>,
    gen: u64,
) {
    thread::spawn(move || {
        let old: Vec<String> = candidates.iter().map(|s| s.base_name()).collect();
        let bytes: u64 = candidates.iter().map(|s| s.filesize()).sum();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| compact(&root, &candidates)));
        let message = match outcome {
            Ok(Ok(base)) => Command::CompactionDone {
                gen,
                base,
                old,
                bytes,
            },
            Ok(Err(e)) => {
                error!("compaction failed: {}", e);
                Command::CompactionFailed {
                    gen,
                    error: e.to_string(),
                }
            }
            Err(_) => {
                error!("compaction task panicked");
                Command::CompactionFailed {
                    gen,
                    error: "compaction task panicked".to_owned(),
                }
            }
        };
        let _ = commands.send(message);
    });
}

fn compact(root: &PathBuf, candidates: &[Arc<Segment>]) -> Result<PathBuf> {
    let base = flags::segment_base(root, &output_id());
    info!(
        "compacting {} segments into {:?}",
        candidates.len(),
        base
    );
    let started = SystemTime::now();

    flags::set_deleteme(&base)?;
    let mut writer = SegmentWriter::create(&base)?;
    let sources = candidates.iter().map(|s| s.iter()).collect();
    writer.write_iter(merge::merge(sources))?;
    writer.finish()?;

    debug!(
        "compaction into {:?} finished after {:?}",
        base,
        started.elapsed().unwrap_or_default()
    );
    Ok(base)
}

/// Digest-based id for a compaction output, unique across retries.
fn output_id() -> FileId {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let nonce: u64 = rand::thread_rng().gen();

    let mut hasher = Md5::new();
    hasher.update(now.as_nanos().to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    FileId::Hex(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::Posting;
    use crate::segment::SegmentWriter;
    use tempfile::TempDir;

    fn segment_of_size(dir: &TempDir, id: u64, bytes: usize) -> Arc<Segment> {
        let base = dir.path().join(format!("segment.{}", id));
        let mut writer = SegmentWriter::create(&base).unwrap();
        let mut written = 0usize;
        let mut n = 0u64;
        while written < bytes {
            let posting = Posting {
                index: b"i".to_vec(),
                field: b"f".to_vec(),
                term: format!("t{}", id).into_bytes(),
                value: format!("d{:06}", n).into_bytes(),
                timestamp: n,
                props: Some(vec![b'x'; 64]),
            };
            written += 160; // rough per-posting footprint
            n += 1;
            writer.write(posting.into_entry()).unwrap();
        }
        writer.finish().unwrap();
        Arc::new(Segment::open(&base).unwrap())
    }

    #[test]
    fn plan_skips_two_or_fewer_candidates() {
        let dir = TempDir::new().unwrap();
        let segments = vec![segment_of_size(&dir, 1, 500), segment_of_size(&dir, 2, 500)];
        assert!(plan(&segments, 20).is_empty());
        assert!(plan(&[], 20).is_empty());
    }

    #[test]
    fn plan_prefers_small_segments_and_caps() {
        let dir = TempDir::new().unwrap();
        let mut segments = vec![
            segment_of_size(&dir, 1, 500),
            segment_of_size(&dir, 2, 500),
            segment_of_size(&dir, 3, 500),
            segment_of_size(&dir, 4, 200_000),
        ];
        let picked = plan(&segments, 20);
        // the large segment sits above the small-biased average
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|s| s.filesize() < 100_000));

        segments.push(segment_of_size(&dir, 5, 500));
        let capped = plan(&segments, 3);
        assert_eq!(capped.len(), 3);
    }

    #[test]
    fn output_ids_are_hex_and_distinct() {
        match (output_id(), output_id()) {
            (FileId::Hex(a), FileId::Hex(b)) => {
                assert_eq!(a.len(), 32);
                assert_ne!(a, b);
            }
            other => panic!("unexpected ids {:?}", other),
        }
    }
}
