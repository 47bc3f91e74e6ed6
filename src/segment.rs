//! Immutable on-disk sorted posting files.
//!
//! A segment is a family of files under one base name: `<base>.data` holds
//! the postings as a JSON stream in composite-key order, `<base>.offsets`
//! holds a per-key table locating each key's run of postings. The data file
//! is laid out in blocks of roughly [`BLOCK_SIZE`] bytes; small keys share
//! a block while a key that fills a block alone is recorded as *exclusive*.
//! A key's `info` weight is its block size when exclusive and zero
//! otherwise, which the query planner upstream uses as a coarse
//! selectivity estimate.
//!
//! Segments are written once, fsynced, then only ever opened read-only.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Deserializer;

use crate::bufio::{BufReaderWithPos, BufWriterWithPos};
use crate::buffer::Buffer;
use crate::flags::{self, FileId};
use crate::merge::EntryIter;
use crate::posting::{Entry, Key, Posting};
use crate::{MindexError, Result};

/// Target byte size of a data-file block.
const BLOCK_SIZE: u64 = 32 * 1024;

pub(crate) fn data_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".data");
    PathBuf::from(name)
}

fn offsets_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".offsets");
    PathBuf::from(name)
}

/// Location of one key's postings inside the data file.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct KeyInfo {
    offset: u64,
    len: u64,
    count: u64,
    weight: u64,
}

/// A read-only segment handle.
pub(crate) struct Segment {
    base: PathBuf,
    id: FileId,
    offsets: std::collections::BTreeMap<Key, KeyInfo>,
    filesize: u64,
}

impl Segment {
    /// Open the segment family at `base` read-only.
    pub fn open(base: impl Into<PathBuf>) -> Result<Segment> {
        let base = base.into();
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = flags::parse_id(&name)
            .ok_or_else(|| MindexError::StringError(format!("bad segment name {:?}", name)))?;

        let table: Vec<(Key, KeyInfo)> =
            serde_json::from_reader(BufReader::new(File::open(offsets_path(&base))?))?;
        let filesize = File::open(data_path(&base))?.metadata()?.len();

        Ok(Segment {
            base,
            id,
            offsets: table.into_iter().collect(),
            filesize,
        })
    }

    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Base filename, e.g. `segment.7`.
    pub fn base_name(&self) -> String {
        self.base
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Bytes in the data file.
    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    /// The selectivity weight of `key`: its block size in bytes when the
    /// key occupies its block alone, zero otherwise (or when absent).
    pub fn info(&self, key: &Key) -> u64 {
        self.offsets.get(key).map_or(0, |info| info.weight)
    }

    /// Stream every posting in composite-key order.
    pub fn iter(&self) -> EntryIter {
        match File::open(data_path(&self.base)) {
            Ok(file) => Box::new(
                Deserializer::from_reader(BufReader::new(file))
                    .into_iter::<Posting>()
                    .map(|res| res.map(Posting::into_entry).map_err(MindexError::from)),
            ),
            Err(e) => Box::new(std::iter::once(Err(e.into()))),
        }
    }

    /// Stream the postings under `key`.
    pub fn iter_key(&self, key: &Key) -> EntryIter {
        let info = match self.offsets.get(key) {
            Some(info) => info.clone(),
            None => return Box::new(std::iter::empty()),
        };
        run_iter(data_path(&self.base), &[(info.offset, info.len)])
    }

    /// Erase the whole segment family.
    pub fn delete(&self) -> Result<()> {
        flags::delete_family(&self.base)
    }

    /// Stream the postings whose term lies in `[start, end]`, covering at
    /// most `size` distinct terms when given.
    pub fn iter_range(
        &self,
        index: &[u8],
        field: &[u8],
        start: &[u8],
        end: &[u8],
        size: Option<usize>,
    ) -> EntryIter {
        let from = Key::new(index, field, start);
        let mut runs = Vec::new();
        for (key, info) in self.offsets.range(from..) {
            if key.index != index || key.field != field || key.term.as_slice() > end {
                break;
            }
            if size.map_or(false, |cap| runs.len() >= cap) {
                break;
            }
            runs.push((info.offset, info.len));
        }
        run_iter(data_path(&self.base), &runs)
    }
}

/// Lazily stream the postings of the given `(offset, len)` runs. One run is
/// loaded at a time; runs are visited in table order, which is key order.
fn run_iter(path: PathBuf, runs: &[(u64, u64)]) -> EntryIter {
    let runs = runs.to_vec();
    let mut reader: Option<BufReaderWithPos<File>> = None;

    Box::new(runs.into_iter().flat_map(move |(offset, len)| {
        let mut load = || -> Result<Vec<u8>> {
            if reader.is_none() {
                reader = Some(BufReaderWithPos::new(File::open(&path)?)?);
            }
            let r = reader.as_mut().expect("reader opened");
            if r.pos != offset {
                r.seek(SeekFrom::Start(offset))?;
            }
            let mut bytes = vec![0u8; len as usize];
            r.read_exact(&mut bytes)?;
            Ok(bytes)
        };
        let parsed: EntryIter = match load() {
            Ok(bytes) => Box::new(
                Deserializer::from_reader(io::Cursor::new(bytes))
                    .into_iter::<Posting>()
                    .map(|res| res.map(Posting::into_entry).map_err(MindexError::from)),
            ),
            Err(e) => Box::new(std::iter::once(Err(e))),
        };
        parsed
    }))
}

struct PendingKey {
    key: Key,
    offset: u64,
    len: u64,
    count: u64,
}

/// Writes a segment family. Input entries must arrive in composite-key
/// order; [`SegmentWriter::finish`] persists the offsets table.
pub(crate) struct SegmentWriter {
    base: PathBuf,
    out: BufWriterWithPos<File>,
    entries: Vec<(Key, KeyInfo)>,
    pending: Option<PendingKey>,
    block_start: u64,
    block_first_entry: usize,
}

impl SegmentWriter {
    /// Create the data file at `<base>.data`. Fails if it already exists.
    pub fn create(base: impl Into<PathBuf>) -> Result<SegmentWriter> {
        let base = base.into();
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(data_path(&base))?;
        Ok(SegmentWriter {
            base,
            out: BufWriterWithPos::new(file)?,
            entries: Vec::new(),
            pending: None,
            block_start: 0,
            block_first_entry: 0,
        })
    }

    /// Append one entry.
    pub fn write(&mut self, entry: Entry) -> Result<()> {
        let (key, props) = entry;
        let same_key = self
            .pending
            .as_ref()
            .map_or(false, |p| key.matches(&p.key));
        if !same_key {
            self.finish_key();
            if self.out.pos - self.block_start >= BLOCK_SIZE {
                self.finish_block();
            }
            self.pending = Some(PendingKey {
                key: Key::new(&key.index, &key.field, &key.term),
                offset: self.out.pos,
                len: 0,
                count: 0,
            });
        }

        let before = self.out.pos;
        let posting = Posting::from_entry(key, props);
        serde_json::to_writer(&mut self.out, &posting)?;
        let pending = self.pending.as_mut().expect("pending key set");
        pending.len += self.out.pos - before;
        pending.count += 1;
        Ok(())
    }

    /// Drain `buffer`'s sorted entries into the segment.
    pub fn write_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        self.write_iter(buffer.iter())
    }

    /// Drain an ordered entry stream into the segment.
    pub fn write_iter(&mut self, iter: EntryIter) -> Result<()> {
        for entry in iter {
            self.write(entry?)?;
        }
        Ok(())
    }

    fn finish_key(&mut self) {
        if let Some(p) = self.pending.take() {
            self.entries.push((
                p.key,
                KeyInfo {
                    offset: p.offset,
                    len: p.len,
                    count: p.count,
                    weight: 0,
                },
            ));
        }
    }

    fn finish_block(&mut self) {
        let block_len = self.out.pos - self.block_start;
        if self.entries.len() - self.block_first_entry == 1 {
            self.entries
                .last_mut()
                .expect("block has an entry")
                .1
                .weight = block_len;
        }
        self.block_start = self.out.pos;
        self.block_first_entry = self.entries.len();
    }

    /// Flush and fsync the data file, then write the offsets table.
    pub fn finish(mut self) -> Result<()> {
        self.finish_key();
        if self.out.pos > self.block_start {
            self.finish_block();
        }
        self.out.flush()?;
        self.out.get_ref().sync_all()?;

        let offsets = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(offsets_path(&self.base))?;
        let mut writer = BufWriter::new(offsets);
        serde_json::to_writer(&mut writer, &self.entries)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(term: &[u8], value: &[u8], timestamp: u64, props: Option<&[u8]>) -> Entry {
        Posting {
            index: b"idx".to_vec(),
            field: b"fld".to_vec(),
            term: term.to_vec(),
            value: value.to_vec(),
            timestamp,
            props: props.map(|p| p.to_vec()),
        }
        .into_entry()
    }

    fn write_segment(base: &Path, entries: Vec<Entry>) -> Segment {
        let mut writer = SegmentWriter::create(base).unwrap();
        writer
            .write_iter(Box::new(entries.into_iter().map(Ok)))
            .unwrap();
        writer.finish().unwrap();
        Segment::open(base).unwrap()
    }

    #[test]
    fn round_trips_sorted_entries() {
        let dir = TempDir::new().unwrap();
        let segment = write_segment(
            &dir.path().join("segment.1"),
            vec![
                entry(b"a", b"d1", 2, Some(b"p1")),
                entry(b"a", b"d1", 1, Some(b"p0")),
                entry(b"b", b"d2", 5, None),
            ],
        );

        assert!(segment.filesize() > 0);
        assert_eq!(segment.base_name(), "segment.1");

        let all: Vec<Entry> = segment.iter().map(|e| e.unwrap()).collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0.timestamp, 2);
        assert_eq!(all[2].1, None);

        let keyed: Vec<Entry> = segment
            .iter_key(&Key::new(b"idx", b"fld", b"a"))
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(keyed.len(), 2);
        assert!(segment
            .iter_key(&Key::new(b"idx", b"fld", b"zz"))
            .next()
            .is_none());
    }

    #[test]
    fn shared_block_keys_weigh_zero() {
        let dir = TempDir::new().unwrap();
        let segment = write_segment(
            &dir.path().join("segment.2"),
            vec![
                entry(b"a", b"d1", 1, Some(b"p")),
                entry(b"b", b"d1", 1, Some(b"p")),
            ],
        );
        assert_eq!(segment.info(&Key::new(b"idx", b"fld", b"a")), 0);
        assert_eq!(segment.info(&Key::new(b"idx", b"fld", b"b")), 0);
        assert_eq!(segment.info(&Key::new(b"idx", b"fld", b"missing")), 0);
    }

    #[test]
    fn exclusive_key_weighs_its_block() {
        let dir = TempDir::new().unwrap();
        // one key large enough to fill a block alone, then a second key
        let mut entries = Vec::new();
        let fat = vec![b'x'; 600];
        for i in 0..64u64 {
            entries.push(entry(
                b"big",
                format!("doc{:04}", i).as_bytes(),
                i,
                Some(fat.as_slice()),
            ));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        // two trailing keys so the final block is shared
        entries.push(entry(b"tail", b"d1", 1, Some(b"p")));
        entries.push(entry(b"tail2", b"d1", 1, Some(b"p")));

        let segment = write_segment(&dir.path().join("segment.3"), entries);
        let weight = segment.info(&Key::new(b"idx", b"fld", b"big"));
        assert!(weight >= BLOCK_SIZE, "weight {}", weight);
        assert_eq!(segment.info(&Key::new(b"idx", b"fld", b"tail")), 0);
        assert_eq!(segment.info(&Key::new(b"idx", b"fld", b"tail2")), 0);
    }

    #[test]
    fn range_respects_bounds_and_term_cap() {
        let dir = TempDir::new().unwrap();
        let segment = write_segment(
            &dir.path().join("segment.4"),
            vec![
                entry(b"a", b"d1", 1, Some(b"p")),
                entry(b"b", b"d1", 1, Some(b"p")),
                entry(b"b", b"d2", 1, Some(b"p")),
                entry(b"c", b"d1", 1, Some(b"p")),
                entry(b"d", b"d1", 1, Some(b"p")),
            ],
        );

        let bounded: Vec<Entry> = segment
            .iter_range(b"idx", b"fld", b"b", b"c", None)
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(bounded.len(), 3);

        let capped: Vec<Entry> = segment
            .iter_range(b"idx", b"fld", b"a", b"d", Some(2))
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(capped.len(), 3); // a(1) + b(2)
    }
}
