//! The in-memory write absorber and its write-ahead log.
//!
//! A buffer keeps postings in a sorted map and appends every accepted write
//! to a sidecar `buffer.N` log before acknowledging it, so an unconverted
//! buffer survives a crash and is rebuilt by replay on the next open. The
//! log is a stream of JSON-encoded postings in arrival order; sortedness
//! lives only in memory.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use log::{debug, warn};
use serde_json::Deserializer;

use crate::bufio::BufWriterWithPos;
use crate::merge::EntryIter;
use crate::posting::{Entry, EntryKey, Key, Posting, Props};
use crate::{MindexError, Result};

pub(crate) struct Buffer {
    id: u64,
    path: PathBuf,
    tree: RwLock<BTreeMap<EntryKey, Props>>,
    /// `None` once the buffer is sealed.
    log: Mutex<Option<BufWriterWithPos<File>>>,
    filesize: AtomicU64,
}

impl Buffer {
    /// Open the log at `path`, replaying it if it already has content.
    ///
    /// A torn record at the tail (crash mid-append, before the write was
    /// acknowledged) is truncated away; everything before it is kept.
    pub fn open(path: impl Into<PathBuf>, id: u64) -> Result<Buffer> {
        let path = path.into();
        let mut tree = BTreeMap::new();
        let mut valid = 0u64;

        if path.exists() {
            let file = File::open(&path)?;
            let mut stream =
                Deserializer::from_reader(BufReader::new(file)).into_iter::<Posting>();
            let mut replayed = 0usize;
            while let Some(next) = stream.next() {
                match next {
                    Ok(posting) => {
                        let (key, props) = posting.into_entry();
                        tree.insert(key, props);
                        replayed += 1;
                        valid = stream.byte_offset() as u64;
                    }
                    Err(e) => {
                        warn!(
                            "truncating torn tail of {:?} after {} bytes: {}",
                            path, valid, e
                        );
                        break;
                    }
                }
            }
            if replayed > 0 {
                debug!("replayed {} postings from {:?}", replayed, path);
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() > valid {
            file.set_len(valid)?;
        }
        let end = file.seek(SeekFrom::End(0))?;
        let writer = BufWriterWithPos::new(file)?;

        Ok(Buffer {
            id,
            path,
            tree: RwLock::new(tree),
            log: Mutex::new(Some(writer)),
            filesize: AtomicU64::new(end),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filename of the log, e.g. `buffer.7`.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Append a batch. Every posting is persisted to the log before this
    /// returns; the in-memory map is updated afterwards.
    pub fn write(&self, postings: &[Posting]) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        let writer = log.as_mut().ok_or(MindexError::BufferSealed(self.id))?;
        for posting in postings {
            serde_json::to_writer(&mut *writer, posting)?;
        }
        writer.flush()?;
        self.filesize.store(writer.pos, Ordering::SeqCst);

        let mut tree = self.tree.write().unwrap();
        for posting in postings {
            let (key, props) = posting.clone().into_entry();
            tree.insert(key, props);
        }
        Ok(())
    }

    /// Bytes on disk in the log.
    pub fn filesize(&self) -> u64 {
        self.filesize.load(Ordering::SeqCst)
    }

    /// Number of distinct entries held.
    pub fn len(&self) -> usize {
        self.tree.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().unwrap().is_empty()
    }

    /// Count of entries under `key`.
    pub fn info(&self, key: &Key) -> u64 {
        let tree = self.tree.read().unwrap();
        tree.range(EntryKey::lower_bound(key)..)
            .take_while(|(entry, _)| entry.matches(key))
            .count() as u64
    }

    /// Sorted snapshot of every entry.
    pub fn iter(&self) -> EntryIter {
        let entries: Vec<Entry> = self
            .tree
            .read()
            .unwrap()
            .iter()
            .map(|(key, props)| (key.clone(), props.clone()))
            .collect();
        Box::new(entries.into_iter().map(Ok))
    }

    /// Sorted snapshot of the entries under `key`.
    pub fn iter_key(&self, key: &Key) -> EntryIter {
        let tree = self.tree.read().unwrap();
        let entries: Vec<Entry> = tree
            .range(EntryKey::lower_bound(key)..)
            .take_while(|(entry, _)| entry.matches(key))
            .map(|(entry, props)| (entry.clone(), props.clone()))
            .collect();
        Box::new(entries.into_iter().map(Ok))
    }

    /// Sorted snapshot of the entries whose term lies in `[start, end]`,
    /// covering at most `size` distinct terms when given.
    pub fn iter_range(
        &self,
        index: &[u8],
        field: &[u8],
        start: &[u8],
        end: &[u8],
        size: Option<usize>,
    ) -> EntryIter {
        let from = EntryKey::lower_bound(&Key::new(index, field, start));
        let tree = self.tree.read().unwrap();

        let mut entries: Vec<Entry> = Vec::new();
        let mut current_term: Option<&[u8]> = None;
        let mut terms_seen = 0usize;
        for (entry, props) in tree.range(from..) {
            if entry.index != index || entry.field != field || entry.term.as_slice() > end {
                break;
            }
            if current_term != Some(entry.term.as_slice()) {
                terms_seen += 1;
                if size.map_or(false, |cap| terms_seen > cap) {
                    break;
                }
                current_term = Some(entry.term.as_slice());
            }
            entries.push((entry.clone(), props.clone()));
        }
        Box::new(entries.into_iter().map(Ok))
    }

    /// Flush and close the log. The in-memory map stays queryable, but any
    /// later [`write`](Buffer::write) fails.
    pub fn close_filehandle(&self) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        if let Some(mut writer) = log.take() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Erase the log file.
    pub fn delete(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}
