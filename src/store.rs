//! The coordinator state machine and the public store handle.
//!
//! All mutation of buffer, segment, lock and compaction state happens on a
//! single dedicated thread that drains a command channel, one message at a
//! time. The public [`MergeIndex`] handle is a cheap clone that sends
//! commands and waits for replies; background workers (converter,
//! compactor, stream readers) report back over the same channel, so the
//! coordinator never races itself.

use std::collections::HashMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};

use crate::buffer::Buffer;
use crate::compactor;
use crate::config::Config;
use crate::converter::{self, ConvertTask};
use crate::flags::{self, FileId};
use crate::locks::Locks;
use crate::merge::{self, EntryIter};
use crate::posting::{Key, Posting};
use crate::segment::Segment;
use crate::{MindexError, Result};

/// Postings per stream delivery message.
const STREAM_BATCH: usize = 1000;

/// One delivered posting: `(value, props)`.
pub type StreamEntry = (Vec<u8>, Vec<u8>);

/// Messages delivered to a stream client.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamItem {
    /// Up to 1000 postings in stream order.
    Batch(Vec<StreamEntry>),
    /// End-of-stream sentinel; always the final message, even after a
    /// reader failure.
    Done,
}

/// The bounded channel end a stream reader delivers into. A client that
/// stops draining it blocks the reader, not the store.
pub type StreamSink = SyncSender<StreamItem>;

/// Per-posting predicate applied before delivery: `filter(value, props)`.
pub type StreamFilter = Box<dyn Fn(&[u8], &[u8]) -> bool + Send>;

pub(crate) enum Command {
    Index {
        postings: Vec<Posting>,
        reply: Sender<Result<()>>,
    },
    Info {
        key: Key,
        reply: Sender<Result<u64>>,
    },
    Stream {
        key: Key,
        sink: StreamSink,
        filter: Option<StreamFilter>,
        reply: Sender<Result<()>>,
    },
    Range {
        index: Vec<u8>,
        field: Vec<u8>,
        start: Vec<u8>,
        end: Vec<u8>,
        size: Option<usize>,
        sink: StreamSink,
        filter: Option<StreamFilter>,
        reply: Sender<Result<()>>,
    },
    Fold {
        out: SyncSender<Posting>,
        reply: Sender<Result<()>>,
    },
    IsEmpty {
        reply: Sender<Result<bool>>,
    },
    Clear {
        reply: Sender<Result<()>>,
    },
    Compact {
        reply: Sender<Result<(usize, u64)>>,
    },
    ConverterRegistered {
        queue: Sender<ConvertTask>,
    },
    ConvertDone {
        buffer_id: u64,
        base: PathBuf,
        epoch: u64,
    },
    CompactionDone {
        gen: u64,
        base: PathBuf,
        old: Vec<String>,
        bytes: u64,
    },
    CompactionFailed {
        gen: u64,
        error: String,
    },
    StreamExit {
        id: u64,
    },
    Shutdown,
}

/// Handle to a merge-index store.
///
/// Clones share the same store; the coordinator shuts down when the last
/// clone is dropped.
#[derive(Clone)]
pub struct MergeIndex {
    commands: Sender<Command>,
    _shutdown: Arc<ShutdownGuard>,
}

struct ShutdownGuard {
    commands: Sender<Command>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.coordinator.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl MergeIndex {
    /// Open (or create) the store rooted at `root`.
    ///
    /// Runs the startup sweep first: flagged file families are deleted,
    /// surviving segments are opened read-only, surviving buffer logs are
    /// replayed, and every non-head buffer is queued for conversion.
    pub fn open(root: impl Into<PathBuf>, config: Config) -> Result<MergeIndex> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        flags::sweep(&root)?;

        let (commands, inbox) = mpsc::channel();
        let converter = converter::spawn(root.clone(), commands.clone());
        let store = Store::recover(root, config, commands.clone(), converter)?;

        let coordinator = thread::spawn(move || store.run(inbox));
        Ok(MergeIndex {
            commands: commands.clone(),
            _shutdown: Arc::new(ShutdownGuard {
                commands,
                coordinator: Mutex::new(Some(coordinator)),
            }),
        })
    }

    fn call<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| MindexError::Closed)?;
        response.recv().map_err(|_| MindexError::Closed)?
    }

    /// Append a batch of postings. Each posting is durable in the head
    /// buffer's log when this returns.
    pub fn index(&self, postings: Vec<Posting>) -> Result<()> {
        self.call(|reply| Command::Index { postings, reply })
    }

    /// Sum the per-source selectivity estimates for a term: entry counts
    /// from buffers plus block weights from segments. The scalar is a
    /// coarse, heterogeneous planning quantity, not a posting count.
    pub fn info(&self, index: &[u8], field: &[u8], term: &[u8]) -> Result<u64> {
        let key = Key::new(index, field, term);
        self.call(|reply| Command::Info { key, reply })
    }

    /// Stream the deduplicated postings of one term into `sink`.
    ///
    /// The reader works over a point-in-time snapshot of the store's
    /// files, delivers batches of up to 1000 `(value, props)` pairs, and
    /// finishes with [`StreamItem::Done`].
    pub fn stream(
        &self,
        index: &[u8],
        field: &[u8],
        term: &[u8],
        sink: StreamSink,
        filter: Option<StreamFilter>,
    ) -> Result<()> {
        let key = Key::new(index, field, term);
        self.call(|reply| Command::Stream {
            key,
            sink,
            filter,
            reply,
        })
    }

    /// Stream every term in `[start, end]` for a field, in term order,
    /// with the same delivery contract as [`MergeIndex::stream`]. `size`
    /// bounds the number of distinct terms taken from each source.
    #[allow(clippy::too_many_arguments)]
    pub fn range(
        &self,
        index: &[u8],
        field: &[u8],
        start: &[u8],
        end: &[u8],
        size: Option<usize>,
        sink: StreamSink,
        filter: Option<StreamFilter>,
    ) -> Result<()> {
        let (index, field) = (index.to_vec(), field.to_vec());
        let (start, end) = (start.to_vec(), end.to_vec());
        self.call(|reply| Command::Range {
            index,
            field,
            start,
            end,
            size,
            sink,
            filter,
            reply,
        })
    }

    /// Fold over every posting in the store, including duplicates and
    /// tombstones.
    ///
    /// This traverses synchronously on the coordinator thread and blocks
    /// all other operations; it is an administrative slow path.
    pub fn fold<B, F>(&self, init: B, mut f: F) -> Result<B>
    where
        F: FnMut(B, Posting) -> B,
    {
        let (out, postings) = mpsc::sync_channel(0);
        let (reply, done) = mpsc::channel();
        self.commands
            .send(Command::Fold { out, reply })
            .map_err(|_| MindexError::Closed)?;

        let mut acc = init;
        for posting in postings {
            acc = f(acc, posting);
        }
        done.recv().map_err(|_| MindexError::Closed)??;
        Ok(acc)
    }

    /// True iff every buffer is empty and no segments exist.
    pub fn is_empty(&self) -> Result<bool> {
        self.call(|reply| Command::IsEmpty { reply })
    }

    /// Delete every buffer and segment and reset to a single empty head
    /// buffer with id 1.
    ///
    /// In-flight streams are invalidated: their snapshot files are
    /// unlinked immediately. Readers keep working off open handles where
    /// the platform allows it, but callers should quiesce streams first.
    pub fn clear(&self) -> Result<()> {
        self.call(|reply| Command::Clear { reply })
    }

    /// Request a compaction run. Replies with the number of segments
    /// merged and their total byte size; `(0, 0)` when fewer than three
    /// candidates exist or a compaction is already in flight.
    pub fn compact(&self) -> Result<(usize, u64)> {
        self.call(|reply| Command::Compact { reply })
    }
}

struct PendingCompaction {
    gen: u64,
    requester: Option<Sender<Result<(usize, u64)>>>,
}

enum Query {
    Key(Key),
    Range {
        index: Vec<u8>,
        field: Vec<u8>,
        start: Vec<u8>,
        end: Vec<u8>,
        size: Option<usize>,
    },
}

struct Store {
    root: PathBuf,
    config: Config,
    commands: Sender<Command>,
    locks: Locks,
    /// Head buffer last; every earlier buffer is sealed.
    buffers: Vec<Arc<Buffer>>,
    /// Newest first.
    segments: Vec<Arc<Segment>>,
    next_id: u64,
    rollover: u64,
    compacting: Option<PendingCompaction>,
    compaction_gen: u64,
    /// Bumped by `clear`; conversions started before a reset are stale.
    epoch: u64,
    converter: Option<Sender<ConvertTask>>,
    converter_thread: Option<JoinHandle<()>>,
    streams: HashMap<u64, Vec<String>>,
    next_stream_id: u64,
    stopped: bool,
}

impl Store {
    /// Startup steps two and three: open surviving segments read-only and
    /// rebuild the buffer list from surviving logs.
    fn recover(
        root: PathBuf,
        config: Config,
        commands: Sender<Command>,
        converter_thread: JoinHandle<()>,
    ) -> Result<Store> {
        let mut segments = Vec::new();
        for (_, base) in flags::list_segment_bases(&root)? {
            segments.push(Arc::new(Segment::open(base)?));
        }
        segments.sort_by(|a, b| b.id().cmp(a.id()));

        let logs = flags::list_buffer_logs(&root)?;
        let mut buffers = Vec::new();
        if logs.is_empty() {
            let id = max_sequential_id(&segments) + 1;
            buffers.push(Arc::new(Buffer::open(flags::buffer_path(&root, id), id)?));
        } else {
            let head_idx = logs.len() - 1;
            for (i, (id, path)) in logs.into_iter().enumerate() {
                let buffer = Arc::new(Buffer::open(path, id)?);
                if i < head_idx {
                    buffer.close_filehandle()?;
                }
                buffers.push(buffer);
            }
        }
        let next_id = buffers.last().expect("head buffer").id() + 1;
        let rollover = config.fuzzed_rollover();

        debug!(
            "recovered store at {:?}: {} segments, {} buffers, next id {}",
            root,
            segments.len(),
            buffers.len(),
            next_id
        );

        Ok(Store {
            root,
            config,
            commands,
            locks: Locks::new(),
            buffers,
            segments,
            next_id,
            rollover,
            compacting: None,
            compaction_gen: 0,
            epoch: 0,
            converter: None,
            converter_thread: Some(converter_thread),
            streams: HashMap::new(),
            next_stream_id: 0,
            stopped: false,
        })
    }

    fn run(mut self, inbox: Receiver<Command>) {
        while !self.stopped {
            match inbox.recv() {
                Ok(command) => self.dispatch(command),
                Err(_) => break,
            }
        }
        // dropping the inbox (and with it any queued registration message
        // holding the task-queue sender) is what lets the converter's
        // recv loop end, so it must happen before the join
        drop(inbox);
        self.converter = None;
        if let Some(handle) = self.converter_thread.take() {
            let _ = handle.join();
        }
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Index { postings, reply } => {
                let _ = reply.send(self.do_index(postings));
            }
            Command::Info { key, reply } => {
                let _ = reply.send(Ok(self.do_info(&key)));
            }
            Command::Stream {
                key,
                sink,
                filter,
                reply,
            } => {
                self.spawn_reader(Query::Key(key), sink, filter);
                let _ = reply.send(Ok(()));
            }
            Command::Range {
                index,
                field,
                start,
                end,
                size,
                sink,
                filter,
                reply,
            } => {
                self.spawn_reader(
                    Query::Range {
                        index,
                        field,
                        start,
                        end,
                        size,
                    },
                    sink,
                    filter,
                );
                let _ = reply.send(Ok(()));
            }
            Command::Fold { out, reply } => {
                let _ = reply.send(self.do_fold(out));
            }
            Command::IsEmpty { reply } => {
                let empty = self.buffers.iter().all(|b| b.is_empty()) && self.segments.is_empty();
                let _ = reply.send(Ok(empty));
            }
            Command::Clear { reply } => {
                let _ = reply.send(self.do_clear());
            }
            Command::Compact { reply } => self.maybe_compact(Some(reply)),
            Command::ConverterRegistered { queue } => self.on_converter_registered(queue),
            Command::ConvertDone {
                buffer_id,
                base,
                epoch,
            } => self.on_convert_done(buffer_id, base, epoch),
            Command::CompactionDone {
                gen,
                base,
                old,
                bytes,
            } => self.on_compaction_done(gen, base, old, bytes),
            Command::CompactionFailed { gen, error } => self.on_compaction_failed(gen, error),
            Command::StreamExit { id } => self.on_stream_exit(id),
            Command::Shutdown => self.shutdown(),
        }
    }

    fn do_index(&mut self, postings: Vec<Posting>) -> Result<()> {
        let head = self.buffers.last().expect("head buffer").clone();
        head.write(&postings)?;
        if head.filesize() > self.rollover {
            self.roll_head()?;
        }
        Ok(())
    }

    /// Seal the head buffer, hand it to the converter and start a fresh
    /// head with the next id and a re-drawn fuzzed threshold.
    fn roll_head(&mut self) -> Result<()> {
        let head = self.buffers.last().expect("head buffer").clone();
        debug!(
            "sealing buffer.{} at {} bytes (threshold {})",
            head.id(),
            head.filesize(),
            self.rollover
        );
        head.close_filehandle()?;
        self.enqueue_convert(head);

        let id = self.next_id;
        let fresh = Arc::new(Buffer::open(flags::buffer_path(&self.root, id), id)?);
        self.buffers.push(fresh);
        self.next_id += 1;
        self.rollover = self.config.fuzzed_rollover();
        Ok(())
    }

    fn enqueue_convert(&mut self, buffer: Arc<Buffer>) {
        let epoch = self.epoch;
        if let Some(queue) = &self.converter {
            if queue.send(ConvertTask { buffer, epoch }).is_err() {
                // losing the converter means sealed buffers would pile up
                // forever; stop and let the supervisor restart from disk
                error!("buffer converter died; stopping store");
                self.stopped = true;
            }
        }
    }

    fn do_info(&self, key: &Key) -> u64 {
        let from_buffers: u64 = self.buffers.iter().map(|b| b.info(key)).sum();
        let from_segments: u64 = self.segments.iter().map(|s| s.info(key)).sum();
        from_buffers + from_segments
    }

    fn do_fold(&mut self, out: SyncSender<Posting>) -> Result<()> {
        let sources: Vec<EntryIter> = self
            .buffers
            .iter()
            .rev()
            .map(|b| b.iter())
            .chain(self.segments.iter().map(|s| s.iter()))
            .collect();
        for item in merge::merge(sources) {
            let (key, props) = item?;
            if out.send(Posting::from_entry(key, props)).is_err() {
                warn!("fold client went away mid-traversal");
                break;
            }
        }
        Ok(())
    }

    fn do_clear(&mut self) -> Result<()> {
        for buffer in self.buffers.drain(..) {
            buffer.close_filehandle()?;
            buffer.delete()?;
        }
        for segment in self.segments.drain(..) {
            segment.delete()?;
        }
        let head = Arc::new(Buffer::open(flags::buffer_path(&self.root, 1), 1)?);
        self.buffers.push(head);
        self.next_id = 2;
        self.rollover = self.config.fuzzed_rollover();
        // results of work started before the reset are stale: compactions
        // fail their generation check, conversions their epoch check
        self.compacting = None;
        self.epoch += 1;
        Ok(())
    }

    /// Snapshot the current file sets, claim a lock on each file and spawn
    /// the reader thread.
    fn spawn_reader(&mut self, query: Query, sink: StreamSink, filter: Option<StreamFilter>) {
        let buffers = self.buffers.clone();
        let segments = self.segments.clone();

        let mut names: Vec<String> = buffers.iter().map(|b| b.file_name()).collect();
        names.extend(segments.iter().map(|s| s.base_name()));
        for name in &names {
            self.locks.claim(name);
        }

        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.insert(id, names);

        let commands = self.commands.clone();
        thread::spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                run_reader(&buffers, &segments, &query, &sink, filter.as_deref())
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(MindexError::ClientGone)) => debug!("stream {} client went away", id),
                Ok(Err(e)) => error!("stream {} failed: {}", id, e),
                Err(_) => error!("stream {} panicked", id),
            }
            let _ = sink.send(StreamItem::Done);
            let _ = commands.send(Command::StreamExit { id });
        });
    }

    fn on_stream_exit(&mut self, id: u64) {
        if let Some(names) = self.streams.remove(&id) {
            for name in names {
                self.locks.release(&name);
            }
        }
    }

    fn on_converter_registered(&mut self, queue: Sender<ConvertTask>) {
        self.converter = Some(queue);
        // re-queue leftovers from a prior session or a converter restart
        let head_id = self.buffers.last().expect("head buffer").id();
        let sealed: Vec<Arc<Buffer>> = self
            .buffers
            .iter()
            .filter(|b| b.id() != head_id)
            .cloned()
            .collect();
        for buffer in sealed {
            self.enqueue_convert(buffer);
            if self.stopped {
                return;
            }
        }
    }

    fn on_convert_done(&mut self, buffer_id: u64, base: PathBuf, epoch: u64) {
        let pos = match self.buffers.iter().position(|b| b.id() == buffer_id) {
            Some(pos) if epoch == self.epoch => pos,
            _ => {
                // still flagged; the next startup sweep collects it
                warn!(
                    "conversion finished for stale buffer.{}; leaving {:?} flagged",
                    buffer_id, base
                );
                return;
            }
        };

        let swapped = (|| -> Result<()> {
            let segment_name = base
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            // the segment may already be visible when a prior session
            // crashed between flag clear and buffer swap
            if self.segments.iter().all(|s| s.base_name() != segment_name) {
                flags::clear_deleteme(&base)?;
                let segment = Arc::new(Segment::open(&base)?);
                self.segments.insert(0, segment);
            }

            let buffer = self.buffers.remove(pos);
            flags::set_deleteme(buffer.path())?;
            let name = buffer.file_name();
            let path = buffer.path().to_path_buf();
            self.locks.when_free(
                &name,
                Box::new(move || {
                    let _ = flags::delete_family(&path);
                }),
            );
            Ok(())
        })();

        match swapped {
            Ok(()) => self.maybe_compact(None),
            Err(e) => error!("finishing conversion of buffer.{} failed: {}", buffer_id, e),
        }
    }

    fn maybe_compact(&mut self, requester: Option<Sender<Result<(usize, u64)>>>) {
        if self.compacting.is_some() {
            if let Some(reply) = requester {
                let _ = reply.send(Ok((0, 0)));
            }
            return;
        }
        let candidates = compactor::plan(&self.segments, self.config.max_compact_segments);
        if candidates.is_empty() {
            if let Some(reply) = requester {
                let _ = reply.send(Ok((0, 0)));
            }
            return;
        }

        self.compaction_gen += 1;
        self.compacting = Some(PendingCompaction {
            gen: self.compaction_gen,
            requester,
        });
        compactor::spawn(
            self.root.clone(),
            candidates,
            self.commands.clone(),
            self.compaction_gen,
        );
    }

    fn on_compaction_done(&mut self, gen: u64, base: PathBuf, old: Vec<String>, bytes: u64) {
        let current = matches!(&self.compacting, Some(p) if p.gen == gen);
        if !current {
            // still flagged; the next startup sweep collects it
            warn!("ignoring stale compaction output {:?}", base);
            return;
        }
        let pending = self.compacting.take().expect("current compaction");

        let result = (|| -> Result<(usize, u64)> {
            flags::clear_deleteme(&base)?;
            let segment = Arc::new(Segment::open(&base)?);

            for name in &old {
                if let Some(pos) = self.segments.iter().position(|s| s.base_name() == *name) {
                    let consumed = self.segments.remove(pos);
                    flags::set_deleteme(consumed.base())?;
                    let family = consumed.base().to_path_buf();
                    self.locks.when_free(
                        name,
                        Box::new(move || {
                            let _ = flags::delete_family(&family);
                        }),
                    );
                }
            }
            self.segments.insert(0, segment);
            Ok((old.len(), bytes))
        })();

        if let Some(reply) = pending.requester {
            let _ = reply.send(result);
        } else if let Err(e) = result {
            error!("finishing compaction {:?} failed: {}", base, e);
        }
    }

    fn on_compaction_failed(&mut self, gen: u64, message: String) {
        let current = matches!(&self.compacting, Some(p) if p.gen == gen);
        if !current {
            return;
        }
        let pending = self.compacting.take().expect("current compaction");
        if let Some(reply) = pending.requester {
            let _ = reply.send(Err(MindexError::Compaction(message)));
        }
        // the half-written output keeps its deleteme flag; the next
        // startup sweep collects it
    }

    fn shutdown(&mut self) {
        debug!("coordinator shutting down");
        self.stopped = true;
    }
}

fn max_sequential_id(segments: &[Arc<Segment>]) -> u64 {
    segments
        .iter()
        .map(|segment| match segment.id() {
            FileId::Seq(n) => *n,
            FileId::Pair(_, n) => *n,
            FileId::Hex(_) => 0,
        })
        .max()
        .unwrap_or(0)
}

fn build_sources(
    buffers: &[Arc<Buffer>],
    segments: &[Arc<Segment>],
    query: &Query,
) -> Vec<EntryIter> {
    let mut sources: Vec<EntryIter> = Vec::with_capacity(buffers.len() + segments.len());
    // newest first: buffers from the head down, then segments in list
    // order, so merge ties resolve toward the newest write
    for buffer in buffers.iter().rev() {
        sources.push(match query {
            Query::Key(key) => buffer.iter_key(key),
            Query::Range {
                index,
                field,
                start,
                end,
                size,
            } => buffer.iter_range(index, field, start, end, *size),
        });
    }
    for segment in segments {
        sources.push(match query {
            Query::Key(key) => segment.iter_key(key),
            Query::Range {
                index,
                field,
                start,
                end,
                size,
            } => segment.iter_range(index, field, start, end, *size),
        });
    }
    sources
}

/// Reader logic: merge the snapshot, suppress duplicates and tombstones,
/// apply the filter, deliver batches.
fn run_reader(
    buffers: &[Arc<Buffer>],
    segments: &[Arc<Segment>],
    query: &Query,
    sink: &StreamSink,
    filter: Option<&(dyn Fn(&[u8], &[u8]) -> bool + Send)>,
) -> Result<()> {
    let sources = build_sources(buffers, segments, query);
    let mut last: Option<(Vec<u8>, Vec<u8>)> = None;
    let mut batch: Vec<StreamEntry> = Vec::with_capacity(STREAM_BATCH);
    let mut failure = None;

    for item in merge::merge(sources) {
        let (key, props) = match item {
            Ok(entry) => entry,
            Err(e) => {
                failure = Some(e);
                break;
            }
        };
        let duplicate = last
            .as_ref()
            .map_or(false, |(term, value)| *term == key.term && *value == key.value);
        if duplicate {
            continue;
        }
        last = Some((key.term.clone(), key.value.clone()));

        let props = match props {
            Some(props) => props,
            None => continue, // tombstone wins over everything older
        };
        if let Some(predicate) = filter {
            if !predicate(&key.value, &props) {
                continue;
            }
        }
        batch.push((key.value, props));
        if batch.len() >= STREAM_BATCH {
            sink.send(StreamItem::Batch(std::mem::take(&mut batch)))
                .map_err(|_| MindexError::ClientGone)?;
        }
    }

    // the partial batch is delivered even when the merge failed midway
    if !batch.is_empty() {
        sink.send(StreamItem::Batch(batch))
            .map_err(|_| MindexError::ClientGone)?;
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
