//! Background worker that freezes sealed buffers into segments.
//!
//! The converter owns a task queue and runs on its own thread. It never
//! touches coordinator state: each finished conversion is reported back as
//! a message carrying the buffer id and the new segment's base path, and
//! the coordinator performs the visibility swap. A failed task leaves the
//! buffer in place; the coordinator re-queues leftovers whenever a
//! converter registers.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::buffer::Buffer;
use crate::flags::{self, FileId};
use crate::segment::{self, SegmentWriter};
use crate::store::Command;
use crate::Result;

pub(crate) struct ConvertTask {
    pub buffer: Arc<Buffer>,
    /// Store epoch the buffer belongs to; bumped by `drop`-style resets so
    /// a conversion that outlives its epoch is discarded instead of
    /// swapping against a reused buffer id.
    pub epoch: u64,
}

/// Spawn the converter thread. It registers its queue with the coordinator
/// through `commands` before consuming tasks, and exits when the
/// coordinator drops the queue sender.
pub(crate) fn spawn(root: PathBuf, commands: Sender<Command>) -> JoinHandle<()> {
    thread::spawn(move || {
        let (queue, tasks) = mpsc::channel::<ConvertTask>();
        if commands
            .send(Command::ConverterRegistered { queue })
            .is_err()
        {
            return;
        }

        while let Ok(task) = tasks.recv() {
            let buffer = task.buffer;
            let id = buffer.id();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| convert(&root, &buffer)));
            match outcome {
                Ok(Ok(base)) => {
                    if commands
                        .send(Command::ConvertDone {
                            buffer_id: id,
                            base,
                            epoch: task.epoch,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Err(e)) => error!("conversion of buffer.{} failed: {}", id, e),
                Err(_) => error!("conversion of buffer.{} panicked", id),
            }
        }
    })
}

/// Write `buffer`'s sorted entries into a fresh `segment.<id>` family. The
/// deleteme flag goes down first so a crash mid-write leaves only
/// sweepable garbage.
fn convert(root: &PathBuf, buffer: &Buffer) -> Result<PathBuf> {
    let base = flags::segment_base(root, &FileId::Seq(buffer.id()));
    if segment::data_path(&base).exists() && !flags::has_deleteme(&base) {
        // a prior session finished this conversion but crashed before the
        // buffer swap; reuse the finished segment as-is
        debug!("buffer.{} already converted at {:?}", buffer.id(), base);
        return Ok(base);
    }
    debug!(
        "converting buffer.{} ({} entries) to {:?}",
        buffer.id(),
        buffer.len(),
        base
    );

    flags::set_deleteme(&base)?;
    let mut writer = SegmentWriter::create(&base)?;
    writer.write_buffer(buffer)?;
    writer.finish()?;
    Ok(base)
}
