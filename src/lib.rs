#![deny(missing_docs)]
//! A log-structured merge-index: a persistent, append-optimized inverted
//! index mapping `(index, field, term)` keys to streams of
//! `(value, timestamp, props)` postings.
//!
//! Writes land in an in-memory buffer backed by a write-ahead log; sealed
//! buffers are frozen into immutable sorted segment files by a background
//! converter, and a background compactor merges small segments together.
//! Readers merge-sort across a point-in-time snapshot of buffers and
//! segments, deduplicating by `(term, value)` so the newest write wins and
//! tombstones hide older postings.
//!
//! ```no_run
//! use std::sync::mpsc;
//! use mindex::{Config, MergeIndex, Posting, StreamItem};
//!
//! fn main() -> mindex::Result<()> {
//!     let store = MergeIndex::open("./data", Config::default())?;
//!     store.index(vec![Posting {
//!         index: b"users".to_vec(),
//!         field: b"name".to_vec(),
//!         term: b"ada".to_vec(),
//!         value: b"doc-1".to_vec(),
//!         timestamp: 1,
//!         props: Some(Vec::new()),
//!     }])?;
//!
//!     let (sink, results) = mpsc::sync_channel(16);
//!     store.stream(b"users", b"name", b"ada", sink, None)?;
//!     for item in results {
//!         match item {
//!             StreamItem::Batch(postings) => println!("{} postings", postings.len()),
//!             StreamItem::Done => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod buffer;
mod bufio;
mod compactor;
mod config;
mod converter;
mod error;
mod flags;
mod locks;
mod merge;
mod posting;
mod segment;
mod store;

pub use config::Config;
pub use error::{MindexError, Result};
pub use posting::{Key, Posting};
pub use store::{MergeIndex, StreamEntry, StreamFilter, StreamItem, StreamSink};
