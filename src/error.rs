use std::io;

use thiserror::Error;

/// Error type for mindex.
#[derive(Error, Debug)]
pub enum MindexError {
    /// IO error
    #[error("{0}")]
    Io(#[from] io::Error),
    /// Serialization or deserialization error.
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Write issued against a buffer whose log filehandle was closed.
    #[error("buffer {0} is sealed")]
    BufferSealed(u64),
    /// Background compaction task failed.
    #[error("compaction failed: {0}")]
    Compaction(String),
    /// The stream client went away before the reader finished.
    #[error("stream client disconnected")]
    ClientGone,
    /// The store's coordinator is no longer running.
    #[error("store is closed")]
    Closed,
    /// Error with a string message
    #[error("{0}")]
    StringError(String),
}

/// Custom result type for MindexError
pub type Result<T> = std::result::Result<T, MindexError>;
