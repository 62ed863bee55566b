#![forbid(unsafe_code)]

//! Error types shared by every layer of the journal.

/// Errors produced by the journal, the flush engine and their collaborators.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    /// Underlying operating-system I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The local cache file holds data that cannot be a valid journal.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller broke an API contract.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Reading journaled bytes back from the local cache file failed or came up short.
    #[error("local read at {offset} returned {read} of {expected} bytes")]
    LocalRead {
        /// Offset in the local cache file.
        offset: u64,
        /// Bytes requested.
        expected: usize,
        /// Bytes actually read before EOF or the error.
        read: usize,
    },
    /// An asynchronous remote write completed with a failure status.
    #[error("remote write of {len} bytes at {offset} failed")]
    RemoteWrite {
        /// Remote offset of the write.
        offset: u64,
        /// Length of the write.
        len: usize,
    },
    /// The remote truncate call failed.
    #[error("remote truncate to {size} failed")]
    RemoteTruncate {
        /// Requested remote file size.
        size: u64,
    },
    /// The remote refused a write before any completion could be attached.
    #[error("remote write at {offset} was rejected on submission")]
    ImmediateSubmission {
        /// Remote offset of the rejected write.
        offset: u64,
    },
    /// An interval with the same lower bound is already stored.
    #[error("interval with the same lower bound already present")]
    DuplicateInterval,
    /// Internal red-black tree bookkeeping is inconsistent.
    #[error("red-black tree invariant violated: {0}")]
    TreeInvariant(&'static str),
    /// At least one operation of a flush cycle failed.
    #[error("flush failed")]
    FlushFailed,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SombraError>;
