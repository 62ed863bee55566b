//! Low-level primitives the journal is built from.
//!
//! Includes positioned file I/O for the local cache file and the completion
//! tracking used while a flush waits on the remote side.

/// Completion tracking for asynchronous operations.
///
/// Join-all aggregation of success/failure reports arriving from arbitrary threads.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Positioned reads and writes on the local cache file.
pub mod io;
