#![forbid(unsafe_code)]

//! Drains a journal to the remote file.
//!
//! One [`CacheFlusher::sync`] call reads every journaled range back from the
//! local cache file, submits it as an asynchronous remote write, optionally
//! truncates the remote file, and then blocks until every submission reported.
//! Failures never cancel the rest of the cycle; they only turn the aggregate
//! result into [`SombraError::FlushFailed`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::primitives::concurrency::{Completion, CompletionAggregator};
use crate::primitives::io::FileIo;
use crate::storage::interval::IntervalTree;
use crate::types::{Result, SombraError};

/// The already opened remote file a flush writes to.
pub trait RemoteFile: Send + Sync {
    /// Submits an asynchronous write of `data` at `offset`.
    ///
    /// On `Ok` the implementation owns `done` and must resolve it once the write
    /// finished, from any thread. On `Err` the submission never happened and
    /// `done` is dropped, which reports a failure.
    fn write_async(&self, offset: u64, data: Vec<u8>, done: Completion) -> Result<()>;

    /// Truncates the remote file to `size` bytes, synchronously.
    fn truncate(&self, size: u64) -> Result<()>;
}

/// Phase of the current or last flush cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlushState {
    /// No cycle has run yet.
    Idle,
    /// Reading ranges and submitting remote operations.
    Submitting,
    /// Blocked until every submission reported.
    Waiting,
    /// The last cycle finished.
    Done,
}

/// Snapshot of flusher counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushStatsSnapshot {
    /// Flush cycles that did any work.
    pub cycles: u64,
    /// Cycles that ended in failure.
    pub failed_cycles: u64,
    /// Remote writes accepted for submission.
    pub writes_submitted: u64,
    /// Payload bytes of accepted writes.
    pub bytes_submitted: u64,
    /// Remote truncates issued.
    pub truncates: u64,
    /// Ranges that could not be read back from the cache file.
    pub local_read_failures: u64,
    /// Writes the remote rejected on submission.
    pub rejected_submissions: u64,
}

/// Thread-safe flusher counters.
#[derive(Default)]
pub struct FlushStats {
    cycles: AtomicU64,
    failed_cycles: AtomicU64,
    writes_submitted: AtomicU64,
    bytes_submitted: AtomicU64,
    truncates: AtomicU64,
    local_read_failures: AtomicU64,
    rejected_submissions: AtomicU64,
}

impl FlushStats {
    /// Captures the current counter values.
    pub fn snapshot(&self) -> FlushStatsSnapshot {
        FlushStatsSnapshot {
            cycles: self.cycles.load(AtomicOrdering::Relaxed),
            failed_cycles: self.failed_cycles.load(AtomicOrdering::Relaxed),
            writes_submitted: self.writes_submitted.load(AtomicOrdering::Relaxed),
            bytes_submitted: self.bytes_submitted.load(AtomicOrdering::Relaxed),
            truncates: self.truncates.load(AtomicOrdering::Relaxed),
            local_read_failures: self.local_read_failures.load(AtomicOrdering::Relaxed),
            rejected_submissions: self.rejected_submissions.load(AtomicOrdering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, AtomicOrdering::Relaxed);
    }
}

/// Flushes journals to one remote file.
pub struct CacheFlusher {
    remote: Arc<dyn RemoteFile>,
    state: Mutex<FlushState>,
    stats: FlushStats,
}

impl CacheFlusher {
    /// Creates a flusher writing to `remote`.
    pub fn new(remote: Arc<dyn RemoteFile>) -> Self {
        Self {
            remote,
            state: Mutex::new(FlushState::Idle),
            stats: FlushStats::default(),
        }
    }

    /// Phase of the current or last cycle.
    pub fn state(&self) -> FlushState {
        *self.state.lock()
    }

    /// Flusher counters.
    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// Writes every journaled range to the remote file and waits for all of them.
    ///
    /// `journal` maps remote `[low, high)` ranges to positions in `local`; the bytes
    /// live at `position + offset_shift`. When `truncate_size` is set, the remote file
    /// is truncated after the writes were submitted. The journal is not modified;
    /// clearing flushed entries is up to the caller.
    pub fn sync<F>(
        &self,
        local: &F,
        journal: &IntervalTree<u64, u64>,
        offset_shift: u64,
        truncate_size: Option<u64>,
    ) -> Result<()>
    where
        F: FileIo + ?Sized,
    {
        if journal.is_empty() && truncate_size.is_none() {
            return Ok(());
        }

        let expected = journal.len() + usize::from(truncate_size.is_some());
        let mut aggregator = CompletionAggregator::new(expected);
        self.set_state(FlushState::Submitting);
        FlushStats::bump(&self.stats.cycles, 1);
        debug!(
            ranges = journal.len(),
            truncate = ?truncate_size,
            "flusher.sync.start"
        );

        for interval in journal.iter() {
            let done = aggregator.completion();
            let position = *interval.value;
            self.submit_range(local, interval.low, interval.high, position, offset_shift, done);
        }

        if let Some(size) = truncate_size {
            let done = aggregator.completion();
            FlushStats::bump(&self.stats.truncates, 1);
            match self.remote.truncate(size) {
                Ok(()) => done.complete(true),
                Err(err) => {
                    let failure = SombraError::RemoteTruncate { size };
                    warn!(
                        error = %failure,
                        cause = %err,
                        "flusher.sync.truncate_failed"
                    );
                    done.complete(false);
                }
            }
        }

        self.set_state(FlushState::Waiting);
        let success = aggregator.wait();
        self.set_state(FlushState::Done);

        if success {
            debug!(ranges = journal.len(), "flusher.sync.complete");
            Ok(())
        } else {
            FlushStats::bump(&self.stats.failed_cycles, 1);
            error!(ranges = journal.len(), "flusher.sync.failed");
            Err(SombraError::FlushFailed)
        }
    }

    fn submit_range<F>(
        &self,
        local: &F,
        low: u64,
        high: u64,
        position: u64,
        offset_shift: u64,
        done: Completion,
    ) where
        F: FileIo + ?Sized,
    {
        let buffer = match read_range(local, high - low, position, offset_shift) {
            Ok(buffer) => buffer,
            Err(err) => {
                FlushStats::bump(&self.stats.local_read_failures, 1);
                warn!(offset = low, error = %err, "flusher.sync.local_read_failed");
                done.complete(false);
                return;
            }
        };

        let len = buffer.len();
        match self.remote.write_async(low, buffer, done) {
            Ok(()) => {
                FlushStats::bump(&self.stats.writes_submitted, 1);
                FlushStats::bump(&self.stats.bytes_submitted, len as u64);
            }
            Err(err) => {
                // `done` was dropped by the failed call and already counted as a failure.
                FlushStats::bump(&self.stats.rejected_submissions, 1);
                let failure = SombraError::ImmediateSubmission { offset: low };
                warn!(
                    error = %failure,
                    cause = %err,
                    "flusher.sync.submit_failed"
                );
            }
        }
    }

    fn set_state(&self, next: FlushState) {
        *self.state.lock() = next;
    }
}

impl fmt::Debug for CacheFlusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFlusher")
            .field("state", &self.state())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Reads the bytes of one journal range; I/O errors and short reads are errors.
fn read_range<F>(local: &F, size: u64, position: u64, offset_shift: u64) -> Result<Vec<u8>>
where
    F: FileIo + ?Sized,
{
    let offset = position
        .checked_add(offset_shift)
        .ok_or(SombraError::Invalid("cache offset overflow"))?;
    let expected =
        usize::try_from(size).map_err(|_| SombraError::Invalid("journal range too large"))?;
    let mut buffer = vec![0u8; expected];
    let read = local.read_full_at(offset, &mut buffer)?;
    if read < expected {
        return Err(SombraError::LocalRead {
            offset,
            expected,
            read,
        });
    }
    Ok(buffer)
}
