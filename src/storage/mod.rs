//! Journal storage engine.
//!
//! The ordered trees that index dirty ranges, the journal that fills them from
//! the local cache file, and the flush path that drains them to the remote file.

/// Red-black tree engine.
///
/// Arena-backed balanced map with a per-node summary hook for augmented trees.
pub mod rbtree;

/// Interval tree over the red-black engine.
///
/// Half-open intervals with overlap queries pruned by a subtree maximum.
pub mod interval;

mod flusher;
mod journal;
mod remote;

/// Balanced ordered map.
pub use rbtree::{Augment, BalancedTree, Iter, Plain};

/// Interval index.
pub use interval::{Interval, IntervalTree, MaxHigh, Span};

/// Flush engine and its remote collaborator.
pub use flusher::{CacheFlusher, FlushState, FlushStats, FlushStatsSnapshot, RemoteFile};

/// Local write-back journal.
pub use journal::{Chunk, JournalCache, JournalOptions, RECORD_HEADER_LEN};

/// Threaded remote file implementation.
pub use remote::{RemoteOptions, ThreadedRemote};
