//! Dirty-range journal and flush engine for Sombra's write-back data cache.
//!
//! Writes landing in the local cache are recorded as byte ranges in an interval
//! tree; a flush drains them to the remote file with concurrent asynchronous
//! writes and reports one aggregate outcome.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;
