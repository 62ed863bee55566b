#![forbid(unsafe_code)]

//! Write-back journal over a local cache file.
//!
//! Dirty writes are appended to the cache file as records and indexed by the
//! remote byte range they cover. Overlapping rewrites patch the existing record
//! bytes in place, so indexed ranges never overlap. [`JournalCache::remote_sync`]
//! drains everything to the remote file through a [`CacheFlusher`].
//!
//! Record layout in the cache file:
//!
//! | bytes  | field                              |
//! |--------|------------------------------------|
//! | 0..8   | remote offset, little-endian u64   |
//! | 8..16  | payload length, little-endian u64  |
//! | 16..   | payload                            |
//!
//! A header whose remote offset is `u64::MAX` carries no payload and logs a
//! remote truncation to the size in its second field.

use std::fmt;
use std::io::IoSlice;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::storage::flusher::CacheFlusher;
use crate::storage::interval::IntervalTree;
use crate::types::{Result, SombraError};

/// Size of the header in front of every record payload.
pub const RECORD_HEADER_LEN: u64 = 16;

/// Remote offset marking a truncation record.
const TRUNCATE_RECORD: u64 = u64::MAX;

const DEFAULT_MAX_SIZE: u64 = 64 * 1024 * 1024;

/// Configuration for a [`JournalCache`].
#[derive(Clone, Debug)]
pub struct JournalOptions {
    /// Cache-file size at which [`JournalCache::is_full`] starts reporting true.
    pub max_size: u64,
    /// Whether every [`JournalCache::pwrite`] ends with an `fdatasync` of the cache file.
    pub sync_local: bool,
}

impl JournalOptions {
    /// Sets the soft size limit.
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    /// Enables or disables syncing the cache file after each write.
    pub fn sync_local(mut self, enabled: bool) -> Self {
        self.sync_local = enabled;
        self
    }
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            sync_local: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RecordHeader {
    offset: u64,
    size: u64,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_LEN as usize] {
        let mut buf = [0u8; RECORD_HEADER_LEN as usize];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    fn decode(src: &[u8; RECORD_HEADER_LEN as usize]) -> Self {
        let mut offset = [0u8; 8];
        let mut size = [0u8; 8];
        offset.copy_from_slice(&src[0..8]);
        size.copy_from_slice(&src[8..16]);
        Self {
            offset: u64::from_le_bytes(offset),
            size: u64::from_le_bytes(size),
        }
    }
}

/// A journaled piece of the remote file, copied out of the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Remote offset of the first byte.
    pub offset: u64,
    /// The bytes.
    pub data: Vec<u8>,
}

struct JournalState {
    journal: IntervalTree<u64, u64>,
    cache_size: u64,
    max_offset: u64,
    truncate_mark: Option<u64>,
}

impl JournalState {
    fn empty() -> Self {
        Self {
            journal: IntervalTree::new(),
            cache_size: 0,
            max_offset: 0,
            truncate_mark: None,
        }
    }

    /// Drops journaled bytes at or past `size` and makes it the pending mark.
    fn apply_truncate(&mut self, size: u64) -> Result<()> {
        let clipped: Vec<(u64, u64, u64)> = self
            .journal
            .query(size, u64::MAX)
            .iter()
            .map(|hit| (hit.low, hit.high, *hit.value))
            .collect();
        for (low, high, record_off) in clipped {
            self.journal.remove(low, high)?;
            // The record keeps its payload; only the indexed prefix stays live.
            if low < size {
                self.journal.insert(low, size, record_off)?;
            }
        }
        self.truncate_mark = Some(size);
        self.max_offset = size;
        Ok(())
    }
}

/// Dirty-range journal of one remote file, backed by a local cache file.
pub struct JournalCache {
    file: Arc<dyn FileIo>,
    options: JournalOptions,
    state: RwLock<JournalState>,
}

impl JournalCache {
    /// Opens the journal stored in `file`, rebuilding the index from its records.
    ///
    /// A record cut short at the end of the file is discarded and the file is
    /// trimmed back to the last complete record.
    pub fn open(file: Arc<dyn FileIo>, options: JournalOptions) -> Result<Self> {
        let state = recover(file.as_ref())?;
        debug!(
            entries = state.journal.len(),
            cache_size = state.cache_size,
            "journal.open"
        );
        Ok(Self {
            file,
            options,
            state: RwLock::new(state),
        })
    }

    /// Journals `buf` as the new contents of the remote range starting at `offset`.
    ///
    /// With a truncate pending, a write that starts past the mark also journals
    /// zeros for the hole between the mark and `offset`.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(SombraError::Invalid("write range overflows u64"))?;
        let mut state = self.state.write();

        if let Some(mark) = state.truncate_mark {
            if offset > mark {
                let hole = usize::try_from(offset - mark)
                    .map_err(|_| SombraError::Invalid("hole past truncate mark too large"))?;
                self.journal_locked(&mut state, &vec![0u8; hole], mark)?;
                state.truncate_mark = Some(offset);
            }
        }
        self.journal_locked(&mut state, buf, offset)?;

        if self.options.sync_local {
            self.file.sync_data()?;
        }
        if let Some(mark) = state.truncate_mark {
            if end > mark {
                state.truncate_mark = Some(end);
            }
        }
        state.max_offset = state.max_offset.max(end);
        Ok(buf.len())
    }

    fn journal_locked(&self, state: &mut JournalState, buf: &[u8], offset: u64) -> Result<()> {
        let end = offset + buf.len() as u64;

        // Split the write into bytes already journaled (patched in place) and
        // gaps that become new records.
        let mut patches: Vec<(u64, Range<usize>)> = Vec::new();
        let mut gaps: Vec<Range<u64>> = Vec::new();
        let mut cursor = offset;
        for hit in state.journal.query(offset, end) {
            let low = hit.low.max(offset);
            let high = hit.high.min(end);
            if low > cursor {
                gaps.push(cursor..low);
            }
            let record_off = *hit.value + RECORD_HEADER_LEN + (low - hit.low);
            patches.push((record_off, slice_of(offset, low..high)));
            cursor = high;
        }
        if cursor < end {
            gaps.push(cursor..end);
        }

        patches.sort_by_key(|(record_off, _)| *record_off);
        for (record_off, range) in &patches {
            self.file.write_at(*record_off, &buf[range.clone()])?;
        }

        for gap in gaps {
            let header = RecordHeader {
                offset: gap.start,
                size: gap.end - gap.start,
            }
            .encode();
            let record_off = state.cache_size;
            self.file.writev_at(
                record_off,
                &[
                    IoSlice::new(&header),
                    IoSlice::new(&buf[slice_of(offset, gap.clone())]),
                ],
            )?;
            state.journal.insert(gap.start, gap.end, record_off)?;
            state.cache_size += RECORD_HEADER_LEN + (gap.end - gap.start);
        }
        Ok(())
    }

    /// Reads journaled bytes of the remote range starting at `offset`.
    ///
    /// Copies the contiguous journaled prefix of the range and stops at the first
    /// byte that is not journaled; returns 0 if `offset` itself is not. The count
    /// never reaches past a pending truncate mark.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self.state.read();
        if matches!(state.truncate_mark, Some(mark) if offset >= mark) {
            return Ok(0);
        }
        let end = offset.saturating_add(buf.len() as u64);
        let mut cursor = offset;
        for hit in state.journal.query(offset, end) {
            if hit.low > cursor {
                break;
            }
            let high = hit.high.min(end);
            let record_off = *hit.value + RECORD_HEADER_LEN + (cursor - hit.low);
            let dst = &mut buf[slice_of(offset, cursor..high)];
            let read = self.file.read_full_at(record_off, dst)?;
            if read < dst.len() {
                return Err(SombraError::LocalRead {
                    offset: record_off,
                    expected: dst.len(),
                    read,
                });
            }
            cursor = high;
            if cursor >= end {
                break;
            }
        }
        let mut read = cursor - offset;
        if let Some(mark) = state.truncate_mark {
            read = read.min(mark - offset);
        }
        Ok(read as usize)
    }

    /// Every journaled piece inside `[offset, offset + size)`, clipped to that window.
    pub fn chunks(&self, offset: u64, size: u64) -> Result<Vec<Chunk>> {
        let end = offset.saturating_add(size);
        let state = self.state.read();
        let mut chunks = Vec::new();
        for hit in state.journal.query(offset, end) {
            let low = hit.low.max(offset);
            let high = hit.high.min(end);
            let record_off = *hit.value + RECORD_HEADER_LEN + (low - hit.low);
            let mut data = vec![0u8; (high - low) as usize];
            let read = self.file.read_full_at(record_off, &mut data)?;
            if read < data.len() {
                return Err(SombraError::LocalRead {
                    offset: record_off,
                    expected: data.len(),
                    read,
                });
            }
            chunks.push(Chunk { offset: low, data });
        }
        Ok(chunks)
    }

    /// Records a truncation of the remote file to `size`.
    ///
    /// Journaled bytes at or past `size` are dropped and the truncation is logged
    /// in the cache file, so a reopened journal replays it. A zero size empties the
    /// cache file; with `invalidate` it also drops the pending remote truncate.
    pub fn truncate(&self, size: u64, invalidate: bool) -> Result<()> {
        let mut state = self.state.write();
        if size == 0 {
            self.file.truncate(0)?;
            *state = JournalState::empty();
            debug!(invalidate, "journal.truncate.cleared");
            if invalidate {
                return Ok(());
            }
        }

        let marker = RecordHeader {
            offset: TRUNCATE_RECORD,
            size,
        }
        .encode();
        self.file.write_at(state.cache_size, &marker)?;
        if self.options.sync_local {
            self.file.sync_data()?;
        }
        state.cache_size += RECORD_HEADER_LEN;
        state.apply_truncate(size)?;
        Ok(())
    }

    /// Forgets all journaled data and pending truncation.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.write();
        self.file.truncate(0)?;
        *state = JournalState::empty();
        Ok(())
    }

    /// Flushes the journal and pending truncation to the remote file.
    ///
    /// Writers are blocked for the duration. On success the journal and the cache
    /// file are emptied; on failure both are kept so the flush can be retried.
    pub fn remote_sync(&self, flusher: &CacheFlusher) -> Result<()> {
        let mut state = self.state.write();
        let entries = state.journal.len();
        if let Err(err) = flusher.sync(
            self.file.as_ref(),
            &state.journal,
            RECORD_HEADER_LEN,
            state.truncate_mark,
        ) {
            warn!(entries, error = %err, "journal.remote_sync.failed");
            return Err(err);
        }
        if let Err(err) = self.file.truncate(0) {
            warn!(entries, error = %err, "journal.remote_sync.cache_truncate_failed");
            return Err(err);
        }
        *state = JournalState::empty();
        debug!(entries, "journal.remote_sync.complete");
        Ok(())
    }

    /// `fdatasync` of the cache file.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()
    }

    /// Bytes used in the cache file.
    pub fn size(&self) -> u64 {
        self.state.read().cache_size
    }

    /// End of the furthest byte written or truncated to.
    pub fn max_offset(&self) -> u64 {
        self.state.read().max_offset
    }

    /// Pending remote truncation size.
    pub fn truncate_mark(&self) -> Option<u64> {
        self.state.read().truncate_mark
    }

    /// Number of journaled ranges.
    pub fn len(&self) -> usize {
        self.state.read().journal.len()
    }

    /// Returns true if nothing is journaled.
    pub fn is_empty(&self) -> bool {
        self.state.read().journal.is_empty()
    }

    /// Returns true once the cache file reached the configured size limit.
    pub fn is_full(&self) -> bool {
        self.state.read().cache_size >= self.options.max_size
    }

    /// Journaled remote ranges in ascending order.
    pub fn ranges(&self) -> Vec<Range<u64>> {
        self.state
            .read()
            .journal
            .iter()
            .map(|interval| interval.low..interval.high)
            .collect()
    }
}

impl fmt::Debug for JournalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("JournalCache")
            .field("entries", &state.journal.len())
            .field("cache_size", &state.cache_size)
            .field("max_offset", &state.max_offset)
            .field("truncate_mark", &state.truncate_mark)
            .finish()
    }
}

/// Indexes of `buf` holding remote range `range` when `buf` starts at `base`.
fn slice_of(base: u64, range: Range<u64>) -> Range<usize> {
    (range.start - base) as usize..(range.end - base) as usize
}

fn recover(file: &dyn FileIo) -> Result<JournalState> {
    let len = file.len()?;
    let mut state = JournalState::empty();
    let mut pos = 0u64;
    while pos < len {
        let mut raw = [0u8; RECORD_HEADER_LEN as usize];
        if file.read_full_at(pos, &mut raw)? < raw.len() {
            warn!(pos, len, "journal.recover.torn_header");
            break;
        }
        let header = RecordHeader::decode(&raw);
        if header.offset == TRUNCATE_RECORD {
            state.apply_truncate(header.size)?;
            pos += RECORD_HEADER_LEN;
            continue;
        }
        let Some(record_end) = pos
            .checked_add(RECORD_HEADER_LEN)
            .and_then(|p| p.checked_add(header.size))
        else {
            return Err(SombraError::Corruption("journal record length overflows"));
        };
        if header.size == 0 || record_end > len {
            warn!(pos, size = header.size, len, "journal.recover.torn_tail");
            break;
        }
        let high = header
            .offset
            .checked_add(header.size)
            .ok_or(SombraError::Corruption("journal record range overflows"))?;
        if !state.journal.query(header.offset, high).is_empty() {
            return Err(SombraError::Corruption("overlapping journal records"));
        }
        state.journal.insert(header.offset, high, pos)?;
        if let Some(mark) = state.truncate_mark {
            if high > mark {
                state.truncate_mark = Some(high);
            }
        }
        state.max_offset = state.max_offset.max(high);
        pos = record_end;
    }
    state.cache_size = pos;
    if pos < len {
        file.truncate(pos)?;
    }
    Ok(state)
}
