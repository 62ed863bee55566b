#![allow(missing_docs)]

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sombra_journal::primitives::concurrency::Completion;
use sombra_journal::primitives::io::{FileIo, StdFileIo};
use sombra_journal::storage::{
    CacheFlusher, JournalCache, JournalOptions, RemoteFile, RemoteOptions, ThreadedRemote,
};
use sombra_journal::types::{Result, SombraError};
use tempfile::{tempdir, TempDir};

struct Harness {
    _dir: TempDir,
    remote_file: Arc<StdFileIo>,
    cache: JournalCache,
    flusher: CacheFlusher,
}

impl Harness {
    fn new() -> Result<Self> {
        let dir = tempdir().expect("tempdir");
        let cache_file = Arc::new(StdFileIo::open(dir.path().join("00000042.jc"))?);
        let remote_file = Arc::new(StdFileIo::open(dir.path().join("remote.bin"))?);
        let remote = ThreadedRemote::new(remote_file.clone(), RemoteOptions::default().workers(3))?;
        Ok(Self {
            _dir: dir,
            remote_file,
            cache: JournalCache::open(cache_file, JournalOptions::default())?,
            flusher: CacheFlusher::new(Arc::new(remote)),
        })
    }

    fn remote_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.remote_file.len()? as usize];
        self.remote_file.read_full_at(0, &mut buf)?;
        Ok(buf)
    }
}

#[test]
fn remote_sync_mirrors_random_writes() -> Result<()> {
    let harness = Harness::new()?;
    let mut rng = ChaCha8Rng::seed_from_u64(0xfeed);
    let mut model = vec![0u8; 64 * 1024];
    let mut written_end = 0usize;

    for _ in 0..300 {
        let offset = rng.gen_range(0..60 * 1024);
        let len = rng.gen_range(1..4096).min(model.len() - offset);
        let fill: u8 = rng.gen();
        let data = vec![fill; len];
        assert_eq!(harness.cache.pwrite(&data, offset as u64)?, len);
        model[offset..offset + len].copy_from_slice(&data);
        written_end = written_end.max(offset + len);
    }

    // Journaled ranges never overlap and are sorted.
    let ranges = harness.cache.ranges();
    for pair in ranges.windows(2) {
        assert!(pair[0].end <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
    assert_eq!(harness.cache.max_offset(), written_end as u64);

    harness.cache.remote_sync(&harness.flusher)?;
    assert!(harness.cache.is_empty());
    assert_eq!(harness.cache.size(), 0);

    let remote = harness.remote_bytes()?;
    assert_eq!(remote.len(), written_end);
    for range in ranges {
        let (lo, hi) = (range.start as usize, range.end as usize);
        assert_eq!(&remote[lo..hi], &model[lo..hi]);
    }
    Ok(())
}

#[test]
fn remote_sync_applies_pending_truncate() -> Result<()> {
    for _ in 0..25 {
        let harness = Harness::new()?;
        harness.cache.pwrite(&[7u8; 4096], 0)?;
        harness.cache.truncate(4, false)?;
        let mut buf = [0u8; 16];
        assert_eq!(harness.cache.pread(&mut buf, 0)?, 4);

        harness.cache.remote_sync(&harness.flusher)?;
        assert_eq!(harness.remote_file.len()?, 4);
        assert_eq!(harness.remote_bytes()?, vec![7u8; 4]);
        assert_eq!(harness.cache.truncate_mark(), None);

        // Nothing left to do.
        harness.cache.remote_sync(&harness.flusher)?;
        assert_eq!(harness.flusher.stats().snapshot().cycles, 1);
    }
    Ok(())
}

#[test]
fn extending_past_a_truncate_zeroes_the_hole() -> Result<()> {
    let harness = Harness::new()?;
    harness.cache.pwrite(&[0xEE; 64], 0)?;
    harness.cache.remote_sync(&harness.flusher)?;
    assert_eq!(harness.remote_file.len()?, 64);

    harness.cache.truncate(4, false)?;
    harness.cache.pwrite(b"ZZ", 6)?;
    harness.cache.remote_sync(&harness.flusher)?;
    assert_eq!(
        harness.remote_bytes()?,
        vec![0xEE, 0xEE, 0xEE, 0xEE, 0, 0, b'Z', b'Z']
    );
    Ok(())
}

struct RefusingRemote;

impl RemoteFile for RefusingRemote {
    fn write_async(&self, offset: u64, _data: Vec<u8>, _done: Completion) -> Result<()> {
        Err(SombraError::ImmediateSubmission { offset })
    }

    fn truncate(&self, _size: u64) -> Result<()> {
        Ok(())
    }
}

#[test]
fn failed_sync_keeps_journal_dirty() -> Result<()> {
    let harness = Harness::new()?;
    harness.cache.pwrite(b"keep me", 10)?;
    harness.cache.pwrite(b"and me", 100)?;
    let size = harness.cache.size();

    let refusing = CacheFlusher::new(Arc::new(RefusingRemote));
    let err = harness.cache.remote_sync(&refusing).unwrap_err();
    assert!(matches!(err, SombraError::FlushFailed));
    assert_eq!(harness.cache.len(), 2);
    assert_eq!(harness.cache.size(), size);
    assert_eq!(refusing.stats().snapshot().rejected_submissions, 2);

    // The same journal flushes fine once the remote cooperates.
    harness.cache.remote_sync(&harness.flusher)?;
    let remote = harness.remote_bytes()?;
    assert_eq!(&remote[10..17], b"keep me");
    assert_eq!(&remote[100..106], b"and me");
    Ok(())
}

#[test]
fn journal_survives_reopen_and_flushes_afterwards() -> Result<()> {
    let dir = tempdir().expect("tempdir");
    let cache_path = dir.path().join("00000007.jc");
    {
        let cache = JournalCache::open(
            Arc::new(StdFileIo::open(&cache_path)?),
            JournalOptions::default(),
        )?;
        cache.pwrite(b"persisted", 3)?;
        cache.sync()?;
    }
    let cache = JournalCache::open(
        Arc::new(StdFileIo::open(&cache_path)?),
        JournalOptions::default(),
    )?;
    assert_eq!(cache.ranges(), vec![3..12]);

    let remote_file = Arc::new(StdFileIo::open(dir.path().join("remote.bin"))?);
    let flusher = CacheFlusher::new(Arc::new(ThreadedRemote::new(
        remote_file.clone(),
        RemoteOptions::default(),
    )?));
    cache.remote_sync(&flusher)?;

    let mut buf = [0u8; 9];
    assert_eq!(remote_file.read_full_at(3, &mut buf)?, 9);
    assert_eq!(&buf, b"persisted");
    Ok(())
}
