#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use sombra_journal::primitives::concurrency::Completion;
use sombra_journal::primitives::io::{FileIo, StdFileIo};
use sombra_journal::storage::{CacheFlusher, FlushState, IntervalTree, RemoteFile};
use sombra_journal::types::{Result, SombraError};
use tempfile::{tempdir, TempDir};

/// Completes writes from detached threads after a small delay, in reverse
/// submission order, and can be told to fail specific offsets.
#[derive(Default)]
struct ScriptedRemote {
    attempted: Mutex<Vec<u64>>,
    completed: Arc<AtomicUsize>,
    truncates: Mutex<Vec<u64>>,
    fail_writes_at: Vec<u64>,
    fail_truncate: bool,
}

impl RemoteFile for ScriptedRemote {
    fn write_async(&self, offset: u64, data: Vec<u8>, done: Completion) -> Result<()> {
        let ok = !self.fail_writes_at.contains(&offset);
        let delay = {
            let mut attempted = self.attempted.lock();
            attempted.push(offset);
            20u64.saturating_sub(attempted.len() as u64 * 2)
        };
        let completed = Arc::clone(&self.completed);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(delay));
            drop(data);
            completed.fetch_add(1, Ordering::SeqCst);
            done.complete(ok);
        });
        Ok(())
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.truncates.lock().push(size);
        if self.fail_truncate {
            Err(SombraError::RemoteTruncate { size })
        } else {
            Ok(())
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Cache file with `n` back-to-back 8-byte ranges and the matching journal.
fn fixture(n: u64) -> Result<(TempDir, StdFileIo, IntervalTree<u64, u64>)> {
    let dir = tempdir().expect("tempdir");
    let io = StdFileIo::open(dir.path().join("flush.jc"))?;
    let mut journal = IntervalTree::new();
    for i in 0..n {
        io.write_at(i * 8, &[i as u8; 8])?;
        journal.insert(i * 100, i * 100 + 8, i * 8)?;
    }
    Ok((dir, io, journal))
}

#[test]
fn empty_journal_issues_no_io() -> Result<()> {
    init_tracing();
    let (_dir, io, journal) = fixture(0)?;
    let remote = Arc::new(ScriptedRemote::default());
    let flusher = CacheFlusher::new(remote.clone());
    flusher.sync(&io, &journal, 0, None)?;
    assert!(remote.attempted.lock().is_empty());
    assert!(remote.truncates.lock().is_empty());
    assert_eq!(flusher.state(), FlushState::Idle);
    Ok(())
}

#[test]
fn all_writes_succeed() -> Result<()> {
    init_tracing();
    let (_dir, io, journal) = fixture(10)?;
    let remote = Arc::new(ScriptedRemote::default());
    let flusher = CacheFlusher::new(remote.clone());
    flusher.sync(&io, &journal, 0, None)?;
    let attempted = remote.attempted.lock().clone();
    assert_eq!(attempted, (0..10).map(|i| i * 100).collect::<Vec<_>>());
    assert!(remote.truncates.lock().is_empty());
    assert_eq!(flusher.state(), FlushState::Done);
    assert_eq!(flusher.stats().snapshot().writes_submitted, 10);
    Ok(())
}

#[test]
fn one_failed_write_fails_sync_without_cancelling_others() -> Result<()> {
    init_tracing();
    let (_dir, io, journal) = fixture(8)?;
    let remote = Arc::new(ScriptedRemote {
        fail_writes_at: vec![300],
        ..ScriptedRemote::default()
    });
    let flusher = CacheFlusher::new(remote.clone());
    let err = flusher.sync(&io, &journal, 0, None).unwrap_err();
    assert!(matches!(err, SombraError::FlushFailed));
    assert_eq!(remote.attempted.lock().len(), 8);
    assert_eq!(remote.completed.load(Ordering::SeqCst), 8);
    assert_eq!(flusher.stats().snapshot().failed_cycles, 1);
    Ok(())
}

#[test]
fn truncate_is_issued_once_after_writes() -> Result<()> {
    init_tracing();
    let (_dir, io, journal) = fixture(3)?;
    let remote = Arc::new(ScriptedRemote::default());
    let flusher = CacheFlusher::new(remote.clone());
    flusher.sync(&io, &journal, 0, Some(4096))?;
    assert_eq!(remote.attempted.lock().len(), 3);
    assert_eq!(*remote.truncates.lock(), vec![4096]);
    Ok(())
}

#[test]
fn failed_truncate_fails_sync() -> Result<()> {
    init_tracing();
    let (_dir, io, journal) = fixture(2)?;
    let remote = Arc::new(ScriptedRemote {
        fail_truncate: true,
        ..ScriptedRemote::default()
    });
    let flusher = CacheFlusher::new(remote.clone());
    assert!(flusher.sync(&io, &journal, 0, Some(1)).is_err());
    assert_eq!(remote.attempted.lock().len(), 2);
    Ok(())
}

#[test]
fn flusher_is_reusable_across_cycles() -> Result<()> {
    init_tracing();
    let (_dir, io, journal) = fixture(4)?;
    let remote = Arc::new(ScriptedRemote {
        fail_writes_at: vec![0],
        ..ScriptedRemote::default()
    });
    let flusher = CacheFlusher::new(remote.clone());
    assert!(flusher.sync(&io, &journal, 0, None).is_err());

    let mut tail = IntervalTree::new();
    tail.insert(100, 108, 8)?;
    flusher.sync(&io, &tail, 0, None)?;

    let stats = flusher.stats().snapshot();
    assert_eq!(stats.cycles, 2);
    assert_eq!(stats.failed_cycles, 1);
    assert_eq!(stats.writes_submitted, 5);
    Ok(())
}
