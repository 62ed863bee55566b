#![allow(missing_docs)]

use std::sync::Arc;

use sombra_journal::primitives::concurrency::CompletionAggregator;
use sombra_journal::primitives::io::{FileIo, StdFileIo};
use sombra_journal::storage::{RemoteFile, RemoteOptions, ThreadedRemote};
use sombra_journal::types::{Result, SombraError};
use tempfile::tempdir;

#[test]
fn writes_complete_on_worker_threads() -> Result<()> {
    let dir = tempdir().expect("tempdir");
    let file = Arc::new(StdFileIo::open(dir.path().join("remote.bin"))?);
    let remote = ThreadedRemote::new(file.clone(), RemoteOptions::default().workers(2))?;

    let mut aggregator = CompletionAggregator::new(64);
    for i in 0..64u64 {
        remote.write_async(i * 4, (i as u32).to_le_bytes().to_vec(), aggregator.completion())?;
    }
    assert!(aggregator.wait());

    for i in 0..64u64 {
        let mut word = [0u8; 4];
        file.read_full_at(i * 4, &mut word)?;
        assert_eq!(u32::from_le_bytes(word), i as u32);
    }
    Ok(())
}

#[test]
fn truncate_is_synchronous() -> Result<()> {
    let dir = tempdir().expect("tempdir");
    let file = Arc::new(StdFileIo::open(dir.path().join("remote.bin"))?);
    file.write_at(0, &[1u8; 128])?;
    let remote = ThreadedRemote::new(file.clone(), RemoteOptions::default())?;
    remote.truncate(16)?;
    assert_eq!(file.len()?, 16);
    Ok(())
}

#[test]
fn shutdown_drains_queue_then_rejects() -> Result<()> {
    let dir = tempdir().expect("tempdir");
    let file = Arc::new(StdFileIo::open(dir.path().join("remote.bin"))?);
    let remote = ThreadedRemote::new(file.clone(), RemoteOptions::default().workers(0))?;

    let mut aggregator = CompletionAggregator::new(9);
    for i in 0..8u64 {
        remote.write_async(i * 512, vec![0xAB; 512], aggregator.completion())?;
    }
    remote.shutdown();
    assert_eq!(file.len()?, 8 * 512);

    let err = remote
        .write_async(0, vec![1], aggregator.completion())
        .unwrap_err();
    assert!(matches!(err, SombraError::ImmediateSubmission { offset: 0 }));
    // The rejected write's completion was dropped and counted as a failure.
    assert!(!aggregator.wait());
    Ok(())
}
