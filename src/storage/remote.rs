#![forbid(unsafe_code)]

//! [`RemoteFile`] that runs writes on its own worker threads.
//!
//! Writes are queued and executed against a [`FileIo`] by a fixed pool of
//! workers, which resolve each write's [`Completion`] from their own thread.

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::primitives::concurrency::Completion;
use crate::primitives::io::FileIo;
use crate::storage::flusher::RemoteFile;
use crate::types::{Result, SombraError};

/// Configuration for [`ThreadedRemote`].
#[derive(Clone, Debug)]
pub struct RemoteOptions {
    /// Number of worker threads executing writes; at least one is started.
    pub workers: usize,
}

impl RemoteOptions {
    /// Sets the worker count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

struct WriteJob {
    offset: u64,
    data: Vec<u8>,
    done: Completion,
}

/// Remote file whose writes complete asynchronously on worker threads.
pub struct ThreadedRemote {
    file: Arc<dyn FileIo>,
    queue: Mutex<Option<Sender<WriteJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadedRemote {
    /// Starts the worker pool over `file`.
    pub fn new(file: Arc<dyn FileIo>, options: RemoteOptions) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let rx = Arc::new(Mutex::new(rx));
        let count = options.workers.max(1);
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let file = Arc::clone(&file);
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("sombra-remote-{id}"))
                .spawn(move || worker_loop(id, file, rx))?;
            workers.push(handle);
        }
        debug!(workers = count, "remote.start");
        Ok(Self {
            file,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Stops accepting writes and waits for the queued ones to finish.
    pub fn shutdown(&self) {
        drop(self.queue.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                warn!("remote.worker_panicked");
            }
        }
    }
}

impl RemoteFile for ThreadedRemote {
    fn write_async(&self, offset: u64, data: Vec<u8>, done: Completion) -> Result<()> {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Err(SombraError::ImmediateSubmission { offset });
        };
        tx.send(WriteJob { offset, data, done })
            .map_err(|_| SombraError::ImmediateSubmission { offset })
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.file.truncate(size)
    }
}

impl Drop for ThreadedRemote {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadedRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadedRemote")
            .field("open", &self.queue.lock().is_some())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

fn worker_loop(id: usize, file: Arc<dyn FileIo>, rx: Arc<Mutex<Receiver<WriteJob>>>) {
    loop {
        let job = rx.lock().recv();
        let Ok(WriteJob { offset, data, done }) = job else {
            trace!(worker = id, "remote.worker.exit");
            return;
        };
        match file.write_at(offset, &data) {
            Ok(()) => done.complete(true),
            Err(err) => {
                let failure = SombraError::RemoteWrite {
                    offset,
                    len: data.len(),
                };
                warn!(worker = id, error = %failure, cause = %err, "remote.write_failed");
                done.complete(false);
            }
        }
    }
}
