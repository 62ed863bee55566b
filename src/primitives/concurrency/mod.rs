#![forbid(unsafe_code)]

//! Join-all completion tracking for asynchronous submissions.
//!
//! A flush cycle knows up front how many operations it will start. Each one is
//! handed a [`Completion`] token; the token travels to whichever thread finishes
//! the operation and reports its outcome exactly once. [`CompletionAggregator::wait`]
//! blocks until every expected report has arrived and folds them into a single
//! boolean.

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::trace;

/// Collects `expected` success/failure reports and releases a waiter once all arrived.
pub struct CompletionAggregator {
    expected: usize,
    tx: Sender<bool>,
    rx: Receiver<bool>,
    outcome: Option<bool>,
}

impl CompletionAggregator {
    /// Creates an aggregator that waits for `expected` reports.
    pub fn new(expected: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            expected,
            tx,
            rx,
            outcome: None,
        }
    }

    /// Number of reports this aggregator waits for.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Hands out a one-shot token that reports into this aggregator.
    ///
    /// Every token counts as one report: an explicit [`Completion::complete`] or,
    /// if the token is dropped unused, a failure.
    pub fn completion(&self) -> Completion {
        Completion {
            tx: Some(self.tx.clone()),
        }
    }

    /// Reports one outcome from the owning thread.
    pub fn report(&self, success: bool) {
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.tx.send(success);
    }

    /// Blocks until all expected reports arrived; returns their conjunction.
    ///
    /// Returns immediately when `expected` is zero. Calling it again returns the
    /// cached outcome.
    pub fn wait(&mut self) -> bool {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        let mut success = true;
        for received in 0..self.expected {
            match self.rx.recv() {
                Ok(ok) => {
                    success &= ok;
                    trace!(received = received + 1, expected = self.expected, ok, "completion.report");
                }
                // `self.tx` keeps the channel open; kept for exhaustiveness.
                Err(_) => {
                    success = false;
                    break;
                }
            }
        }
        self.outcome = Some(success);
        success
    }

    /// Outcome of the cycle. Only meaningful after [`wait`](Self::wait) returned;
    /// reports `false` before that.
    pub fn was_successful(&self) -> bool {
        self.outcome.unwrap_or(false)
    }
}

impl fmt::Debug for CompletionAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionAggregator")
            .field("expected", &self.expected)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// One-shot report handle for a single asynchronous operation.
///
/// Safe to move to any thread. Dropping it without calling
/// [`complete`](Self::complete) reports a failure, so an operation whose
/// completion path is lost can never leave the waiter hanging.
#[must_use = "dropping a completion reports a failure"]
pub struct Completion {
    tx: Option<Sender<bool>>,
}

impl Completion {
    /// Reports the outcome of the operation.
    pub fn complete(mut self, success: bool) {
        self.send(success);
    }

    fn send(&mut self, success: bool) {
        if let Some(tx) = self.tx.take() {
            // The aggregator may already be gone if the waiter gave up; nothing to do then.
            let _ = tx.send(success);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.send(false);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.tx.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn zero_expected_returns_immediately() {
        let mut agg = CompletionAggregator::new(0);
        assert!(!agg.was_successful());
        assert!(agg.wait());
        assert!(agg.was_successful());
    }

    #[test]
    fn all_successes_from_many_threads() {
        let mut agg = CompletionAggregator::new(16);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let done = agg.completion();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis((i % 4) as u64));
                    done.complete(true);
                })
            })
            .collect();
        assert!(agg.wait());
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn single_failure_fails_the_whole_cycle() {
        let mut agg = CompletionAggregator::new(3);
        agg.report(true);
        let late = agg.completion();
        let failing = agg.completion();
        let handle = thread::spawn(move || {
            failing.complete(false);
            thread::sleep(Duration::from_millis(5));
            late.complete(true);
        });
        assert!(!agg.wait());
        assert!(!agg.was_successful());
        handle.join().unwrap();
    }

    #[test]
    fn dropped_completion_counts_as_failure() {
        let mut agg = CompletionAggregator::new(2);
        agg.completion().complete(true);
        drop(agg.completion());
        assert!(!agg.wait());
    }

    #[test]
    fn wait_is_idempotent() {
        let mut agg = CompletionAggregator::new(1);
        agg.report(true);
        assert!(agg.wait());
        assert!(agg.wait());
        assert_eq!(agg.expected(), 1);
    }
}
