//! Aggregation of per-operation outcomes for bulk actions (delete many images, stop many
//! instances, ...).

use std::{
    mem,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::oneshot;
use tracing::warn;

use crate::{OperationCallbacks, WaitError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Fulfilled,
    Rejected(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettledCounts {
    pub fulfilled: usize,
    pub rejected: usize,
}

pub fn settled_counts(results: &[Settled]) -> SettledCounts {
    results
        .iter()
        .fold(SettledCounts::default(), |mut counts, result| {
            match result {
                Settled::Fulfilled => counts.fulfilled += 1,
                Settled::Rejected(_) => counts.rejected += 1,
            }
            counts
        })
}

struct BulkState {
    expected: usize,
    results: Vec<Settled>,
    done: Option<oneshot::Sender<Vec<Settled>>>,
}

/// Collects one [`Settled`] per expected operation and completes once all have settled.
///
/// Failures that happen before an operation exists (the initiating request was rejected)
/// are recorded with [`BulkTracker::push_failure`] so they count toward the total.
#[derive(Clone)]
pub struct BulkTracker {
    state: Arc<Mutex<BulkState>>,
}

impl BulkTracker {
    pub fn new(expected: usize) -> (Self, BulkCompletion) {
        let (tx, rx) = oneshot::channel();
        let tracker = Self {
            state: Arc::new(Mutex::new(BulkState {
                expected,
                results: Vec::with_capacity(expected),
                done: Some(tx),
            })),
        };
        if expected == 0 {
            tracker.complete_if_settled();
        }
        (tracker, BulkCompletion { expected, rx })
    }

    pub fn push_success(&self) {
        self.record(Settled::Fulfilled);
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.record(Settled::Rejected(message.into()));
    }

    /// Callbacks that record the operation's outcome in this tracker.
    pub fn callbacks(&self) -> OperationCallbacks {
        let on_success = self.clone();
        let on_failure = self.clone();
        OperationCallbacks::new(
            move || on_success.push_success(),
            move |message| on_failure.push_failure(message),
        )
    }

    fn record(&self, result: Settled) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.done.is_none() {
                warn!(?result, "ignoring outcome recorded after bulk action completed");
                return;
            }
            state.results.push(result);
        }
        self.complete_if_settled();
    }

    fn complete_if_settled(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.results.len() < state.expected {
            return;
        }
        if let Some(done) = state.done.take() {
            let results = mem::take(&mut state.results);
            let _ = done.send(results);
        }
    }
}

pub struct BulkCompletion {
    expected: usize,
    rx: oneshot::Receiver<Vec<Settled>>,
}

impl BulkCompletion {
    /// Resolves with every recorded outcome once the tracker has settled. Fails if every
    /// tracker handle was dropped first, e.g. because a registration holding one was cancelled.
    pub async fn wait(self) -> Result<Vec<Settled>, WaitError> {
        let expected = self.expected;
        self.rx
            .await
            .map_err(|_| WaitError::BulkAbandoned { expected })
    }
}

#[cfg(test)]
#[path = "tests/settled_tests.rs"]
mod tests;
