//! Time-ordered storage for resumptions that are due in the future.
//!
//! Resumptions are grouped into one bucket per distinct time. Buckets come
//! out in ascending time order and entries within a bucket keep their
//! insertion order, which is what makes same-time ordering deterministic.

use std::collections::{BTreeMap, VecDeque};

use lockstep_types::{TaskId, Time};

use crate::interrupt::Interrupt;

/// A request to resume one task, optionally throwing a signal into it.
#[derive(Debug, Clone)]
pub(crate) struct Resumption {
    /// The task to resume.
    pub(crate) task: TaskId,
    /// The signal to deliver, or `None` for a plain start.
    pub(crate) signal: Option<Interrupt>,
}

impl Resumption {
    /// A plain resumption with nothing to deliver.
    pub(crate) const fn start(task: TaskId) -> Self {
        Self { task, signal: None }
    }

    /// A resumption delivering `signal`.
    pub(crate) const fn deliver(task: TaskId, signal: Interrupt) -> Self {
        Self {
            task,
            signal: Some(signal),
        }
    }

    /// Whether the carried signal (if any) can still be delivered.
    pub(crate) fn is_live(&self) -> bool {
        self.signal.as_ref().is_none_or(Interrupt::is_deliverable)
    }
}

/// Resumptions bucketed by due time.
#[derive(Debug, Default)]
pub(crate) struct WaitQueue {
    buckets: BTreeMap<Time, VecDeque<Resumption>>,
}

impl WaitQueue {
    /// Queue `resumption` to run at `at`.
    pub(crate) fn push(&mut self, at: Time, resumption: Resumption) {
        self.buckets.entry(at).or_default().push_back(resumption);
    }

    /// The earliest time with queued resumptions.
    pub(crate) fn next_deadline(&self) -> Option<Time> {
        self.buckets.keys().next().copied()
    }

    /// Remove and return the earliest bucket.
    pub(crate) fn pop_bucket(&mut self) -> Option<(Time, VecDeque<Resumption>)> {
        self.buckets.pop_first()
    }

    /// Total number of queued resumptions, live or not.
    pub(crate) fn len(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
    }
}
