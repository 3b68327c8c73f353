//! The worklist pattern used instead of a reentrant lock (Design Note, spec §9).
//!
//! A handler that would otherwise need to call back into a locked
//! [`crate::schedule::Schedule`] method (orphan/ref-block unlock) instead pushes a
//! [`WorkItem`] onto a local worklist; the outer loop in [`crate::channel::NetChannel`]
//! drains it after releasing/while still holding the single `mapSched` guard, never
//! re-entering through a second lock acquisition.

use crate::inv::InvKey;
use crate::types::ForkHash;

/// A follow-up action discovered while handling one event, to be drained by the
/// same call before it returns.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// A block worklist entry has become applicable (orphan resolved, ref-block
    /// arrived, or it was already queued as part of the current batch).
    ApplyBlock { fork: ForkHash, hash: InvKey },
}

/// FIFO queue of [`WorkItem`]s accumulated during one event handler invocation.
#[derive(Debug, Default)]
pub struct Worklist {
    items: std::collections::VecDeque<WorkItem>,
}

impl Worklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: WorkItem) {
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
