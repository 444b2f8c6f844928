//! Hand-off of I/O-complete extents to persistence workers.

use crate::extent::OrderedExtent;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// FIFO of ordered extents whose I/O finished but whose metadata has not
/// been persisted yet. Each entry holds a reference to its extent.
#[derive(Debug, Default)]
pub struct CompletionQueue {
    pending: Mutex<VecDeque<Arc<OrderedExtent>>>,
    ready: Condvar,
}

impl CompletionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, ordered: Arc<OrderedExtent>) {
        self.pending.lock().push_back(ordered);
        self.ready.notify_one();
    }

    #[must_use]
    pub fn pop(&self) -> Option<Arc<OrderedExtent>> {
        self.pending.lock().pop_front()
    }

    /// Pop, sleeping up to `timeout` for an entry to arrive.
    #[must_use]
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Arc<OrderedExtent>> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            let _ = self.ready.wait_for(&mut pending, timeout);
        }
        pending.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
