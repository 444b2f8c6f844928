//! Lock-free counters describing tracker activity.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct OrderedStats {
    pub inserted: AtomicU64,
    pub io_done: AtomicU64,
    pub removed: AtomicU64,
    /// Tree searches (lookups, checksum attach, sub-range completion)
    /// answered by the cached hint.
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub flushes: AtomicU64,
    pub waits: AtomicU64,
    pub disk_size_advances: AtomicU64,
    pub persist_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderedStatsSnapshot {
    pub inserted: u64,
    pub io_done: u64,
    pub removed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub flushes: u64,
    pub waits: u64,
    pub disk_size_advances: u64,
    pub persist_failures: u64,
}

impl OrderedStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> OrderedStatsSnapshot {
        OrderedStatsSnapshot {
            inserted: self.inserted.load(Ordering::Relaxed),
            io_done: self.io_done.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            disk_size_advances: self.disk_size_advances.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}
