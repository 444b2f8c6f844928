//! Per-inode ordered-extent tracker: insertion, lookup, checksum
//! attachment and exactly-once completion.

use crate::config::OrderedConfig;
use crate::extent::OrderedExtent;
use crate::queue::CompletionQueue;
use crate::stats::{OrderedStats, OrderedStatsSnapshot};
use crate::tree::OrderedTree;
use crate::{OrderedPersistence, WritebackScheduler};
use ffs_error::{FfsError, Result};
use ffs_extent::{RangeFlags, RangeMarkers};
use ffs_types::{ByteRange, InodeNumber, SectorSum};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// State guarded by the per-inode tree mutex.
#[derive(Debug, Default)]
pub(crate) struct TreeState {
    pub(crate) tree: OrderedTree,
    /// Prefix of the file guaranteed durable. Never decreases.
    pub(crate) disk_i_size: u64,
}

/// Result of reporting one finished I/O sub-range.
#[derive(Debug)]
pub(crate) enum SubrangeOutcome {
    /// Other sub-ranges of the extent are still in flight, or another
    /// reporter already won the `IO_DONE` transition.
    Pending,
    /// This caller flipped `IO_DONE` and owns the completion work.
    Done(Arc<OrderedExtent>),
    /// No ordered extent covers the offset.
    Untracked,
}

/// Tracks the ordered extents of one inode.
///
/// Lock order: the tree mutex may be held while calling into the range
/// markers, never the reverse. No blocking wait happens under the tree mutex.
pub struct OrderedTracker {
    inode: InodeNumber,
    config: OrderedConfig,
    pub(crate) state: Mutex<TreeState>,
    i_size: AtomicU64,
    pub(crate) markers: Arc<dyn RangeMarkers>,
    pub(crate) writeback: Arc<dyn WritebackScheduler>,
    pub(crate) stats: OrderedStats,
}

impl std::fmt::Debug for OrderedTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedTracker")
            .field("inode", &self.inode)
            .field("config", &self.config)
            .field("i_size", &self.logical_size())
            .finish_non_exhaustive()
    }
}

impl OrderedTracker {
    pub fn new(
        inode: InodeNumber,
        config: OrderedConfig,
        markers: Arc<dyn RangeMarkers>,
        writeback: Arc<dyn WritebackScheduler>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inode,
            config,
            state: Mutex::new(TreeState::default()),
            i_size: AtomicU64::new(0),
            markers,
            writeback,
            stats: OrderedStats::default(),
        })
    }

    #[must_use]
    pub fn inode(&self) -> InodeNumber {
        self.inode
    }

    #[must_use]
    pub fn config(&self) -> &OrderedConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> OrderedStatsSnapshot {
        self.stats.snapshot()
    }

    /// In-memory (VFS-visible) file size.
    #[must_use]
    pub fn logical_size(&self) -> u64 {
        self.i_size.load(Ordering::Acquire)
    }

    pub fn set_logical_size(&self, size: u64) {
        self.i_size.store(size, Ordering::Release);
    }

    /// Durable file size: every byte below it survives a crash.
    #[must_use]
    pub fn disk_i_size(&self) -> u64 {
        self.state.lock().disk_i_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().tree.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the linked extents in offset order.
    #[must_use]
    pub fn extents(&self) -> Vec<Arc<OrderedExtent>> {
        self.state.lock().tree.iter().map(Arc::clone).collect()
    }

    /// Record a freshly allocated extent before its write-back I/O is issued.
    ///
    /// Marks `[file_offset, file_offset + len)` as `ORDERED` in the range
    /// markers and returns a handle; the tree keeps its own reference.
    ///
    /// # Errors
    ///
    /// `InvalidRange` for a zero-length range or one whose file or disk end
    /// overflows `u64`, `NoSpace` when the inode already tracks
    /// `max_extents` extents. Nothing is marked on error.
    ///
    /// # Panics
    ///
    /// If the range overlaps a live ordered extent: the same bytes were
    /// reserved twice.
    pub fn add_ordered_extent(
        &self,
        file_offset: u64,
        disk_start: u64,
        len: u64,
    ) -> Result<Arc<OrderedExtent>> {
        let range = ByteRange::with_len(file_offset, len)
            .filter(|range| !range.is_empty() && disk_start.checked_add(len).is_some())
            .ok_or(FfsError::InvalidRange {
                start: file_offset,
                len,
            })?;

        let mut state = self.state.lock();
        if state.tree.len() >= self.config.max_extents {
            drop(state);
            warn!(
                target: "ffs::ordered",
                event = "ordered_insert_limit",
                ino = self.inode.0,
                file_offset,
                len,
                max_extents = self.config.max_extents
            );
            return Err(FfsError::NoSpace);
        }

        let ordered = Arc::new(OrderedExtent::new(file_offset, disk_start, len));
        if let Err(existing) = state.tree.insert(Arc::clone(&ordered)) {
            drop(state);
            error!(
                target: "ffs::ordered",
                event = "ordered_insert_overlap",
                ino = self.inode.0,
                file_offset,
                len,
                existing_offset = existing.file_offset(),
                existing_len = existing.len()
            );
            panic!(
                "{}: ordered extent {range} overlaps live extent {}",
                self.inode,
                existing.range()
            );
        }
        self.markers.mark_ordered(range);
        drop(state);

        OrderedStats::bump(&self.stats.inserted);
        debug!(
            target: "ffs::ordered",
            event = "ordered_insert",
            ino = self.inode.0,
            file_offset,
            len,
            disk_start
        );
        Ok(ordered)
    }

    /// Ordered extent containing `file_offset`.
    #[must_use]
    pub fn lookup(&self, file_offset: u64) -> Option<Arc<OrderedExtent>> {
        self.search_counted(file_offset)
    }

    fn search_counted(&self, file_offset: u64) -> Option<Arc<OrderedExtent>> {
        let lookup = self.state.lock().tree.search(file_offset);
        if lookup.cache_hit {
            OrderedStats::bump(&self.stats.cache_hits);
        } else {
            OrderedStats::bump(&self.stats.cache_misses);
        }
        trace!(
            target: "ffs::ordered",
            event = "ordered_lookup",
            ino = self.inode.0,
            file_offset,
            found = lookup.found.is_some(),
            cache_hit = lookup.cache_hit
        );
        lookup.found
    }

    /// Ordered extent with the largest start offset `<= file_offset`.
    #[must_use]
    pub fn lookup_nearest_before(&self, file_offset: u64) -> Option<Arc<OrderedExtent>> {
        self.state.lock().tree.nearest_before(file_offset)
    }

    /// Lowest-offset ordered extent overlapping `[start, start + len)`.
    #[must_use]
    pub fn lookup_first_in_range(&self, start: u64, len: u64) -> Option<Arc<OrderedExtent>> {
        self.state
            .lock()
            .tree
            .first_overlapping(ByteRange::saturating(start, len))
    }

    /// Attach a sector checksum to the ordered extent covering `file_offset`.
    ///
    /// # Panics
    ///
    /// If no ordered extent covers `file_offset`.
    pub fn add_sum(&self, file_offset: u64, sum: SectorSum) {
        let Some(ordered) = self.lookup(file_offset) else {
            error!(
                target: "ffs::ordered",
                event = "ordered_sum_orphan",
                ino = self.inode.0,
                file_offset,
                bytenr = sum.bytenr
            );
            panic!(
                "{}: checksum for offset {file_offset} (bytenr {}) has no ordered extent",
                self.inode, sum.bytenr
            );
        };
        debug_assert!(
            !ordered.is_complete(),
            "checksum attached after completion"
        );
        ordered.push_sum(sum);
    }

    /// Checksum recorded for the sector holding `file_offset`, if that data
    /// is still in flight.
    #[must_use]
    pub fn find_sum(&self, file_offset: u64) -> Option<u32> {
        let ordered = self.lookup(file_offset)?;
        let sector = u64::from(self.config.sector_size);
        let delta = file_offset - ordered.file_offset();
        let bytenr = ordered.disk_start().checked_add(delta / sector * sector)?;
        ordered.find_sum(bytenr)
    }

    pub(crate) fn complete_subrange_inner(
        &self,
        file_offset: u64,
        io_size: u64,
    ) -> SubrangeOutcome {
        self.markers
            .clear_ordered(ByteRange::saturating(file_offset, io_size));

        let Some(ordered) = self.search_counted(file_offset) else {
            trace!(
                target: "ffs::ordered",
                event = "ordered_subrange_untracked",
                ino = self.inode.0,
                file_offset,
                io_size
            );
            return SubrangeOutcome::Untracked;
        };

        if self
            .markers
            .range_has_flag(ordered.range(), RangeFlags::ORDERED, false)
        {
            return SubrangeOutcome::Pending;
        }
        if !ordered.test_and_set_io_done() {
            return SubrangeOutcome::Pending;
        }

        OrderedStats::bump(&self.stats.io_done);
        debug!(
            target: "ffs::ordered",
            event = "ordered_io_done",
            ino = self.inode.0,
            file_offset = ordered.file_offset(),
            len = ordered.len()
        );
        SubrangeOutcome::Done(ordered)
    }

    /// Report that the I/O for `[file_offset, file_offset + io_size)` finished.
    ///
    /// Returns `true` for exactly one caller per ordered extent: the one
    /// whose report finishes the last outstanding sub-range. That caller
    /// drives persistence and removal. Offsets with no ordered extent also
    /// return `true`, as there is nothing left to wait for.
    pub fn complete_subrange(&self, file_offset: u64, io_size: u64) -> bool {
        match self.complete_subrange_inner(file_offset, io_size) {
            SubrangeOutcome::Pending => false,
            SubrangeOutcome::Done(_) | SubrangeOutcome::Untracked => true,
        }
    }

    /// Unlink `ordered` from the tree, set `COMPLETE` and wake its waiters.
    ///
    /// Returns false if `ordered` was not linked (already removed).
    pub fn remove_ordered_extent(&self, ordered: &Arc<OrderedExtent>) -> bool {
        let erased = self.state.lock().tree.erase(ordered);
        let linked = erased.is_some();
        drop(erased);
        self.signal_removed(ordered, linked);
        linked
    }

    pub(crate) fn signal_removed(&self, ordered: &OrderedExtent, linked: bool) {
        ordered.mark_complete();
        if linked {
            OrderedStats::bump(&self.stats.removed);
            debug!(
                target: "ffs::ordered",
                event = "ordered_remove",
                ino = self.inode.0,
                file_offset = ordered.file_offset(),
                len = ordered.len(),
                error = ordered.has_error()
            );
        }
    }

    /// End-of-I/O handler for one sub-range.
    ///
    /// The caller that completes the extent persists it through
    /// `persistence`, advances the durable size and removes the extent.
    /// Returns `Ok(true)` for that caller, `Ok(false)` otherwise.
    ///
    /// # Errors
    ///
    /// Whatever `persistence` returns. The extent is still removed and its
    /// waiters released, with [`OrderedExtent::has_error`] set.
    pub fn finish_ordered_io(
        &self,
        file_offset: u64,
        io_size: u64,
        persistence: &dyn OrderedPersistence,
    ) -> Result<bool> {
        match self.complete_subrange_inner(file_offset, io_size) {
            SubrangeOutcome::Done(ordered) => {
                self.finish_ordered_extent(&ordered, persistence)?;
                Ok(true)
            }
            SubrangeOutcome::Pending | SubrangeOutcome::Untracked => Ok(false),
        }
    }

    /// Like [`finish_ordered_io`](Self::finish_ordered_io), but hands a
    /// completed extent to `queue` for a worker instead of persisting inline.
    pub fn queue_finished_io(
        &self,
        file_offset: u64,
        io_size: u64,
        queue: &CompletionQueue,
    ) -> bool {
        match self.complete_subrange_inner(file_offset, io_size) {
            SubrangeOutcome::Done(ordered) => {
                queue.push(ordered);
                true
            }
            SubrangeOutcome::Pending | SubrangeOutcome::Untracked => false,
        }
    }

    /// Persist every queued extent. Returns how many were processed.
    ///
    /// # Errors
    ///
    /// The first persistence error; later entries are still processed so
    /// their waiters are released.
    pub fn finish_queued(
        &self,
        queue: &CompletionQueue,
        persistence: &dyn OrderedPersistence,
    ) -> Result<usize> {
        let mut processed = 0_usize;
        let mut first_err = None;
        while let Some(ordered) = queue.pop() {
            if let Err(err) = self.finish_ordered_extent(&ordered, persistence) {
                first_err.get_or_insert(err);
            }
            processed += 1;
        }
        first_err.map_or(Ok(processed), Err)
    }

    /// Worker step: wait up to `timeout` for one queued extent and persist it.
    ///
    /// Returns `Ok(false)` if nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Whatever `persistence` returns for the popped extent.
    pub fn finish_next_queued(
        &self,
        queue: &CompletionQueue,
        persistence: &dyn OrderedPersistence,
        timeout: Duration,
    ) -> Result<bool> {
        let Some(ordered) = queue.pop_timeout(timeout) else {
            return Ok(false);
        };
        self.finish_ordered_extent(&ordered, persistence)?;
        Ok(true)
    }

    fn finish_ordered_extent(
        &self,
        ordered: &Arc<OrderedExtent>,
        persistence: &dyn OrderedPersistence,
    ) -> Result<()> {
        let sums = ordered.take_sums();
        if let Err(err) = persistence.persist_ordered(self.inode, ordered, &sums) {
            ordered.set_error();
            OrderedStats::bump(&self.stats.persist_failures);
            warn!(
                target: "ffs::ordered",
                event = "ordered_persist_failed",
                ino = self.inode.0,
                file_offset = ordered.file_offset(),
                len = ordered.len(),
                error = %err
            );
            self.remove_ordered_extent(ordered);
            return Err(err);
        }

        // Size update and unlink share one critical section so a neighbour
        // completing concurrently sees either both or neither.
        let mut state = self.state.lock();
        self.update_disk_i_size_locked(&mut state, ordered);
        let erased = state.tree.erase(ordered);
        drop(state);
        let linked = erased.is_some();
        drop(erased);
        self.signal_removed(ordered, linked);
        Ok(())
    }
}
