//! Durable file size advancement.
//!
//! `disk_i_size` may only move across bytes that can no longer receive
//! earlier-in-file data: no ordered extent still in flight below the new
//! size, and no delalloc (dirty, unallocated) bytes in between. Both facts
//! are read from the tree and the range markers alone, so completions may
//! arrive in any order.

use crate::extent::OrderedExtent;
use crate::stats::OrderedStats;
use crate::tracker::{OrderedTracker, TreeState};
use ffs_extent::RangeFlags;
use ffs_types::ByteRange;
use tracing::{debug, trace};

impl OrderedTracker {
    /// Advance the durable size after `ordered` has been persisted.
    ///
    /// Returns the (possibly unchanged) durable size.
    /// [`finish_ordered_io`](Self::finish_ordered_io) calls this itself;
    /// call it directly only when driving persistence by hand.
    pub fn update_disk_i_size(&self, ordered: &OrderedExtent) -> u64 {
        let mut state = self.state.lock();
        self.update_disk_i_size_locked(&mut state, ordered)
    }

    pub(crate) fn update_disk_i_size_locked(
        &self,
        state: &mut TreeState,
        ordered: &OrderedExtent,
    ) -> u64 {
        let i_size = self.logical_size();
        let disk_i_size = state.disk_i_size;

        if disk_i_size >= i_size || ordered.end() <= disk_i_size {
            return disk_i_size;
        }

        let gap = ByteRange {
            start: disk_i_size,
            end: ordered.end(),
        };
        if self
            .markers
            .range_has_flag(gap, RangeFlags::DELALLOC, false)
        {
            self.trace_blocked(ordered, disk_i_size, "delalloc_below");
            return disk_i_size;
        }

        for prev in state.tree.predecessors(ordered.file_offset()) {
            if prev.end() <= disk_i_size {
                break;
            }
            if prev.file_offset() < i_size {
                self.trace_blocked(ordered, disk_i_size, "ordered_below");
                return disk_i_size;
            }
        }

        let mut new_size = ordered.end().min(i_size);

        // Past this extent, bytes up to the next in-flight extent (or EOF)
        // are durable unless something is still waiting for allocation.
        let frontier = state
            .tree
            .successor(ordered.file_offset())
            .map_or(i_size, |next| next.file_offset());
        if frontier > ordered.end() {
            let tail = ByteRange {
                start: ordered.end(),
                end: frontier,
            };
            if !self
                .markers
                .range_has_flag(tail, RangeFlags::DELALLOC, false)
            {
                new_size = new_size.max(frontier.min(i_size));
            }
        }

        let new_size = new_size.max(disk_i_size);
        state.disk_i_size = new_size;
        if new_size > disk_i_size {
            OrderedStats::bump(&self.stats.disk_size_advances);
            debug!(
                target: "ffs::ordered",
                event = "disk_isize_advance",
                ino = self.inode().0,
                old = disk_i_size,
                new = new_size,
                i_size,
                file_offset = ordered.file_offset()
            );
        }
        new_size
    }

    fn trace_blocked(&self, ordered: &OrderedExtent, disk_i_size: u64, reason: &'static str) {
        trace!(
            target: "ffs::ordered",
            event = "disk_isize_blocked",
            ino = self.inode().0,
            disk_i_size,
            file_offset = ordered.file_offset(),
            reason
        );
    }
}
