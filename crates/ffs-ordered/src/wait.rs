//! Flushing and waiting on ordered extents.

use crate::extent::OrderedExtent;
use crate::stats::OrderedStats;
use crate::tracker::OrderedTracker;
use ffs_error::Result;
use ffs_types::ByteRange;
use std::sync::Arc;
use tracing::{debug, trace};

impl OrderedTracker {
    /// Push the extent's dirty pages to the block layer and, if `wait`,
    /// block until the extent is complete.
    ///
    /// Must not be called with the tree mutex held. Not cancellable: callers
    /// that cannot block pass `wait = false` and poll
    /// [`OrderedExtent::is_complete`].
    ///
    /// # Errors
    ///
    /// Propagates a failed flush request; no wait happens in that case.
    pub fn start_ordered_extent(&self, ordered: &Arc<OrderedExtent>, wait: bool) -> Result<()> {
        if !ordered.is_complete() {
            trace!(
                target: "ffs::ordered",
                event = "ordered_flush",
                ino = self.inode().0,
                file_offset = ordered.file_offset(),
                len = ordered.len()
            );
            self.writeback.flush_range(self.inode(), ordered.range())?;
            OrderedStats::bump(&self.stats.flushes);
        }
        if wait {
            OrderedStats::bump(&self.stats.waits);
            debug!(
                target: "ffs::ordered",
                event = "ordered_wait",
                ino = self.inode().0,
                file_offset = ordered.file_offset(),
                len = ordered.len()
            );
            ordered.wait_complete();
        }
        Ok(())
    }

    /// Flush, then wait for, every ordered extent overlapping
    /// `[start, start + len)`. A `len` running past `u64::MAX` means "to EOF".
    ///
    /// The first pass only starts I/O so that unrelated extents are not
    /// serialised behind a wait; the second pass waits. Extents that finish
    /// and leave the tree between passes are simply not found again.
    ///
    /// # Errors
    ///
    /// Propagates the first failed flush request.
    pub fn wait_ordered_range(&self, start: u64, len: u64) -> Result<()> {
        let range = ByteRange::saturating(start, len);
        if range.is_empty() {
            return Ok(());
        }
        for wait in [false, true] {
            self.walk_range_backwards(range, wait)?;
        }
        debug!(
            target: "ffs::ordered",
            event = "ordered_range_waited",
            ino = self.inode().0,
            start = range.start,
            end = range.end
        );
        Ok(())
    }

    fn walk_range_backwards(&self, range: ByteRange, wait: bool) -> Result<()> {
        let mut end = range.end;
        while end > range.start {
            let Some(ordered) = self.lookup_nearest_before(end - 1) else {
                break;
            };
            if !ordered.range().overlaps(range) {
                break;
            }
            self.start_ordered_extent(&ordered, wait)?;
            if ordered.file_offset() <= range.start {
                break;
            }
            end = ordered.file_offset();
        }
        Ok(())
    }

    /// Wait out all in-flight I/O at or beyond `new_size`, then record
    /// `new_size` as the logical file size.
    ///
    /// # Errors
    ///
    /// Propagates a failed flush request; the size is left unchanged.
    pub fn prepare_truncate(&self, new_size: u64) -> Result<()> {
        self.wait_ordered_range(new_size, u64::MAX)?;
        self.set_logical_size(new_size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::test_support::{MemPersistence, tracker};
    use ffs_types::ByteRange;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn start_without_wait_only_flushes() {
        let (t, _, writeback) = tracker();
        let ordered = t.add_ordered_extent(4096, 0, 4096).unwrap();
        t.start_ordered_extent(&ordered, false).unwrap();
        assert_eq!(
            writeback.flushed(),
            vec![ByteRange {
                start: 4096,
                end: 8192
            }]
        );
        assert_eq!(t.stats().waits, 0);
    }

    #[test]
    fn start_on_complete_extent_skips_flush() {
        let (t, _, writeback) = tracker();
        let ordered = t.add_ordered_extent(0, 0, 4096).unwrap();
        t.remove_ordered_extent(&ordered);
        t.start_ordered_extent(&ordered, true).unwrap();
        assert!(writeback.flushed().is_empty());
    }

    #[test]
    fn start_and_wait_blocks_until_finished() {
        let (t, _, _) = tracker();
        let t = Arc::new(t);
        t.set_logical_size(4096);
        let ordered = t.add_ordered_extent(0, 0, 4096).unwrap();
        let finisher = {
            let t = Arc::clone(&t);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                t.finish_ordered_io(0, 4096, &MemPersistence::default())
            })
        };
        t.start_ordered_extent(&ordered, true).unwrap();
        assert!(ordered.is_complete());
        assert!(finisher.join().expect("finisher").unwrap());
    }

    #[test]
    fn range_wait_flushes_only_overlapping_extents() {
        let (t, _, writeback) = tracker();
        let extents: Vec<_> = [0_u64, 8192, 16384, 24576]
            .iter()
            .map(|&off| t.add_ordered_extent(off, off, 4096).unwrap())
            .collect();
        // Pass two would block on live extents; complete them up front.
        for ordered in &extents[1..3] {
            ordered.mark_complete();
        }
        t.walk_range_backwards(
            ByteRange {
                start: 10000,
                end: 20000,
            },
            false,
        )
        .unwrap();
        assert!(writeback.flushed().is_empty());

        t.walk_range_backwards(
            ByteRange {
                start: 4096,
                end: 24576,
            },
            false,
        )
        .unwrap();
        assert!(writeback.flushed().is_empty());

        for ordered in &extents[1..3] {
            t.remove_ordered_extent(ordered);
        }
        let live_ends: Vec<u64> = t.extents().iter().map(|o| o.end()).collect();
        assert_eq!(live_ends, vec![4096, 28672]);

        t.walk_range_backwards(
            ByteRange {
                start: 4095,
                end: 24577,
            },
            false,
        )
        .unwrap();
        assert_eq!(
            writeback.flushed(),
            vec![
                ByteRange {
                    start: 24576,
                    end: 28672
                },
                ByteRange { start: 0, end: 4096 },
            ]
        );
    }

    #[test]
    fn range_wait_on_empty_tree_returns() {
        let (t, _, writeback) = tracker();
        t.wait_ordered_range(0, u64::MAX).unwrap();
        t.wait_ordered_range(100, 0).unwrap();
        assert!(writeback.flushed().is_empty());
    }

    #[test]
    fn prepare_truncate_waits_for_tail_extents() {
        let (t, _, _) = tracker();
        let t = Arc::new(t);
        t.set_logical_size(16384);
        t.add_ordered_extent(0, 0, 4096).unwrap();
        let tail = t.add_ordered_extent(8192, 8192, 8192).unwrap();
        let finisher = {
            let t = Arc::clone(&t);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                t.finish_ordered_io(8192, 8192, &MemPersistence::default())
            })
        };
        t.prepare_truncate(6000).unwrap();
        assert!(tail.is_complete());
        assert_eq!(t.logical_size(), 6000);
        // The extent below the cut is untouched.
        assert_eq!(t.len(), 1);
        finisher.join().expect("finisher").unwrap();
    }
}
