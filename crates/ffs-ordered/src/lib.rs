#![forbid(unsafe_code)]
//! Ordered-extent tracking for asynchronous write-back.
//!
//! When write-back allocates disk space for dirty file data, the allocated
//! range becomes an *ordered extent* and stays in a per-inode tree until its
//! I/O has finished and its metadata (file extent item, data checksums) has
//! been persisted. The tracker:
//!
//! - keeps live extents non-overlapping and searchable by file offset;
//! - collects per-sector checksums until persistence consumes them;
//! - detects, exactly once, when every I/O sub-range of an extent finished;
//! - lets `fsync`/truncate flush and wait on any byte range;
//! - advances the durable file size (`disk_i_size`) only across bytes that
//!   can no longer gain earlier data, whatever order I/O completes in.
//!
//! # Locking
//!
//! One short-held mutex per inode guards the tree and `disk_i_size`.
//! Extent flags are atomics; each extent has its own condvar for waiters.
//! Blocking happens only in [`OrderedTracker::start_ordered_extent`] with
//! `wait = true` and in the second pass of
//! [`OrderedTracker::wait_ordered_range`], never under the tree mutex.

mod config;
mod disk_size;
mod extent;
mod queue;
mod stats;
mod tracker;
mod tree;
mod wait;

#[cfg(test)]
mod test_support;

pub use config::OrderedConfig;
pub use extent::OrderedExtent;
pub use queue::CompletionQueue;
pub use stats::{OrderedStats, OrderedStatsSnapshot};
pub use tracker::OrderedTracker;

use ffs_error::Result;
use ffs_types::{ByteRange, InodeNumber, SectorSum};

/// Pushes dirty page-cache data in a range towards the block layer.
///
/// Requests may complete asynchronously and must tolerate repeats: range
/// waits re-issue flushes for extents that are still in flight.
pub trait WritebackScheduler: Send + Sync {
    fn flush_range(&self, inode: InodeNumber, range: ByteRange) -> Result<()>;
}

/// Writes the durable metadata of a completed ordered extent.
pub trait OrderedPersistence: Send + Sync {
    /// Persist the file extent item for `ordered` and its data checksums.
    fn persist_ordered(
        &self,
        inode: InodeNumber,
        ordered: &OrderedExtent,
        sums: &[SectorSum],
    ) -> Result<()>;
}
