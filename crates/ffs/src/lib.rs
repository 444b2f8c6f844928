#![forbid(unsafe_code)]
//! FrankenFS write-back ordering: public API facade.
//!
//! Re-exports the ordered-extent tracker together with the range-marker
//! tree and shared types it is built on, so downstream consumers depend on
//! a single crate.

use std::sync::Arc;

pub use ffs_error::{FfsError, Result};
pub use ffs_extent::{ExtentStateTree, FlaggedRange, RangeFlags, RangeMarkers};
pub use ffs_ordered::{
    CompletionQueue, OrderedConfig, OrderedExtent, OrderedPersistence, OrderedStats,
    OrderedStatsSnapshot, OrderedTracker, WritebackScheduler,
};
pub use ffs_types::{ByteRange, DEFAULT_SECTOR_SIZE, InodeNumber, SectorSum};

/// Build a tracker for `inode` backed by a fresh in-memory range-marker tree.
///
/// Returns the marker tree as well so the caller can record `DIRTY` and
/// `DELALLOC` state in it.
///
/// # Errors
///
/// `InvalidConfig` if `config` fails validation.
pub fn open_tracker(
    inode: InodeNumber,
    config: OrderedConfig,
    writeback: Arc<dyn WritebackScheduler>,
) -> Result<(OrderedTracker, Arc<ExtentStateTree>)> {
    let markers = Arc::new(ExtentStateTree::new());
    let tracker = OrderedTracker::new(inode, config, markers.clone(), writeback)?;
    Ok((tracker, markers))
}
