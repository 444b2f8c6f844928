//! Collaborator doubles shared by the unit tests.

use crate::{OrderedConfig, OrderedExtent, OrderedPersistence, OrderedTracker, WritebackScheduler};
use ffs_error::{FfsError, Result};
use ffs_extent::ExtentStateTree;
use ffs_types::{ByteRange, InodeNumber, SectorSum};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct RecordingWriteback {
    flushed: Mutex<Vec<ByteRange>>,
}

impl RecordingWriteback {
    pub(crate) fn flushed(&self) -> Vec<ByteRange> {
        self.flushed.lock().clone()
    }
}

impl WritebackScheduler for RecordingWriteback {
    fn flush_range(&self, _inode: InodeNumber, range: ByteRange) -> Result<()> {
        self.flushed.lock().push(range);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Persisted {
    pub(crate) file_offset: u64,
    pub(crate) disk_start: u64,
    pub(crate) sums: Vec<SectorSum>,
}

#[derive(Debug, Default)]
pub(crate) struct MemPersistence {
    fail: bool,
    persisted: Mutex<Vec<Persisted>>,
}

impl MemPersistence {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            persisted: Mutex::default(),
        }
    }

    pub(crate) fn persisted(&self) -> Vec<Persisted> {
        self.persisted.lock().clone()
    }
}

impl OrderedPersistence for MemPersistence {
    fn persist_ordered(
        &self,
        _inode: InodeNumber,
        ordered: &OrderedExtent,
        sums: &[SectorSum],
    ) -> Result<()> {
        if self.fail {
            return Err(FfsError::ReadOnly);
        }
        self.persisted.lock().push(Persisted {
            file_offset: ordered.file_offset(),
            disk_start: ordered.disk_start(),
            sums: sums.to_vec(),
        });
        Ok(())
    }
}

pub(crate) fn tracker() -> (
    OrderedTracker,
    Arc<ExtentStateTree>,
    Arc<RecordingWriteback>,
) {
    let markers = Arc::new(ExtentStateTree::new());
    let writeback = Arc::new(RecordingWriteback::default());
    let tracker = OrderedTracker::new(
        InodeNumber(257),
        OrderedConfig::default(),
        markers.clone(),
        writeback.clone(),
    )
    .expect("default config");
    (tracker, markers, writeback)
}
