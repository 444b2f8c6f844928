//! The ordered extent: one allocated byte range under write-back.

use ffs_types::{ByteRange, SectorSum};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

const IO_DONE: u32 = 1 << 0;
const COMPLETE: u32 = 1 << 1;
const IOERR: u32 = 1 << 2;

/// A contiguous file range whose disk space is allocated and whose data is
/// being written back asynchronously.
///
/// Shared as `Arc<OrderedExtent>`: the tracker's tree holds one reference
/// while the extent is linked, every handle returned to a caller holds one,
/// and so does a pending [`CompletionQueue`](crate::CompletionQueue) entry.
/// The extent is freed when the last of those drops.
///
/// Offsets, length and disk placement are immutable and readable without
/// any lock. Flags are set once each with atomic test-and-set.
pub struct OrderedExtent {
    file_offset: u64,
    len: u64,
    disk_start: u64,
    flags: AtomicU32,
    sums: Mutex<Vec<SectorSum>>,
    wait_lock: Mutex<()>,
    wait: Condvar,
}

impl OrderedExtent {
    pub(crate) fn new(file_offset: u64, disk_start: u64, len: u64) -> Self {
        Self {
            file_offset,
            len,
            disk_start,
            flags: AtomicU32::new(0),
            sums: Mutex::new(Vec::new()),
            wait_lock: Mutex::new(()),
            wait: Condvar::new(),
        }
    }

    #[must_use]
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Always false: zero-length extents are rejected at insert time.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Exclusive end offset in the file.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.file_offset + self.len
    }

    #[must_use]
    pub fn disk_start(&self) -> u64 {
        self.disk_start
    }

    #[must_use]
    pub fn range(&self) -> ByteRange {
        ByteRange {
            start: self.file_offset,
            end: self.end(),
        }
    }

    #[must_use]
    pub fn contains(&self, file_offset: u64) -> bool {
        self.range().contains(file_offset)
    }

    /// All sub-range I/O for this extent has finished.
    #[must_use]
    pub fn is_io_done(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IO_DONE != 0
    }

    /// The extent has been removed from its tree; waiters may proceed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.flags.load(Ordering::Acquire) & COMPLETE != 0
    }

    /// Persisting this extent's metadata failed.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.flags.load(Ordering::Acquire) & IOERR != 0
    }

    /// Returns true only for the caller that flips `IO_DONE` from unset to set.
    pub(crate) fn test_and_set_io_done(&self) -> bool {
        self.flags.fetch_or(IO_DONE, Ordering::AcqRel) & IO_DONE == 0
    }

    pub(crate) fn set_error(&self) {
        self.flags.fetch_or(IOERR, Ordering::AcqRel);
    }

    /// Set `COMPLETE` and wake every thread blocked in [`wait_complete`].
    ///
    /// [`wait_complete`]: Self::wait_complete
    pub(crate) fn mark_complete(&self) -> bool {
        let first = self.flags.fetch_or(COMPLETE, Ordering::AcqRel) & COMPLETE == 0;
        // Taking the wait lock orders this wakeup after any waiter that saw
        // the flag clear has gone to sleep.
        let guard = self.wait_lock.lock();
        self.wait.notify_all();
        drop(guard);
        first
    }

    /// Block until `COMPLETE` is set. Must not be called with the tree lock held.
    pub fn wait_complete(&self) {
        let mut guard = self.wait_lock.lock();
        while !self.is_complete() {
            self.wait.wait(&mut guard);
        }
    }

    pub(crate) fn push_sum(&self, sum: SectorSum) {
        self.sums.lock().push(sum);
    }

    /// Snapshot of the attached checksum records, in append order.
    #[must_use]
    pub fn sums(&self) -> Vec<SectorSum> {
        self.sums.lock().clone()
    }

    /// Take ownership of the checksum list, leaving it empty.
    pub(crate) fn take_sums(&self) -> Vec<SectorSum> {
        std::mem::take(&mut *self.sums.lock())
    }

    pub(crate) fn find_sum(&self, bytenr: u64) -> Option<u32> {
        self.sums
            .lock()
            .iter()
            .rev()
            .find(|sum| sum.bytenr == bytenr)
            .map(|sum| sum.csum)
    }
}

impl fmt::Debug for OrderedExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedExtent")
            .field("file_offset", &self.file_offset)
            .field("len", &self.len)
            .field("disk_start", &self.disk_start)
            .field("io_done", &self.is_io_done())
            .field("complete", &self.is_complete())
            .field("error", &self.has_error())
            .finish_non_exhaustive()
    }
}
