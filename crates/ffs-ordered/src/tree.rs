//! Per-inode interval tree of ordered extents.
//!
//! Keyed by file offset; live ranges never overlap. The tree is not
//! synchronized on its own: [`OrderedTracker`](crate::OrderedTracker) keeps
//! it behind the inode's tree mutex.

use crate::extent::OrderedExtent;
use ffs_types::ByteRange;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Outcome of a lookup, telling the caller whether the cached hint served it.
#[derive(Debug)]
pub(crate) struct Lookup {
    pub(crate) found: Option<Arc<OrderedExtent>>,
    pub(crate) cache_hit: bool,
}

#[derive(Debug, Default)]
pub(crate) struct OrderedTree {
    entries: BTreeMap<u64, Arc<OrderedExtent>>,
    /// Key of the most recently visited entry. May be stale; always verified.
    last: Option<u64>,
}

impl OrderedTree {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Link `ordered`, or return the live entry it would overlap.
    pub(crate) fn insert(
        &mut self,
        ordered: Arc<OrderedExtent>,
    ) -> Result<(), Arc<OrderedExtent>> {
        if let Some(existing) = self.first_overlapping(ordered.range()) {
            return Err(existing);
        }
        self.last = Some(ordered.file_offset());
        self.entries.insert(ordered.file_offset(), ordered);
        Ok(())
    }

    /// Entry whose range contains `file_offset`.
    ///
    /// On a miss the nearest preceding entry (or failing that, the next one)
    /// becomes the cached hint for the following call.
    pub(crate) fn search(&mut self, file_offset: u64) -> Lookup {
        if let Some(hit) = self
            .last
            .and_then(|key| self.entries.get(&key))
            .filter(|ordered| ordered.contains(file_offset))
        {
            return Lookup {
                found: Some(Arc::clone(hit)),
                cache_hit: true,
            };
        }

        let prev = self.entries.range(..=file_offset).next_back();
        self.last = prev
            .or_else(|| self.entries.range(file_offset..).next())
            .map(|(&key, _)| key);
        Lookup {
            found: prev
                .map(|(_, ordered)| ordered)
                .filter(|ordered| ordered.contains(file_offset))
                .map(Arc::clone),
            cache_hit: false,
        }
    }

    /// Entry with the largest `file_offset <= file_offset`.
    pub(crate) fn nearest_before(&self, file_offset: u64) -> Option<Arc<OrderedExtent>> {
        self.entries
            .range(..=file_offset)
            .next_back()
            .map(|(_, ordered)| Arc::clone(ordered))
    }

    /// Lowest-offset entry sharing at least one byte with `range`.
    pub(crate) fn first_overlapping(&self, range: ByteRange) -> Option<Arc<OrderedExtent>> {
        if range.is_empty() {
            return None;
        }
        if let Some((_, prev)) = self.entries.range(..=range.start).next_back() {
            if prev.end() > range.start {
                return Some(Arc::clone(prev));
            }
        }
        self.entries
            .range((Bound::Excluded(range.start), Bound::Excluded(range.end)))
            .next()
            .map(|(_, ordered)| Arc::clone(ordered))
    }

    /// Entries strictly before `file_offset`, nearest first.
    pub(crate) fn predecessors(
        &self,
        file_offset: u64,
    ) -> impl Iterator<Item = &Arc<OrderedExtent>> {
        self.entries.range(..file_offset).rev().map(|(_, ordered)| ordered)
    }

    /// First entry strictly after `file_offset`.
    pub(crate) fn successor(&self, file_offset: u64) -> Option<&Arc<OrderedExtent>> {
        self.entries
            .range((Bound::Excluded(file_offset), Bound::Unbounded))
            .next()
            .map(|(_, ordered)| ordered)
    }

    /// Unlink `ordered` if it is the entry linked at its offset.
    ///
    /// Returns the tree's reference; the extent itself lives on while other
    /// handles exist.
    pub(crate) fn erase(&mut self, ordered: &Arc<OrderedExtent>) -> Option<Arc<OrderedExtent>> {
        let key = ordered.file_offset();
        if !self
            .entries
            .get(&key)
            .is_some_and(|linked| Arc::ptr_eq(linked, ordered))
        {
            return None;
        }
        self.last = None;
        self.entries.remove(&key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<OrderedExtent>> {
        self.entries.values()
    }
}
