#![forbid(unsafe_code)]
//! Per-inode byte-range state markers.
//!
//! Tracks which bytes of a file are dirty in the page cache, which are
//! dirty but have no disk location yet (delalloc), and which belong to an
//! ordered extent whose write-back I/O has not finished. The writeback
//! scheduler and the ordered-extent tracker both consult these markers.
//!
//! State is stored as sorted, non-overlapping spans. Bytes with no flags
//! have no span, and neighbouring spans carrying identical flags are
//! coalesced so a long sequential write stays a single entry.

use ffs_types::ByteRange;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use tracing::trace;

/// Bit set of per-byte state flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RangeFlags(u32);

impl RangeFlags {
    pub const EMPTY: Self = Self(0);
    /// Page-cache data not yet written back.
    pub const DIRTY: Self = Self(1 << 0);
    /// Dirty data with no disk location reserved yet ("pending write").
    pub const DELALLOC: Self = Self(1 << 1);
    /// Covered by an ordered extent whose I/O has not completed.
    pub const ORDERED: Self = Self(1 << 2);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if `self` and `other` share any bit.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for RangeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for RangeFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RangeFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for RangeFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for RangeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::DIRTY) {
            names.push("DIRTY");
        }
        if self.contains(Self::DELALLOC) {
            names.push("DELALLOC");
        }
        if self.contains(Self::ORDERED) {
            names.push("ORDERED");
        }
        if names.is_empty() {
            return f.write_str("RangeFlags(EMPTY)");
        }
        write!(f, "RangeFlags({})", names.join("|"))
    }
}

/// Byte-range marker contract consumed by the ordered-extent tracker.
///
/// Implementations must be safe to call from any thread and must not call
/// back into the tracker.
pub trait RangeMarkers: Send + Sync {
    /// Set `flags` on every byte of `range`.
    fn set_flags(&self, range: ByteRange, flags: RangeFlags);

    /// Clear `flags` from every byte of `range`.
    fn clear_flags(&self, range: ByteRange, flags: RangeFlags);

    /// Test `flags` over `range`.
    ///
    /// With `filled == true`, every byte must carry all of `flags`; an empty
    /// range is trivially filled. With `filled == false`, any single byte
    /// carrying any of `flags` is enough.
    fn range_has_flag(&self, range: ByteRange, flags: RangeFlags, filled: bool) -> bool;

    fn mark_ordered(&self, range: ByteRange) {
        self.set_flags(range, RangeFlags::ORDERED);
    }

    fn clear_ordered(&self, range: ByteRange) {
        self.clear_flags(range, RangeFlags::ORDERED);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateSpan {
    end: u64,
    flags: RangeFlags,
}

/// One run of identically-flagged bytes, as returned by [`ExtentStateTree::spans`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedRange {
    pub range: ByteRange,
    pub flags: RangeFlags,
}

/// In-memory [`RangeMarkers`] implementation for one inode.
#[derive(Debug, Default)]
pub struct ExtentStateTree {
    spans: Mutex<BTreeMap<u64, StateSpan>>,
}

impl ExtentStateTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all flagged spans in offset order.
    #[must_use]
    pub fn spans(&self) -> Vec<FlaggedRange> {
        self.spans
            .lock()
            .iter()
            .map(|(&start, span)| FlaggedRange {
                range: ByteRange {
                    start,
                    end: span.end,
                },
                flags: span.flags,
            })
            .collect()
    }
}

/// Split the span straddling `pos` so that a span boundary lands on `pos`.
fn split_at(spans: &mut BTreeMap<u64, StateSpan>, pos: u64) {
    let Some((start, span)) = spans
        .range(..pos)
        .next_back()
        .map(|(&start, span)| (start, *span))
    else {
        return;
    };
    if span.end > pos {
        spans.insert(
            start,
            StateSpan {
                end: pos,
                flags: span.flags,
            },
        );
        spans.insert(pos, span);
    }
}

/// Merge touching spans with identical flags around `range`.
fn coalesce(spans: &mut BTreeMap<u64, StateSpan>, range: ByteRange) {
    let first = spans
        .range(..range.start)
        .next_back()
        .map_or(range.start, |(&start, _)| start);
    let keys: Vec<u64> = spans.range(first..=range.end).map(|(&k, _)| k).collect();

    let mut prev: Option<u64> = None;
    for key in keys {
        let Some(cur) = spans.get(&key).copied() else {
            continue;
        };
        if let Some(prev_key) = prev {
            if let Some(prev_span) = spans.get_mut(&prev_key) {
                if prev_span.end == key && prev_span.flags == cur.flags {
                    prev_span.end = cur.end;
                    spans.remove(&key);
                    continue;
                }
            }
        }
        prev = Some(key);
    }
}

impl RangeMarkers for ExtentStateTree {
    fn set_flags(&self, range: ByteRange, flags: RangeFlags) {
        if range.is_empty() || flags.is_empty() {
            return;
        }
        let mut spans = self.spans.lock();
        split_at(&mut spans, range.start);
        split_at(&mut spans, range.end);

        let mut gaps = Vec::new();
        let mut cursor = range.start;
        for (&start, span) in spans.range_mut(range.start..range.end) {
            if start > cursor {
                gaps.push((cursor, start));
            }
            span.flags |= flags;
            cursor = span.end;
        }
        if cursor < range.end {
            gaps.push((cursor, range.end));
        }
        for (start, end) in gaps {
            spans.insert(start, StateSpan { end, flags });
        }
        coalesce(&mut spans, range);
        drop(spans);

        trace!(
            target: "ffs::extent_state",
            event = "state_set",
            start = range.start,
            end = range.end,
            flags = flags.bits()
        );
    }

    fn clear_flags(&self, range: ByteRange, flags: RangeFlags) {
        if range.is_empty() || flags.is_empty() {
            return;
        }
        let mut spans = self.spans.lock();
        split_at(&mut spans, range.start);
        split_at(&mut spans, range.end);

        let mut emptied = Vec::new();
        for (&start, span) in spans.range_mut(range.start..range.end) {
            span.flags = span.flags & !flags;
            if span.flags.is_empty() {
                emptied.push(start);
            }
        }
        for start in emptied {
            spans.remove(&start);
        }
        coalesce(&mut spans, range);
        drop(spans);

        trace!(
            target: "ffs::extent_state",
            event = "state_clear",
            start = range.start,
            end = range.end,
            flags = flags.bits()
        );
    }

    fn range_has_flag(&self, range: ByteRange, flags: RangeFlags, filled: bool) -> bool {
        if range.is_empty() {
            return filled;
        }
        let spans = self.spans.lock();
        if !filled {
            // Spans are disjoint and sorted, so their ends are sorted too.
            return spans
                .range(..range.end)
                .rev()
                .take_while(|(_, span)| span.end > range.start)
                .any(|(_, span)| span.flags.intersects(flags));
        }

        let mut cursor = range.start;
        let first = spans
            .range(..=range.start)
            .next_back()
            .map_or(range.start, |(&start, _)| start);
        for (&start, span) in spans.range(first..range.end) {
            if span.end <= cursor {
                continue;
            }
            if start > cursor || !span.flags.contains(flags) {
                return false;
            }
            cursor = span.end;
            if cursor >= range.end {
                return true;
            }
        }
        false
    }
}
