#![forbid(unsafe_code)]

use ffs_error::Result;
use ffs_extent::{ExtentStateTree, RangeFlags, RangeMarkers};
use ffs_ordered::{
    CompletionQueue, OrderedConfig, OrderedExtent, OrderedPersistence, OrderedTracker,
    WritebackScheduler,
};
use ffs_types::{ByteRange, InodeNumber, SectorSum};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const BLOCK: u64 = 4096;

#[derive(Debug, Default)]
struct NullWriteback;

impl WritebackScheduler for NullWriteback {
    fn flush_range(&self, _inode: InodeNumber, _range: ByteRange) -> Result<()> {
        Ok(())
    }
}

/// Logs every flush request and forwards it to a test thread.
#[derive(Debug)]
struct ChannelWriteback {
    log: Mutex<Vec<ByteRange>>,
    tx: Mutex<mpsc::Sender<ByteRange>>,
}

impl WritebackScheduler for ChannelWriteback {
    fn flush_range(&self, _inode: InodeNumber, range: ByteRange) -> Result<()> {
        self.log.lock().push(range);
        self.tx
            .lock()
            .send(range)
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CountingPersistence {
    extents: AtomicUsize,
    sums: AtomicUsize,
}

impl OrderedPersistence for CountingPersistence {
    fn persist_ordered(
        &self,
        _inode: InodeNumber,
        _ordered: &OrderedExtent,
        sums: &[SectorSum],
    ) -> Result<()> {
        self.extents.fetch_add(1, Ordering::Relaxed);
        self.sums.fetch_add(sums.len(), Ordering::Relaxed);
        Ok(())
    }
}

fn new_tracker(
    writeback: Arc<dyn WritebackScheduler>,
) -> (Arc<OrderedTracker>, Arc<ExtentStateTree>) {
    let markers = Arc::new(ExtentStateTree::new());
    let tracker = OrderedTracker::new(
        InodeNumber(300),
        OrderedConfig::default(),
        markers.clone(),
        writeback,
    )
    .expect("tracker");
    (Arc::new(tracker), markers)
}

fn assert_no_overlap(tracker: &OrderedTracker) {
    let extents = tracker.extents();
    for pair in extents.windows(2) {
        assert!(
            pair[0].end() <= pair[1].file_offset(),
            "overlapping live extents: {:?} / {:?}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn concurrent_subrange_reports_complete_exactly_once() {
    for pieces in [1_u64, 2, 3, 8, 16] {
        for _round in 0..16 {
            let (tracker, markers) = new_tracker(Arc::new(NullWriteback));
            let ordered = tracker
                .add_ordered_extent(0, 1 << 30, pieces * BLOCK)
                .expect("insert");
            let barrier = Barrier::new(usize::try_from(pieces).expect("fits"));
            let wins = AtomicUsize::new(0);

            thread::scope(|scope| {
                for piece in 0..pieces {
                    let tracker = &tracker;
                    let barrier = &barrier;
                    let wins = &wins;
                    scope.spawn(move || {
                        barrier.wait();
                        if tracker.complete_subrange(piece * BLOCK, BLOCK) {
                            wins.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            });

            assert_eq!(wins.load(Ordering::Relaxed), 1, "pieces={pieces}");
            assert!(ordered.is_io_done());
            assert!(!markers.range_has_flag(ordered.range(), RangeFlags::ORDERED, false));
        }
    }
}

#[test]
fn range_wait_flushes_all_before_waiting_and_tolerates_vanishing_extents() {
    let (tx, rx) = mpsc::channel();
    let writeback = Arc::new(ChannelWriteback {
        log: Mutex::new(Vec::new()),
        tx: Mutex::new(tx),
    });
    let (tracker, _) = new_tracker(writeback.clone());
    tracker.set_logical_size(100_000);

    let offsets = [0_u64, 20_000, 40_000, 60_000, 80_000];
    let extents: Vec<Arc<OrderedExtent>> = offsets
        .iter()
        .map(|&off| tracker.add_ordered_extent(off, off, 8192).expect("insert"))
        .collect();

    let completer = {
        let tracker = Arc::clone(&tracker);
        thread::spawn(move || {
            let persistence = CountingPersistence::default();
            let mut seen = 0_usize;
            while !tracker.is_empty() {
                let Ok(range) = rx.recv_timeout(Duration::from_millis(10)) else {
                    continue;
                };
                seen += 1;
                if seen == 5 {
                    // Two extents finish between the flush and wait passes.
                    for off in [20_000, 60_000] {
                        tracker
                            .finish_ordered_io(off, 8192, &persistence)
                            .expect("finish");
                    }
                } else if seen > 5 {
                    tracker
                        .finish_ordered_io(range.start, range.len(), &persistence)
                        .expect("finish");
                }
            }
            persistence.extents.load(Ordering::Relaxed)
        })
    };

    tracker.wait_ordered_range(0, 100_000).expect("range wait");
    for ordered in &extents {
        assert!(ordered.is_complete());
    }

    let log = writeback.log.lock().clone();
    let pass_one: Vec<u64> = log[..5].iter().map(|r| r.start).collect();
    assert_eq!(pass_one, vec![80_000, 60_000, 40_000, 20_000, 0]);
    let pass_two: Vec<u64> = log[5..].iter().map(|r| r.start).collect();
    assert_eq!(pass_two, vec![80_000, 40_000, 0]);

    assert_eq!(completer.join().expect("completer"), 5);
    assert!(tracker.is_empty());
    assert_eq!(tracker.disk_i_size(), 100_000);
}

#[test]
fn concurrent_writers_keep_disk_size_monotonic() {
    const WRITERS: u64 = 4;
    const PER_WRITER: u64 = 32;
    let total = WRITERS * PER_WRITER * BLOCK;

    let (tracker, _) = new_tracker(Arc::new(NullWriteback));
    tracker.set_logical_size(total);
    let persistence = CountingPersistence::default();
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|| {
            let mut last = 0;
            while !done.load(Ordering::Acquire) {
                let now = tracker.disk_i_size();
                assert!(now >= last, "disk_i_size shrank: {last} -> {now}");
                assert!(now <= total);
                last = now;
                assert_no_overlap(&tracker);
                thread::yield_now();
            }
        });

        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let tracker = &tracker;
                let persistence = &persistence;
                scope.spawn(move || {
                    let offsets: Vec<u64> = (0..PER_WRITER)
                        .map(|i| (i * WRITERS + writer) * BLOCK)
                        .collect();
                    for &off in &offsets {
                        tracker
                            .add_ordered_extent(off, (1 << 32) + off, BLOCK)
                            .expect("insert");
                        tracker.add_sum(
                            off,
                            SectorSum {
                                bytenr: (1 << 32) + off,
                                csum: u32::try_from(off / BLOCK).expect("fits"),
                            },
                        );
                    }
                    for &off in offsets.iter().rev() {
                        tracker
                            .finish_ordered_io(off, BLOCK, persistence)
                            .expect("finish");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer");
        }
        done.store(true, Ordering::Release);
    });

    assert!(tracker.is_empty());
    assert_eq!(tracker.disk_i_size(), total);
    let count = usize::try_from(WRITERS * PER_WRITER).expect("fits");
    assert_eq!(persistence.extents.load(Ordering::Relaxed), count);
    assert_eq!(persistence.sums.load(Ordering::Relaxed), count);
    let stats = tracker.stats();
    assert_eq!(stats.inserted, WRITERS * PER_WRITER);
    assert_eq!(stats.removed, WRITERS * PER_WRITER);
    assert_eq!(stats.io_done, WRITERS * PER_WRITER);
}

#[test]
fn queue_workers_drain_completions() {
    const EXTENTS: u64 = 64;
    let (tracker, _) = new_tracker(Arc::new(NullWriteback));
    tracker.set_logical_size(EXTENTS * BLOCK);
    let queue = CompletionQueue::new();
    let persistence = CountingPersistence::default();
    let producers_done = AtomicBool::new(false);

    let handles: Vec<_> = (0..EXTENTS)
        .map(|i| {
            tracker
                .add_ordered_extent(i * BLOCK, i * BLOCK, BLOCK)
                .expect("insert")
        })
        .collect();

    thread::scope(|scope| {
        for _worker in 0..2 {
            scope.spawn(|| {
                loop {
                    let finished = tracker
                        .finish_next_queued(&queue, &persistence, Duration::from_millis(5))
                        .expect("finish queued");
                    if !finished && producers_done.load(Ordering::Acquire) && queue.is_empty() {
                        break;
                    }
                }
            });
        }

        // Two half-block I/Os per extent, reported from two threads.
        let halves = [0, BLOCK / 2];
        let producers: Vec<_> = halves
            .iter()
            .map(|&half| {
                let tracker = &tracker;
                let queue = &queue;
                scope.spawn(move || {
                    let mut queued = 0_u64;
                    for i in 0..EXTENTS {
                        if tracker.queue_finished_io(i * BLOCK + half, BLOCK / 2, queue) {
                            queued += 1;
                        }
                    }
                    queued
                })
            })
            .collect();
        let queued: u64 = producers
            .into_iter()
            .map(|p| p.join().expect("producer"))
            .sum();
        assert_eq!(queued, EXTENTS);
        producers_done.store(true, Ordering::Release);
    });

    for ordered in &handles {
        ordered.wait_complete();
        assert!(!ordered.has_error());
        assert_eq!(Arc::strong_count(ordered), 1);
    }
    assert_eq!(
        persistence.extents.load(Ordering::Relaxed),
        usize::try_from(EXTENTS).expect("fits")
    );
    assert!(tracker.is_empty());
    assert_eq!(tracker.disk_i_size(), EXTENTS * BLOCK);
}
