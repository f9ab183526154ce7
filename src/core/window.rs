//! Sliding window of per-ledger buckets.
//!
//! `RetentionWindow<T>` keeps at most `capacity` buckets with contiguous,
//! strictly increasing sequences. It is the storage behind both the event and
//! the transaction index.
//!
//! The window is copy-on-write: readers take a reference-counted snapshot of
//! the bucket list and iterate it without holding any lock, while the single
//! ingestion writer swaps in the appended/evicted list under a short write
//! lock. A reader therefore sees either the list before an append or the list
//! after it, never a half-inserted or half-evicted state.

use crate::utils::error::{Result, RpcCoreError};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::Arc;

/// The derived records of exactly one ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerBucket<T> {
    pub sequence: u32,
    /// Unix timestamp, seconds.
    pub close_time: i64,
    pub content: T,
}

impl<T> LedgerBucket<T> {
    pub fn new(sequence: u32, close_time: i64, content: T) -> Self {
        Self {
            sequence,
            close_time,
            content,
        }
    }
}

type Buckets<T> = VecDeque<Arc<LedgerBucket<T>>>;

/// Window size for a configured value, where `0` selects `default`.
pub fn window_capacity(configured: u32, default: u32) -> NonZeroU32 {
    NonZeroU32::new(configured)
        .or_else(|| NonZeroU32::new(default))
        .unwrap_or(NonZeroU32::MIN)
}

/// Bounded, contiguous window of ledger buckets.
pub struct RetentionWindow<T> {
    capacity: NonZeroU32,
    buckets: RwLock<Arc<Buckets<T>>>,
}

impl<T> RetentionWindow<T> {
    /// Creates an empty window holding at most `capacity` buckets.
    pub fn new(capacity: NonZeroU32) -> Self {
        Self {
            capacity,
            buckets: RwLock::new(Arc::new(VecDeque::with_capacity(
                capacity.get().min(4096) as usize,
            ))),
        }
    }

    /// Maximum number of buckets retained.
    pub fn capacity(&self) -> u32 {
        self.capacity.get()
    }

    /// Appends the next bucket, evicting from the head to stay within capacity.
    ///
    /// The first bucket of an empty window sets the baseline; afterwards each
    /// bucket must carry exactly `last_sequence + 1`.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::OutOfOrder` and leaves the window untouched if
    /// the sequence does not follow the current tail.
    pub fn append(&self, bucket: LedgerBucket<T>) -> Result<()> {
        let mut guard = self.buckets.write();
        if let Some(last) = guard.back() {
            let expected = last.sequence.checked_add(1).ok_or(RpcCoreError::OutOfOrder {
                expected: last.sequence,
                got: bucket.sequence,
            })?;
            if bucket.sequence != expected {
                return Err(RpcCoreError::OutOfOrder {
                    expected,
                    got: bucket.sequence,
                });
            }
        }

        // Clones the list only while some reader still holds the old snapshot.
        let buckets = Arc::make_mut(&mut guard);
        buckets.push_back(Arc::new(bucket));
        while buckets.len() > self.capacity.get() as usize {
            buckets.pop_front();
        }
        Ok(())
    }

    /// Returns the bucket for `sequence`.
    ///
    /// # Errors
    ///
    /// Returns `RpcCoreError::NotFound` if the sequence was evicted, has not
    /// been ingested yet, or the window is empty.
    pub fn get(&self, sequence: u32) -> Result<Arc<LedgerBucket<T>>> {
        let snapshot = self.snapshot_list();
        let first = snapshot.front().ok_or(RpcCoreError::NotFound)?.sequence;
        let offset = sequence.checked_sub(first).ok_or(RpcCoreError::NotFound)?;
        snapshot
            .get(offset as usize)
            .cloned()
            .ok_or(RpcCoreError::NotFound)
    }

    /// Buckets with `start <= sequence <= end`, intersected with the window.
    ///
    /// An empty range is a normal outcome; use [`first_sequence`] and
    /// [`last_sequence`] to tell "outside the window" from "nothing ingested".
    ///
    /// [`first_sequence`]: RetentionWindow::first_sequence
    /// [`last_sequence`]: RetentionWindow::last_sequence
    pub fn range(&self, start: u32, end: u32) -> WindowRange<T> {
        WindowRange::new(self.snapshot_list(), start, end)
    }

    /// Every bucket currently retained, oldest first.
    pub fn snapshot(&self) -> WindowRange<T> {
        WindowRange::new(self.snapshot_list(), 0, u32::MAX)
    }

    pub fn first_sequence(&self) -> Option<u32> {
        self.buckets.read().front().map(|b| b.sequence)
    }

    pub fn last_sequence(&self) -> Option<u32> {
        self.buckets.read().back().map(|b| b.sequence)
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    fn snapshot_list(&self) -> Arc<Buckets<T>> {
        Arc::clone(&self.buckets.read())
    }
}

impl<T> std::fmt::Debug for RetentionWindow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot_list();
        f.debug_struct("RetentionWindow")
            .field("capacity", &self.capacity)
            .field("first", &snapshot.front().map(|b| b.sequence))
            .field("last", &snapshot.back().map(|b| b.sequence))
            .finish()
    }
}

/// A point-in-time slice of a [`RetentionWindow`].
///
/// Iteration is lazy and can be restarted with [`WindowRange::iter`]; appends
/// made after the range was taken are not observed.
pub struct WindowRange<T> {
    snapshot: Arc<Buckets<T>>,
    start: usize,
    end: usize,
}

impl<T> WindowRange<T> {
    fn new(snapshot: Arc<Buckets<T>>, start: u32, end: u32) -> Self {
        let (lo, hi) = match (snapshot.front(), snapshot.back()) {
            (Some(first), Some(last)) if start <= end => {
                let lo = start.max(first.sequence);
                let hi = end.min(last.sequence);
                if lo > hi {
                    (0, 0)
                } else {
                    (
                        (lo - first.sequence) as usize,
                        (hi - first.sequence) as usize + 1,
                    )
                }
            }
            _ => (0, 0),
        };
        Self {
            snapshot,
            start: lo,
            end: hi,
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LedgerBucket<T>> + '_ {
        self.snapshot.range(self.start..self.end).map(|bucket| &**bucket)
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Sequences covered by this range, in order.
    pub fn sequences(&self) -> Vec<u32> {
        self.iter().map(|b| b.sequence).collect()
    }
}

impl<T> Clone for WindowRange<T> {
    fn clone(&self) -> Self {
        Self {
            snapshot: Arc::clone(&self.snapshot),
            start: self.start,
            end: self.end,
        }
    }
}

impl<'a, T> IntoIterator for &'a WindowRange<T> {
    type Item = &'a LedgerBucket<T>;
    type IntoIter = Box<dyn DoubleEndedIterator<Item = &'a LedgerBucket<T>> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(capacity: u32) -> RetentionWindow<Vec<u32>> {
        RetentionWindow::new(NonZeroU32::new(capacity).expect("non-zero"))
    }

    fn fill(w: &RetentionWindow<Vec<u32>>, sequences: std::ops::RangeInclusive<u32>) {
        for seq in sequences {
            w.append(LedgerBucket::new(seq, 0, vec![seq])).expect("append");
        }
    }

    #[test]
    fn test_empty_window_accepts_any_baseline() {
        let w = window(3);
        assert!(w.is_empty());
        assert_eq!(w.first_sequence(), None);
        w.append(LedgerBucket::new(1_000, 0, vec![])).unwrap();
        assert_eq!(w.first_sequence(), Some(1_000));
        assert_eq!(w.last_sequence(), Some(1_000));
    }

    #[test]
    fn test_never_exceeds_capacity_and_stays_contiguous() {
        for capacity in 1..6 {
            let w = window(capacity);
            for seq in 10..40 {
                w.append(LedgerBucket::new(seq, 0, vec![seq])).unwrap();
                assert!(w.len() <= capacity as usize);
                let seqs = w.snapshot().sequences();
                assert!(seqs.windows(2).all(|p| p[1] == p[0] + 1), "{seqs:?}");
                assert_eq!(w.last_sequence(), Some(seq));
            }
        }
    }

    #[test]
    fn test_out_of_order_append_leaves_window_unchanged() {
        let w = window(4);
        fill(&w, 5..=7);

        for bad in [7, 6, 9, 100, 0] {
            let err = w.append(LedgerBucket::new(bad, 0, vec![])).unwrap_err();
            assert!(
                matches!(err, RpcCoreError::OutOfOrder { expected: 8, got } if got == bad),
                "unexpected error {err:?}"
            );
        }
        assert_eq!(w.snapshot().sequences(), vec![5, 6, 7]);
    }

    #[test]
    fn test_eviction_range_and_get() {
        // N = 10 ledgers, W = 4 → retained 7..=10
        let w = window(4);
        fill(&w, 1..=10);

        assert_eq!(w.range(1, 10).sequences(), vec![7, 8, 9, 10]);
        for evicted in 1..=6 {
            assert!(matches!(w.get(evicted), Err(RpcCoreError::NotFound)));
        }
        assert_eq!(w.get(9).unwrap().content, vec![9]);
        assert!(matches!(w.get(11), Err(RpcCoreError::NotFound)));
    }

    #[test]
    fn test_range_bounds() {
        let w = window(10);
        assert!(w.range(0, u32::MAX).is_empty());

        fill(&w, 100..=105);
        assert_eq!(w.range(102, 103).sequences(), vec![102, 103]);
        assert_eq!(w.range(104, 500).sequences(), vec![104, 105]);
        assert!(w.range(1, 99).is_empty());
        assert!(w.range(106, 200).is_empty());
        assert!(w.range(103, 102).is_empty());
        assert_eq!(w.range(103, 103).len(), 1);
    }

    #[test]
    fn test_range_is_restartable_and_point_in_time() {
        let w = window(3);
        fill(&w, 1..=3);
        let range = w.range(1, 10);

        fill(&w, 4..=5);

        let first_pass: Vec<u32> = range.iter().map(|b| b.sequence).collect();
        let second_pass: Vec<u32> = (&range).into_iter().map(|b| b.sequence).collect();
        assert_eq!(first_pass, vec![1, 2, 3]);
        assert_eq!(first_pass, second_pass);
        assert_eq!(w.range(1, 10).sequences(), vec![3, 4, 5]);
    }

    #[test]
    fn test_concurrent_readers_never_see_partial_state() {
        let w = Arc::new(window(8));
        w.append(LedgerBucket::new(1, 0, vec![1])).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let w = Arc::clone(&w);
                scope.spawn(move || {
                    for _ in 0..2_000 {
                        let snap = w.snapshot();
                        let seqs = snap.sequences();
                        assert!(!seqs.is_empty() && seqs.len() <= 8);
                        assert!(seqs.windows(2).all(|p| p[1] == p[0] + 1));
                        for bucket in snap.iter() {
                            assert_eq!(bucket.content, vec![bucket.sequence]);
                        }
                    }
                });
            }
            let writer = Arc::clone(&w);
            scope.spawn(move || {
                for seq in 2..2_000 {
                    writer.append(LedgerBucket::new(seq, 0, vec![seq])).unwrap();
                }
            });
        });

        assert_eq!(w.last_sequence(), Some(1_999));
        assert_eq!(w.len(), 8);
    }
}
