//! Batch getters: direct (ascending) and reverse (descending) allocation
//!
//! A getter decides *which* ids a pipe hands to its next run. It owns no
//! state; the pipe passes in its [`BatchLedger`] for each call.
//!
//! Every call serves the recycle pool first (insertion order, skipping dead
//! letters) and then tops the batch up from the heap in the getter's
//! ordering. Recycled ids are therefore not sorted relative to heap ids in
//! the same batch.
//!
//! # Example
//!
//! ```
//! use manufactory_core_batch::getter::{BatchGetter, DirectGetter};
//! use manufactory_core_batch::ledger::BatchLedger;
//!
//! let mut ledger = BatchLedger::new(1);
//! ledger.extend_heap(0..10);
//!
//! let draw = DirectGetter.get_batch(&mut ledger, 4);
//! assert_eq!(draw.ids, vec![0, 1, 2, 3]);
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ledger::{BatchLedger, GapReport, PieceId, RecycleOutcome};

/// Direction in which a pipe walks the heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeOrdering {
    /// Oldest first (ascending ids)
    #[default]
    Direct,
    /// Newest first (descending ids)
    Reverse,
}

impl PipeOrdering {
    /// Getter implementing this ordering.
    pub fn getter(self) -> Box<dyn BatchGetter> {
        match self {
            PipeOrdering::Direct => Box::new(DirectGetter),
            PipeOrdering::Reverse => Box::new(ReverseGetter),
        }
    }
}

impl fmt::Display for PipeOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeOrdering::Direct => write!(f, "direct"),
            PipeOrdering::Reverse => write!(f, "reverse"),
        }
    }
}

/// Ids handed out by one `get_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draw {
    /// Allocated ids: recycled ones first, then heap ones
    pub ids: Vec<PieceId>,
    /// How many of `ids` came from the recycle pool
    pub from_recycle: usize,
    /// Ids the cursor skipped and that were queued for later delivery
    pub gaps: GapReport,
}

impl Draw {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Allocation policy over a [`BatchLedger`].
///
/// Not reentrant: callers must not run two `get_batch` calls on the same
/// ledger concurrently.
pub trait BatchGetter: Send + Sync + fmt::Debug {
    fn ordering(&self) -> PipeOrdering;

    /// Allocate up to `size` ids and move them into hold.
    fn get_batch(&self, ledger: &mut BatchLedger, size: usize) -> Draw;

    /// Return ids to availability (they count as processed).
    fn release(&self, ledger: &mut BatchLedger, ids: &[PieceId]) -> usize {
        ledger.release(ids)
    }

    /// Return held ids to the recycle pool.
    fn recycle(&self, ledger: &mut BatchLedger, ids: &[PieceId], voluntary: bool) -> RecycleOutcome {
        ledger.recycle(ids, voluntary)
    }
}

/// Ascending allocation; the cursor is `last_cursor`.
///
/// Heap ids below `first_cursor` are queued in the recycle pool first, so
/// nothing the heap holds is out of reach.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectGetter;

impl BatchGetter for DirectGetter {
    fn ordering(&self) -> PipeOrdering {
        PipeOrdering::Direct
    }

    fn get_batch(&self, ledger: &mut BatchLedger, size: usize) -> Draw {
        let mut draw = Draw::default();
        if size == 0 {
            return draw;
        }

        if let Some(first) = ledger.first_cursor() {
            draw.gaps = ledger.recycle_below(first);
        }

        draw.ids = ledger.take_recyclable(size);
        draw.from_recycle = draw.ids.len();
        if draw.ids.len() >= size {
            return draw;
        }

        let pointer = ledger.last_cursor();
        let fetched: Vec<PieceId> = ledger
            .heap()
            .iter()
            .copied()
            .filter(|id| pointer.map_or(true, |last| *id > last))
            .filter(|id| ledger.is_free(*id))
            .take(size - draw.ids.len())
            .collect();

        let (Some(&low), Some(&high)) = (fetched.first(), fetched.last()) else {
            return draw;
        };

        ledger.hold_from_heap(&fetched);
        if let Some(pointer) = pointer {
            let seen: HashSet<PieceId> = fetched.iter().copied().collect();
            let gaps = ledger.recycle_from_pointer_to_end(pointer, high, &seen);
            BatchLedger::merge_gaps(&mut draw.gaps, gaps);
        }
        ledger.widen(low, high);

        draw.ids.extend(fetched);
        draw
    }
}

/// Descending allocation; the cursor is `first_cursor`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseGetter;

impl BatchGetter for ReverseGetter {
    fn ordering(&self) -> PipeOrdering {
        PipeOrdering::Reverse
    }

    fn get_batch(&self, ledger: &mut BatchLedger, size: usize) -> Draw {
        let mut draw = Draw::default();
        if size == 0 {
            return draw;
        }

        // Captured before recycle entries move into hold: on first use the
        // pointer starts at the larger of the first recycle entry and the
        // first heap entry.
        let first_recycled = ledger.recycle_pool().first();

        draw.ids = ledger.take_recyclable(size);
        draw.from_recycle = draw.ids.len();
        if draw.ids.len() >= size {
            return draw;
        }

        let fetched: Vec<PieceId> = ledger
            .heap()
            .iter()
            .rev()
            .copied()
            .filter(|id| ledger.is_free(*id))
            .take(size - draw.ids.len())
            .collect();

        let (Some(&high), Some(&low)) = (fetched.first(), fetched.last()) else {
            return draw;
        };

        ledger.hold_from_heap(&fetched);
        let seen: HashSet<PieceId> = fetched.iter().copied().collect();

        match (ledger.first_cursor(), ledger.last_cursor()) {
            (Some(first), Some(last)) => {
                if high > last {
                    // Walk down from the new top so skipped ids queue newest first.
                    let gaps = ledger.recycle_from_pointer_to_end(high, last, &seen);
                    BatchLedger::merge_gaps(&mut draw.gaps, gaps);
                }
                if low < first {
                    let gaps = ledger.recycle_from_pointer_to_end(first, low, &seen);
                    BatchLedger::merge_gaps(&mut draw.gaps, gaps);
                }
                ledger.widen(low, high);
            }
            _ => {
                let pointer = first_recycled.map_or(high, |recycled| recycled.max(high));
                draw.gaps = ledger.recycle_from_pointer_to_end(pointer, low, &seen);
                ledger.widen(low, pointer);
            }
        }

        draw.ids.extend(fetched);
        draw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_ledger(max_attempts: u32, ids: impl IntoIterator<Item = PieceId>) -> BatchLedger {
        let mut ledger = BatchLedger::new(max_attempts);
        ledger.extend_heap(ids);
        ledger
    }

    #[test]
    fn test_direct_release_then_next_batch() {
        let mut ledger = heap_ledger(1, 0..10);
        let getter = DirectGetter;

        let first = getter.get_batch(&mut ledger, 4);
        assert_eq!(first.ids, vec![0, 1, 2, 3]);
        assert_eq!(ledger.hold_len(), 4);

        getter.release(&mut ledger, &first.ids);
        assert_eq!(ledger.hold_len(), 0);

        let second = getter.get_batch(&mut ledger, 4);
        assert_eq!(second.ids, vec![4, 5, 6, 7]);
        assert_eq!(ledger.first_cursor(), Some(0));
        assert_eq!(ledger.last_cursor(), Some(7));
    }

    #[test]
    fn test_reverse_first_batch() {
        let mut ledger = heap_ledger(1, 0..10);
        let draw = ReverseGetter.get_batch(&mut ledger, 4);
        assert_eq!(draw.ids, vec![9, 8, 7, 6]);
        assert!(draw.gaps.is_empty());
        assert_eq!(ledger.first_cursor(), Some(6));
        assert_eq!(ledger.last_cursor(), Some(9));

        let draw = ReverseGetter.get_batch(&mut ledger, 4);
        assert_eq!(draw.ids, vec![5, 4, 3, 2]);
    }

    #[test]
    fn test_empty_heap_and_pool_leave_cursors_untouched() {
        let mut ledger = BatchLedger::new(1);
        let draw = DirectGetter.get_batch(&mut ledger, 4);
        assert!(draw.is_empty());
        assert_eq!(ledger.first_cursor(), None);
        assert_eq!(ledger.last_cursor(), None);

        let draw = ReverseGetter.get_batch(&mut ledger, 4);
        assert!(draw.is_empty());
        assert_eq!(ledger.last_cursor(), None);
    }

    #[test]
    fn test_zero_size_batch() {
        let mut ledger = heap_ledger(1, 0..3);
        assert!(DirectGetter.get_batch(&mut ledger, 0).is_empty());
        assert_eq!(ledger.heap_len(), 3);
    }

    #[test]
    fn test_recycled_ids_come_before_heap_ids() {
        let mut ledger = heap_ledger(3, 0..10);
        let getter = DirectGetter;

        let draw = getter.get_batch(&mut ledger, 4);
        getter.release(&mut ledger, &[0, 3]);
        getter.recycle(&mut ledger, &[2, 1], false);

        // Pool order is insertion order (2 then 1), then the heap resumes.
        let draw2 = getter.get_batch(&mut ledger, 4);
        assert_eq!(draw.ids, vec![0, 1, 2, 3]);
        assert_eq!(draw2.ids, vec![2, 1, 4, 5]);
        assert_eq!(draw2.from_recycle, 2);
    }

    #[test]
    fn test_recycled_id_stops_after_max_attempts() {
        let mut ledger = heap_ledger(2, 0..3);
        let getter = DirectGetter;

        let draw = getter.get_batch(&mut ledger, 1);
        assert_eq!(draw.ids, vec![0]);
        getter.recycle(&mut ledger, &[0], false);

        let draw = getter.get_batch(&mut ledger, 1);
        assert_eq!(draw.ids, vec![0]);
        let outcome = getter.recycle(&mut ledger, &[0], false);
        assert_eq!(outcome.exhausted, vec![0]);

        let draw = getter.get_batch(&mut ledger, 5);
        assert_eq!(draw.ids, vec![1, 2]);
        let draw = getter.get_batch(&mut ledger, 5);
        assert!(draw.is_empty());
        assert_eq!(ledger.dead_letters().len(), 1);
    }

    #[test]
    fn test_direct_gap_is_recycled_at_zero_attempts() {
        let mut ledger = heap_ledger(1, [0, 1, 2]);
        let getter = DirectGetter;
        let draw = getter.get_batch(&mut ledger, 3);
        getter.release(&mut ledger, &draw.ids);

        // 3 and 4 committed late; the scan only saw 5 and 6.
        ledger.extend_heap([5, 6]);
        let draw = getter.get_batch(&mut ledger, 2);
        assert_eq!(draw.ids, vec![5, 6]);
        assert_eq!(draw.gaps.recycled, vec![3, 4]);
        assert_eq!(ledger.recycle_pool().get(3), Some(0));

        let draw = getter.get_batch(&mut ledger, 5);
        assert_eq!(draw.ids, vec![3, 4]);
        assert!(ledger.check_invariants());
    }

    #[test]
    fn test_direct_serves_ids_below_the_cursor_range() {
        // Cursor moved to [3, 5] elsewhere; the rescan finds 0..3 and 6..10.
        let mut ledger = BatchLedger::from_snapshot(
            &crate::ledger::CursorSnapshot {
                first_cursor: Some(3),
                last_cursor: Some(5),
                hold: vec![],
                recycle: vec![],
            },
            1,
        );
        ledger.extend_heap(0..10);
        assert_eq!(ledger.heap_len(), 7);

        let getter = DirectGetter;
        let draw = getter.get_batch(&mut ledger, 4);
        assert_eq!(draw.ids, vec![0, 1, 2, 6]);
        assert_eq!(draw.from_recycle, 3);
        assert_eq!(draw.gaps.recycled, vec![0, 1, 2]);
        assert_eq!(ledger.first_cursor(), Some(0));
        assert_eq!(ledger.last_cursor(), Some(6));
        getter.release(&mut ledger, &draw.ids);

        // A rescan of everything outside the range finds nothing old again.
        assert_eq!(ledger.extend_heap(0..7), 0);

        let draw = getter.get_batch(&mut ledger, 10);
        assert_eq!(draw.ids, vec![7, 8, 9]);
        getter.release(&mut ledger, &draw.ids);

        assert!(!ledger.has_work());
        assert!(getter.get_batch(&mut ledger, 10).is_empty());
        assert!(ledger.check_invariants());
    }

    #[test]
    fn test_direct_recycles_unseen_ids_below_the_range() {
        let mut ledger = BatchLedger::from_snapshot(
            &crate::ledger::CursorSnapshot {
                first_cursor: Some(5),
                last_cursor: Some(6),
                hold: vec![],
                recycle: vec![],
            },
            1,
        );
        // 2 and 4 have not been seen by the scan yet.
        ledger.extend_heap([1, 3]);

        let draw = DirectGetter.get_batch(&mut ledger, 2);
        assert_eq!(draw.ids, vec![1, 2]);
        assert_eq!(draw.gaps.recycled, vec![1, 2, 3, 4]);
        assert_eq!(ledger.first_cursor(), Some(1));
        assert_eq!(ledger.heap_len(), 0);
    }

    #[test]
    fn test_direct_overflowed_gap_is_reported_and_covered() {
        let mut ledger = heap_ledger(1, [0]);
        let getter = DirectGetter;
        let draw = getter.get_batch(&mut ledger, 1);
        getter.release(&mut ledger, &draw.ids);

        let far = crate::ledger::MAX_GAP_SPAN + 10;
        ledger.extend_heap([far]);
        let draw = getter.get_batch(&mut ledger, 1);
        assert_eq!(draw.ids, vec![far]);
        assert!(draw.gaps.recycled.is_empty());
        assert_eq!(draw.gaps.overflow, far - 1);
        // The skipped span is inside the cursor range now; rescans never return it.
        assert!(ledger.in_range(far / 2));
        assert!(ledger.recycle_pool().is_empty());
    }

    #[test]
    fn test_reverse_new_arrivals_close_the_upper_gap() {
        let mut ledger = heap_ledger(1, 0..10);
        let getter = ReverseGetter;
        let draw = getter.get_batch(&mut ledger, 10);
        getter.release(&mut ledger, &draw.ids);

        ledger.extend_heap(10..20);
        let draw = getter.get_batch(&mut ledger, 4);
        assert_eq!(draw.ids, vec![19, 18, 17, 16]);
        // 10..=15 were skipped by the cursor jump and wait in the pool, newest first.
        assert_eq!(draw.gaps.recycled, vec![15, 14, 13, 12, 11, 10]);
        assert_eq!(ledger.last_cursor(), Some(19));
        assert_eq!(ledger.heap_len(), 0);

        let draw = getter.get_batch(&mut ledger, 3);
        assert_eq!(draw.ids, vec![15, 14, 13]);
        assert!(ledger.check_invariants());
    }

    #[test]
    fn test_reverse_first_use_starts_from_recycle_pointer() {
        // A restored hold sits in the pool above everything in the heap.
        let mut fresh = BatchLedger::from_snapshot(
            &crate::ledger::CursorSnapshot {
                first_cursor: None,
                last_cursor: None,
                hold: vec![],
                recycle: vec![crate::ledger::AttemptEntry { id: 8, attempts: 0 }],
            },
            1,
        );
        fresh.extend_heap(0..5);

        let draw = ReverseGetter.get_batch(&mut fresh, 3);
        // 8 from the pool, then 4 and 3 from the heap; 7, 6 and 5 are gaps.
        assert_eq!(draw.ids, vec![8, 4, 3]);
        assert_eq!(draw.gaps.recycled, vec![7, 6, 5]);
        assert_eq!(fresh.last_cursor(), Some(8));
        assert_eq!(fresh.first_cursor(), Some(3));
    }

    #[test]
    fn test_ordering_getter_dispatch() {
        assert_eq!(PipeOrdering::Direct.getter().ordering(), PipeOrdering::Direct);
        assert_eq!(PipeOrdering::Reverse.getter().ordering(), PipeOrdering::Reverse);
        assert_eq!(PipeOrdering::Reverse.to_string(), "reverse");
    }
}
