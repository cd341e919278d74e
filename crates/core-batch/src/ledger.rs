//! Batch ledger: the cursor, hold, recycle and heap bookkeeping of one pipe
//!
//! The ledger is owned by a pipe. Getters ([`crate::getter`]) only receive a
//! `&mut BatchLedger` for the duration of a call, so every invariant below is
//! enforced in this module:
//!
//! - an id is in at most one of `hold`, `recycle`, `heap`
//! - `[first_cursor, last_cursor]` covers every id ever handed out
//! - recycle entries at or above `max_attempts` are never served again
//!
//! # Example
//!
//! ```
//! use manufactory_core_batch::ledger::BatchLedger;
//!
//! let mut ledger = BatchLedger::new(3);
//! ledger.extend_heap(0..4);
//! assert_eq!(ledger.heap_len(), 4);
//! assert!(ledger.check_invariants());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Identifier of a piece; dense and increasing per producing building.
pub type PieceId = u64;

/// Used when a pipe does not configure `max_attempts`: one try, no retry.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Widest id span the gap walk will enumerate in one go.
pub const MAX_GAP_SPAN: u64 = 10_000;

/// A piece id together with how many failed attempts it has accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptEntry {
    pub id: PieceId,
    pub attempts: u32,
}

/// Persisted shape of a ledger (the heap is never persisted; it is rescanned).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSnapshot {
    pub first_cursor: Option<PieceId>,
    pub last_cursor: Option<PieceId>,
    #[serde(default)]
    pub hold: Vec<AttemptEntry>,
    #[serde(default)]
    pub recycle: Vec<AttemptEntry>,
}

impl CursorSnapshot {
    /// Cursor pair only, used to detect divergence between writers.
    pub fn cursors(&self) -> (Option<PieceId>, Option<PieceId>) {
        (self.first_cursor, self.last_cursor)
    }
}

/// Result of returning ids to the recycle pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecycleOutcome {
    /// Ids that went back into the pool
    pub recycled: usize,
    /// Ids that reached `max_attempts` with this call and are now dead letters
    pub exhausted: Vec<PieceId>,
}

/// Ids the cursor jumped over without fetching them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapReport {
    /// Ids enqueued into the recycle pool at zero attempts
    pub recycled: Vec<PieceId>,
    /// Span length that was too wide to walk (0 when none). The cursor still
    /// moves over such a span, so its ids are never delivered.
    pub overflow: u64,
}

impl GapReport {
    pub fn is_empty(&self) -> bool {
        self.recycled.is_empty() && self.overflow == 0
    }

    fn merge(&mut self, other: GapReport) {
        self.recycled.extend(other.recycled);
        self.overflow += other.overflow;
    }
}

/// An id that exhausted its attempts and is no longer scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub piece_id: PieceId,
    pub attempts: u32,
}

/// Insertion-ordered recycle pool.
#[derive(Debug, Clone, Default)]
pub struct RecyclePool {
    order: VecDeque<PieceId>,
    attempts: HashMap<PieceId, u32>,
}

impl RecyclePool {
    /// Insert or update an entry; an existing entry keeps its position.
    pub fn insert(&mut self, id: PieceId, attempts: u32) {
        if self.attempts.insert(id, attempts).is_none() {
            self.order.push_back(id);
        }
    }

    pub fn remove(&mut self, id: PieceId) -> Option<u32> {
        let attempts = self.attempts.remove(&id)?;
        self.order.retain(|entry| *entry != id);
        Some(attempts)
    }

    pub fn get(&self, id: PieceId) -> Option<u32> {
        self.attempts.get(&id).copied()
    }

    pub fn contains(&self, id: PieceId) -> bool {
        self.attempts.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// First entry in insertion order.
    pub fn first(&self) -> Option<PieceId> {
        self.order.front().copied()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = AttemptEntry> + '_ {
        self.order.iter().map(move |id| AttemptEntry {
            id: *id,
            attempts: self.attempts[id],
        })
    }
}

/// Cursor/hold/recycle/heap state of one pipe.
#[derive(Debug, Clone)]
pub struct BatchLedger {
    first_cursor: Option<PieceId>,
    last_cursor: Option<PieceId>,
    hold: BTreeMap<PieceId, u32>,
    recycle: RecyclePool,
    heap: BTreeSet<PieceId>,
    max_attempts: u32,
}

impl BatchLedger {
    /// Empty ledger; `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            first_cursor: None,
            last_cursor: None,
            hold: BTreeMap::new(),
            recycle: RecyclePool::default(),
            heap: BTreeSet::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Rebuild from a persisted snapshot. Holds stay holds; see
    /// [`BatchLedger::restore_holds`] for crash recovery.
    pub fn from_snapshot(snapshot: &CursorSnapshot, max_attempts: u32) -> Self {
        let mut ledger = Self::new(max_attempts);
        ledger.first_cursor = snapshot.first_cursor;
        ledger.last_cursor = snapshot.last_cursor;
        for entry in &snapshot.recycle {
            ledger.recycle.insert(entry.id, entry.attempts);
        }
        for entry in &snapshot.hold {
            if !ledger.recycle.contains(entry.id) {
                ledger.hold.insert(entry.id, entry.attempts);
            }
        }
        ledger
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        CursorSnapshot {
            first_cursor: self.first_cursor,
            last_cursor: self.last_cursor,
            hold: self
                .hold
                .iter()
                .map(|(id, attempts)| AttemptEntry {
                    id: *id,
                    attempts: *attempts,
                })
                .collect(),
            recycle: self.recycle.iter().collect(),
        }
    }

    /// Move every held id back to the recycle pool without a penalty.
    ///
    /// Holds read from storage belong to runs of a process that no longer
    /// exists; they must be delivered again. Returns how many moved.
    pub fn restore_holds(&mut self) -> usize {
        self.adopt_in_flight(&[])
    }

    /// Rebase holds onto the runs this process still has in flight.
    ///
    /// Holds not listed in `in_flight` move back to the recycle pool without a
    /// penalty. Listed entries become holds again, wherever the ledger had
    /// them. Returns how many holds were moved to the pool.
    pub fn adopt_in_flight(&mut self, in_flight: &[AttemptEntry]) -> usize {
        let keep: HashSet<PieceId> = in_flight.iter().map(|entry| entry.id).collect();
        let held: Vec<(PieceId, u32)> = std::mem::take(&mut self.hold).into_iter().collect();

        let mut moved = 0;
        for (id, attempts) in held {
            if keep.contains(&id) {
                continue;
            }
            self.recycle.insert(id, attempts);
            moved += 1;
        }
        for entry in in_flight {
            self.recycle.remove(entry.id);
            self.heap.remove(&entry.id);
            self.hold.insert(entry.id, entry.attempts);
        }
        moved
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn first_cursor(&self) -> Option<PieceId> {
        self.first_cursor
    }

    pub fn last_cursor(&self) -> Option<PieceId> {
        self.last_cursor
    }

    /// Whether `id` lies inside the already handed-out cursor range.
    pub fn in_range(&self, id: PieceId) -> bool {
        match (self.first_cursor, self.last_cursor) {
            (Some(first), Some(last)) => first <= id && id <= last,
            _ => false,
        }
    }

    pub fn is_held(&self, id: PieceId) -> bool {
        self.hold.contains_key(&id)
    }

    pub fn held_ids(&self) -> Vec<PieceId> {
        self.hold.keys().copied().collect()
    }

    pub fn held_entries(&self) -> Vec<AttemptEntry> {
        self.hold
            .iter()
            .map(|(id, attempts)| AttemptEntry {
                id: *id,
                attempts: *attempts,
            })
            .collect()
    }

    pub fn hold_len(&self) -> usize {
        self.hold.len()
    }

    pub fn recycle_pool(&self) -> &RecyclePool {
        &self.recycle
    }

    pub fn heap(&self) -> &BTreeSet<PieceId> {
        &self.heap
    }

    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    pub fn max_known_id(&self) -> Option<PieceId> {
        let heap_max = self.heap.iter().next_back().copied();
        let hold_max = self.hold.keys().next_back().copied();
        [heap_max, hold_max, self.last_cursor]
            .into_iter()
            .flatten()
            .max()
    }

    /// Add discovered ids to the heap.
    ///
    /// Ids inside the cursor range, held, or recycled are ignored. Returns the
    /// number of ids that were new to the heap.
    pub fn extend_heap<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = PieceId>,
    {
        let mut added = 0;
        for id in ids {
            if self.in_range(id) || self.is_held(id) || self.recycle.contains(id) {
                continue;
            }
            if self.heap.insert(id) {
                added += 1;
            }
        }
        added
    }

    /// True when a getter call could return at least one id.
    pub fn has_work(&self) -> bool {
        !self.heap.is_empty() || self.recycle.iter().any(|e| e.attempts < self.max_attempts)
    }

    /// Drop ids from hold and from the recycle pool.
    ///
    /// Releasing an id that is neither held nor recycled is a no-op.
    pub fn release(&mut self, ids: &[PieceId]) -> usize {
        let mut released = 0;
        for id in ids {
            let held = self.hold.remove(id).is_some();
            let recycled = self.recycle.remove(*id).is_some();
            if held || recycled {
                released += 1;
            }
        }
        released
    }

    /// Return held ids to the recycle pool.
    ///
    /// A non-voluntary recycle costs one attempt. Ids not currently held are
    /// ignored.
    pub fn recycle(&mut self, ids: &[PieceId], voluntary: bool) -> RecycleOutcome {
        let mut outcome = RecycleOutcome::default();
        for id in ids {
            let Some(previous) = self.hold.remove(id) else {
                continue;
            };
            let attempts = if voluntary { previous } else { previous + 1 };
            self.recycle.insert(*id, attempts);
            outcome.recycled += 1;
            if !voluntary && attempts >= self.max_attempts {
                outcome.exhausted.push(*id);
            }
        }
        outcome
    }

    /// Recycle entries that will never be served again.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.recycle
            .iter()
            .filter(|entry| entry.attempts >= self.max_attempts)
            .map(|entry| DeadLetter {
                piece_id: entry.id,
                attempts: entry.attempts,
            })
            .collect()
    }

    /// Reset dead letters to zero attempts so they are served again.
    pub fn revive(&mut self, ids: &[PieceId]) -> usize {
        let mut revived = 0;
        for id in ids {
            if let Some(attempts) = self.recycle.get(*id) {
                if attempts >= self.max_attempts {
                    self.recycle.insert(*id, 0);
                    revived += 1;
                }
            }
        }
        revived
    }

    /// Move up to `size` servable recycle entries into hold, in pool order.
    pub(crate) fn take_recyclable(&mut self, size: usize) -> Vec<PieceId> {
        let picked: Vec<AttemptEntry> = self
            .recycle
            .iter()
            .filter(|entry| entry.attempts < self.max_attempts)
            .take(size)
            .collect();

        for entry in &picked {
            self.recycle.remove(entry.id);
            self.hold.insert(entry.id, entry.attempts);
        }
        picked.into_iter().map(|entry| entry.id).collect()
    }

    /// Whether a heap id may be handed out right now.
    pub(crate) fn is_free(&self, id: PieceId) -> bool {
        !self.is_held(id) && !self.recycle.contains(id) && !self.in_range(id)
    }

    /// Move fetched heap ids into hold at zero attempts.
    pub(crate) fn hold_from_heap(&mut self, ids: &[PieceId]) {
        for id in ids {
            self.heap.remove(id);
            self.hold.insert(*id, 0);
        }
    }

    /// Widen the cursor range so it covers `[low, high]`.
    pub(crate) fn widen(&mut self, low: PieceId, high: PieceId) {
        self.first_cursor = Some(self.first_cursor.map_or(low, |first| first.min(low)));
        self.last_cursor = Some(self.last_cursor.map_or(high, |last| last.max(high)));
    }

    /// Enqueue, at zero attempts, every id strictly between `pointer` and
    /// `end` that was neither fetched in this call, held, nor recycled.
    ///
    /// Walks from `pointer` towards `end`, so the recycle pool receives the
    /// gap in the direction the cursor moved.
    pub(crate) fn recycle_from_pointer_to_end(
        &mut self,
        pointer: PieceId,
        end: PieceId,
        fetched: &HashSet<PieceId>,
    ) -> GapReport {
        let mut report = GapReport::default();
        let span = pointer.abs_diff(end).saturating_sub(1);
        if span == 0 {
            return report;
        }
        if span > MAX_GAP_SPAN {
            tracing::error!(
                pointer,
                end,
                span,
                "Gap too wide to walk, skipped ids fall inside the cursor range and will not be delivered"
            );
            report.overflow = span;
            return report;
        }

        let walk: Box<dyn Iterator<Item = PieceId>> = if pointer < end {
            Box::new(pointer + 1..end)
        } else {
            Box::new((end + 1..pointer).rev())
        };

        for id in walk {
            if fetched.contains(&id) || self.is_held(id) || self.recycle.contains(id) {
                continue;
            }
            self.heap.remove(&id);
            self.recycle.insert(id, 0);
            report.recycled.push(id);
        }
        report
    }

    /// Queue heap ids below `first` in the recycle pool at zero attempts and
    /// lower `first_cursor` over them.
    ///
    /// An ascending cursor never walks back, so ids discovered under the
    /// range (another writer moved the cursors, or pieces committed late)
    /// are only reachable through the pool. Unseen ids between the lowest
    /// one and `first` are gap-recycled like any other skipped span.
    pub(crate) fn recycle_below(&mut self, first: PieceId) -> GapReport {
        let Some(low) = self.heap.range(..first).next().copied() else {
            return GapReport::default();
        };
        self.heap.remove(&low);
        self.recycle.insert(low, 0);

        let mut report = self.recycle_from_pointer_to_end(low, first, &HashSet::new());
        if report.overflow > 0 {
            let stranded: Vec<PieceId> = self.heap.range(..first).copied().collect();
            for id in &stranded {
                self.heap.remove(id);
                self.recycle.insert(*id, 0);
            }
            report.recycled.extend(stranded);
        }
        report.recycled.insert(0, low);
        self.widen(low, first);
        report
    }

    pub(crate) fn merge_gaps(into: &mut GapReport, other: GapReport) {
        into.merge(other);
    }

    /// Check hold, recycle and heap are pairwise disjoint.
    pub fn check_invariants(&self) -> bool {
        let hold_recycle = self.hold.keys().all(|id| !self.recycle.contains(*id));
        let hold_heap = self.hold.keys().all(|id| !self.heap.contains(id));
        let recycle_heap = self.recycle.iter().all(|e| !self.heap.contains(&e.id));
        hold_recycle && hold_heap && recycle_heap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_heap(max_attempts: u32, ids: std::ops::Range<PieceId>) -> BatchLedger {
        let mut ledger = BatchLedger::new(max_attempts);
        ledger.extend_heap(ids);
        ledger
    }

    #[test]
    fn test_max_attempts_clamped() {
        assert_eq!(BatchLedger::new(0).max_attempts(), 1);
        assert_eq!(BatchLedger::new(DEFAULT_MAX_ATTEMPTS).max_attempts(), 1);
    }

    #[test]
    fn test_extend_heap_skips_known_ids() {
        let mut ledger = ledger_with_heap(3, 0..4);
        ledger.hold_from_heap(&[0, 1]);
        ledger.widen(0, 1);
        ledger.recycle(&[1], true);

        // 0 is held and in range, 1 is recycled, 2 already in heap
        assert_eq!(ledger.extend_heap([0, 1, 2, 7]), 1);
        assert!(ledger.heap().contains(&7));
        assert!(ledger.check_invariants());
    }

    #[test]
    fn test_release_unknown_id_is_noop() {
        let mut ledger = BatchLedger::new(1);
        assert_eq!(ledger.release(&[42]), 0);
        assert!(ledger.check_invariants());
    }

    #[test]
    fn test_recycle_penalty_and_exhaustion() {
        let mut ledger = ledger_with_heap(2, 0..2);
        ledger.hold_from_heap(&[0, 1]);

        let outcome = ledger.recycle(&[0], false);
        assert_eq!(outcome.recycled, 1);
        assert!(outcome.exhausted.is_empty());
        assert_eq!(ledger.recycle_pool().get(0), Some(1));

        let taken = ledger.take_recyclable(5);
        assert_eq!(taken, vec![0]);
        let outcome = ledger.recycle(&[0], false);
        assert_eq!(outcome.exhausted, vec![0]);
        assert_eq!(
            ledger.dead_letters(),
            vec![DeadLetter {
                piece_id: 0,
                attempts: 2
            }]
        );
        assert!(ledger.take_recyclable(5).is_empty());
    }

    #[test]
    fn test_voluntary_recycle_keeps_attempts() {
        let mut ledger = ledger_with_heap(1, 0..1);
        ledger.hold_from_heap(&[0]);
        let outcome = ledger.recycle(&[0], true);
        assert!(outcome.exhausted.is_empty());
        assert_eq!(ledger.recycle_pool().get(0), Some(0));
        assert!(ledger.has_work());
    }

    #[test]
    fn test_recycle_ignores_ids_not_held() {
        let mut ledger = BatchLedger::new(3);
        let outcome = ledger.recycle(&[5], false);
        assert_eq!(outcome.recycled, 0);
        assert!(ledger.recycle_pool().is_empty());
    }

    #[test]
    fn test_revive_dead_letter() {
        let mut ledger = ledger_with_heap(1, 0..1);
        ledger.hold_from_heap(&[0]);
        ledger.recycle(&[0], false);
        assert!(!ledger.has_work());

        assert_eq!(ledger.revive(&[0, 9]), 1);
        assert!(ledger.dead_letters().is_empty());
        assert!(ledger.has_work());
    }

    #[test]
    fn test_snapshot_roundtrip_and_restore_holds() {
        let mut ledger = ledger_with_heap(3, 0..5);
        ledger.hold_from_heap(&[0, 1, 2]);
        ledger.widen(0, 2);
        ledger.recycle(&[1], false);

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.cursors(), (Some(0), Some(2)));
        assert_eq!(snapshot.hold.len(), 2);
        assert_eq!(snapshot.recycle, vec![AttemptEntry { id: 1, attempts: 1 }]);

        let mut restored = BatchLedger::from_snapshot(&snapshot, 3);
        assert_eq!(restored.hold_len(), 2);
        assert_eq!(restored.restore_holds(), 2);
        assert_eq!(restored.hold_len(), 0);
        assert_eq!(restored.recycle_pool().len(), 3);
        assert!(restored.check_invariants());
    }

    #[test]
    fn test_adopt_in_flight_keeps_live_runs() {
        let mut ledger = ledger_with_heap(3, 0..6);
        ledger.hold_from_heap(&[0, 1, 2]);
        ledger.widen(0, 2);

        // 1 is still running here; 0 and 2 belonged to a dead process.
        // 4 was a heap entry that this process already holds too.
        let moved = ledger.adopt_in_flight(&[
            AttemptEntry { id: 1, attempts: 0 },
            AttemptEntry { id: 4, attempts: 1 },
        ]);
        assert_eq!(moved, 2);
        assert_eq!(ledger.held_ids(), vec![1, 4]);
        assert_eq!(
            ledger.recycle_pool().iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert!(!ledger.heap().contains(&4));
        assert!(ledger.check_invariants());
    }

    #[test]
    fn test_gap_walk_ascending() {
        let mut ledger = BatchLedger::new(1);
        let fetched: HashSet<PieceId> = [5, 6].into_iter().collect();
        let report = ledger.recycle_from_pointer_to_end(2, 6, &fetched);
        assert_eq!(report.recycled, vec![3, 4]);
        assert_eq!(ledger.recycle_pool().iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn test_gap_walk_descending() {
        let mut ledger = BatchLedger::new(1);
        let fetched: HashSet<PieceId> = [2].into_iter().collect();
        let report = ledger.recycle_from_pointer_to_end(6, 1, &fetched);
        assert_eq!(report.recycled, vec![5, 4, 3]);
    }

    #[test]
    fn test_gap_walk_overflow() {
        let mut ledger = BatchLedger::new(1);
        let report = ledger.recycle_from_pointer_to_end(0, MAX_GAP_SPAN + 5, &HashSet::new());
        assert!(report.recycled.is_empty());
        assert_eq!(report.overflow, MAX_GAP_SPAN + 4);
        assert!(ledger.recycle_pool().is_empty());
    }

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = CursorSnapshot {
            first_cursor: Some(1),
            last_cursor: Some(4),
            hold: vec![AttemptEntry { id: 4, attempts: 0 }],
            recycle: vec![],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: CursorSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
