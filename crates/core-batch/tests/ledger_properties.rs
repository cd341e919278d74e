//! Property tests for the batch ledger
//!
//! Drives both getters with arbitrary sequences of get/release/recycle and
//! checks the ledger never double-books an id.

use manufactory_core_batch::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Get(usize),
    ReleaseFirst(usize),
    RecycleFirst(usize, bool),
    Discover(u64, u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..8).prop_map(Op::Get),
        (0usize..8).prop_map(Op::ReleaseFirst),
        ((0usize..8), any::<bool>()).prop_map(|(n, v)| Op::RecycleFirst(n, v)),
        ((0u64..60), (0u64..6)).prop_map(|(start, len)| Op::Discover(start, len)),
    ]
}

fn run_ops(ordering: PipeOrdering, max_attempts: u32, ops: &[Op]) -> BatchLedger {
    let getter = ordering.getter();
    let mut ledger = BatchLedger::new(max_attempts);
    ledger.extend_heap(0..20);

    for op in ops {
        match op {
            Op::Get(n) => {
                getter.get_batch(&mut ledger, *n);
            }
            Op::ReleaseFirst(n) => {
                let ids: Vec<PieceId> = ledger.held_ids().into_iter().take(*n).collect();
                getter.release(&mut ledger, &ids);
            }
            Op::RecycleFirst(n, voluntary) => {
                let ids: Vec<PieceId> = ledger.held_ids().into_iter().take(*n).collect();
                getter.recycle(&mut ledger, &ids, *voluntary);
            }
            Op::Discover(start, len) => {
                ledger.extend_heap(*start..start + len);
            }
        }
        assert!(ledger.check_invariants(), "invariant broken after {:?}", op);
    }
    ledger
}

proptest! {
    #[test]
    fn hold_and_recycle_stay_disjoint_direct(
        ops in prop::collection::vec(op_strategy(), 0..60),
        max_attempts in 1u32..4,
    ) {
        let ledger = run_ops(PipeOrdering::Direct, max_attempts, &ops);
        prop_assert!(ledger.check_invariants());
    }

    #[test]
    fn hold_and_recycle_stay_disjoint_reverse(
        ops in prop::collection::vec(op_strategy(), 0..60),
        max_attempts in 1u32..4,
    ) {
        let ledger = run_ops(PipeOrdering::Reverse, max_attempts, &ops);
        prop_assert!(ledger.check_invariants());
    }

    #[test]
    fn has_work_means_a_non_empty_draw(
        ops in prop::collection::vec(op_strategy(), 0..60),
        max_attempts in 1u32..4,
        ordering in prop_oneof![Just(PipeOrdering::Direct), Just(PipeOrdering::Reverse)],
        size in 1usize..8,
    ) {
        let mut ledger = run_ops(ordering, max_attempts, &ops);
        if ledger.has_work() {
            let draw = ordering.getter().get_batch(&mut ledger, size);
            prop_assert!(
                !draw.is_empty(),
                "has_work with nothing to draw: {:?}",
                ledger.snapshot()
            );
        }
    }

    #[test]
    fn direct_eventually_serves_ids_below_the_cursor(
        first in 1u64..20,
        width in 0u64..10,
        size in 1usize..6,
    ) {
        // Cursors moved by another writer; everything outside them is pending.
        let snapshot = CursorSnapshot {
            first_cursor: Some(first),
            last_cursor: Some(first + width),
            hold: vec![],
            recycle: vec![],
        };
        let mut ledger = BatchLedger::from_snapshot(&snapshot, 1);
        let end = first + width + 10;
        ledger.extend_heap(0..end);

        let getter = PipeOrdering::Direct.getter();
        let mut served = Vec::new();
        while ledger.has_work() {
            let draw = getter.get_batch(&mut ledger, size);
            prop_assert!(!draw.is_empty());
            getter.release(&mut ledger, &draw.ids);
            served.extend(draw.ids);
        }
        served.sort_unstable();
        let expected: Vec<PieceId> = (0..first).chain(first + width + 1..end).collect();
        prop_assert_eq!(served, expected);
    }

    #[test]
    fn release_of_fresh_batch_restores_hold_size(
        size in 0usize..25,
        ordering in prop_oneof![Just(PipeOrdering::Direct), Just(PipeOrdering::Reverse)],
    ) {
        let getter = ordering.getter();
        let mut ledger = BatchLedger::new(1);
        ledger.extend_heap(0..20);

        let before = ledger.hold_len();
        let draw = getter.get_batch(&mut ledger, size);
        getter.release(&mut ledger, &draw.ids);
        prop_assert_eq!(ledger.hold_len(), before);

        // Releasing the same ids again changes nothing.
        prop_assert_eq!(getter.release(&mut ledger, &draw.ids), 0);
        prop_assert_eq!(ledger.hold_len(), before);
    }

    #[test]
    fn dead_letters_never_resurface(max_attempts in 1u32..4) {
        let getter = PipeOrdering::Direct.getter();
        let mut ledger = BatchLedger::new(max_attempts);
        ledger.extend_heap(0..3);

        // Fail piece 0 until it is exhausted, succeeding everything else.
        for _ in 0..max_attempts {
            let draw = getter.get_batch(&mut ledger, 1);
            prop_assert_eq!(draw.ids.clone(), vec![0]);
            getter.recycle(&mut ledger, &draw.ids, false);
        }

        for _ in 0..5 {
            let draw = getter.get_batch(&mut ledger, 10);
            prop_assert!(!draw.ids.contains(&0));
            getter.release(&mut ledger, &draw.ids);
        }
        prop_assert_eq!(ledger.dead_letters().len(), 1);
    }
}
