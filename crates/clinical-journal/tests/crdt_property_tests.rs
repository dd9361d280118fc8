//! Property tests for the three CRDT laws the merge function must satisfy
//! (commutative, associative/convergent, idempotent — §8 items 1-3).

use clinical_core::task::{Priority, TaskChange, TaskReplica};
use clinical_core::{ClockMergePolicy, NodeId, TaskId};
use clinical_journal::merge_remote;
use proptest::prelude::*;

fn arb_change() -> impl Strategy<Value = TaskChange> {
    prop_oneof![
        "[a-z ]{1,12}".prop_map(TaskChange::Title),
        "[a-z ]{0,20}".prop_map(TaskChange::Description),
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Medium),
            Just(Priority::High),
            Just(Priority::Critical),
        ]
        .prop_map(TaskChange::Priority),
    ]
}

fn replica_with_edits(id: &str, node: &str, edits: &[TaskChange]) -> TaskReplica {
    let mut r = TaskReplica::new(TaskId::new(id), "initial", None);
    let node_id = NodeId::new(node);
    for (i, change) in edits.iter().enumerate() {
        r = r.apply_local(change.clone(), &node_id, (i + 1) as u64).unwrap();
    }
    r
}

proptest! {
    #[test]
    fn merge_is_commutative(
        edits_a in prop::collection::vec(arb_change(), 0..4),
        edits_b in prop::collection::vec(arb_change(), 0..4),
    ) {
        let a = replica_with_edits("t1", "n1", &edits_a);
        let b = replica_with_edits("t1", "n2", &edits_b);

        let (ab, _) = merge_remote(&a, &b, ClockMergePolicy::ClockThenTimestamp);
        let (ba, _) = merge_remote(&b, &a, ClockMergePolicy::ClockThenTimestamp);

        prop_assert_eq!(ab.title, ba.title);
        prop_assert_eq!(ab.description, ba.description);
        prop_assert_eq!(ab.priority, ba.priority);
        prop_assert_eq!(ab.vector_clock, ba.vector_clock);
    }

    #[test]
    fn merge_is_idempotent(
        edits_a in prop::collection::vec(arb_change(), 0..4),
        edits_b in prop::collection::vec(arb_change(), 0..4),
    ) {
        let a = replica_with_edits("t1", "n1", &edits_a);
        let b = replica_with_edits("t1", "n2", &edits_b);

        let (once, _) = merge_remote(&a, &b, ClockMergePolicy::ClockThenTimestamp);
        let (twice, _) = merge_remote(&once, &b, ClockMergePolicy::ClockThenTimestamp);

        prop_assert_eq!(once, twice);
    }

    #[test]
    fn merge_converges_regardless_of_interleaving(
        edits_a in prop::collection::vec(arb_change(), 0..3),
        edits_b in prop::collection::vec(arb_change(), 0..3),
        edits_c in prop::collection::vec(arb_change(), 0..3),
    ) {
        let a = replica_with_edits("t1", "n1", &edits_a);
        let b = replica_with_edits("t1", "n2", &edits_b);
        let c = replica_with_edits("t1", "n3", &edits_c);

        // (a merge b) merge c
        let (ab, _) = merge_remote(&a, &b, ClockMergePolicy::ClockThenTimestamp);
        let (abc, _) = merge_remote(&ab, &c, ClockMergePolicy::ClockThenTimestamp);

        // (b merge c) merge a
        let (bc, _) = merge_remote(&b, &c, ClockMergePolicy::ClockThenTimestamp);
        let (bca, _) = merge_remote(&bc, &a, ClockMergePolicy::ClockThenTimestamp);

        // (a merge c) merge b
        let (ac, _) = merge_remote(&a, &c, ClockMergePolicy::ClockThenTimestamp);
        let (acb, _) = merge_remote(&ac, &b, ClockMergePolicy::ClockThenTimestamp);

        prop_assert_eq!(&abc.title, &bca.title);
        prop_assert_eq!(&abc.title, &acb.title);
        prop_assert_eq!(&abc.vector_clock, &bca.vector_clock);
        prop_assert_eq!(&abc.vector_clock, &acb.vector_clock);
    }
}
