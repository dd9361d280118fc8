//! The CRDT merge function for a single [`TaskReplica`] (§4.2).
//!
//! Pure and I/O-free by design — no persistence, no network — following the
//! teacher's `aura-anti-entropy::pure` convention of keeping the merge
//! algorithm itself free of effects so it is trivial to property-test.

use clinical_core::clock::{CausalOrder, ClockMergePolicy};
use clinical_core::task::{EmrPayloadEnvelope, TaskReplica, TaskStatus, VerificationState};
use clinical_core::{NodeId, TaskId};
use serde::{Deserialize, Serialize};

/// Which side's value a merge kept for a contested field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    Local,
    Remote,
    /// Both sides already agreed; not a real conflict.
    Agreed,
}

/// One field whose value changed because the other side's clock (or
/// tie-break) dominated, emitted for audit logging (§4.2 `conflict_report`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: &'static str,
    pub winner: Winner,
}

/// Enumerates every field whose value changed due to dominance reversal
/// during a merge, for audit logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub replica_id: TaskId,
    pub conflicts: Vec<FieldConflict>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// The node whose entry holds the highest counter in `clock`, used as a
/// last-editor proxy for the node-identifier tie-break (§4.2, §9 Open
/// Question — resolved as clock dominance, then physical timestamp, then
/// this proxy, see `DESIGN.md`).
fn dominant_node(clock: &clinical_core::VectorClock) -> Option<NodeId> {
    clock
        .iter()
        .max_by(|(n1, c1), (n2, c2)| c1.cmp(c2).then_with(|| n2.cmp(n1)))
        .map(|(n, _)| n.clone())
}

/// Decide which whole replica's scalar-field edits win, per the tie-break
/// chain in §4.2: clock dominance, then physical timestamp, then
/// lexicographic node id of the most recent editor.
fn scalar_winner(local: &TaskReplica, remote: &TaskReplica, policy: ClockMergePolicy) -> Winner {
    if policy == ClockMergePolicy::ClockThenTimestamp {
        match local.vector_clock.compare(&remote.vector_clock) {
            CausalOrder::After => return Winner::Local,
            CausalOrder::Before => return Winner::Remote,
            CausalOrder::Equal => return Winner::Agreed,
            CausalOrder::Concurrent => {}
        }
    }

    match local
        .last_modified_physical_ns
        .cmp(&remote.last_modified_physical_ns)
    {
        std::cmp::Ordering::Greater => return Winner::Local,
        std::cmp::Ordering::Less => return Winner::Remote,
        std::cmp::Ordering::Equal => {}
    }

    match (
        dominant_node(&local.vector_clock),
        dominant_node(&remote.vector_clock),
    ) {
        (Some(l), Some(r)) if l < r => Winner::Local,
        (Some(l), Some(r)) if l > r => Winner::Remote,
        _ => Winner::Agreed,
    }
}

/// Whether `replica` is an absorbing tombstone: cancelled with
/// `tombstone = true`, whose clock `other` does not causally dominate
/// (§4.2, scenario S1). Scenario S1 starts both sides from a shared empty
/// clock, so after one `apply_local` each their clocks are concurrent, not
/// dominating either way — the tombstone must still win on a concurrent
/// clock, not only when it strictly dominates.
fn absorbing_tombstone(replica: &TaskReplica, other: &TaskReplica) -> bool {
    replica.status == TaskStatus::Cancelled
        && replica.tombstone
        && !other.vector_clock.dominates(&replica.vector_clock)
}

fn merge_emr_payload(
    local: &Option<EmrPayloadEnvelope>,
    remote: &Option<EmrPayloadEnvelope>,
) -> (Option<EmrPayloadEnvelope>, Winner) {
    match (local, remote) {
        (None, None) => (None, Winner::Agreed),
        (Some(_), None) => (local.clone(), Winner::Local),
        (None, Some(_)) => (remote.clone(), Winner::Remote),
        (Some(l), Some(r)) => {
            if !l.same_resource(r) {
                // Different EMR resources entirely; prefer the more recently
                // fetched one rather than silently dropping data.
                return if l.fetched_at_ns >= r.fetched_at_ns {
                    (local.clone(), Winner::Local)
                } else {
                    (remote.clone(), Winner::Remote)
                };
            }
            if l.version >= r.version {
                (local.clone(), if l.version == r.version { Winner::Agreed } else { Winner::Local })
            } else {
                (remote.clone(), Winner::Remote)
            }
        }
    }
}

/// Merge `remote` into `local`, returning the converged replica and a
/// report of every field whose value flipped. Idempotent: merging the same
/// `remote` twice produces the same result as merging it once (§4.2).
pub fn merge_remote(local: &TaskReplica, remote: &TaskReplica, policy: ClockMergePolicy) -> (TaskReplica, ConflictReport) {
    let mut conflicts = Vec::new();
    let mut next = local.clone();

    next.vector_clock = local.vector_clock.merge(&remote.vector_clock);
    next.last_modified_physical_ns = local
        .last_modified_physical_ns
        .max(remote.last_modified_physical_ns);

    // Tombstone-absorbing rule takes priority over the general LWW winner.
    let local_absorbs = absorbing_tombstone(local, remote);
    let remote_absorbs = absorbing_tombstone(remote, local);

    let status_winner = if local_absorbs {
        Winner::Local
    } else if remote_absorbs {
        Winner::Remote
    } else {
        scalar_winner(local, remote, policy)
    };

    if status_winner == Winner::Remote && (local.status, local.tombstone) != (remote.status, remote.tombstone) {
        next.status = remote.status;
        next.tombstone = remote.tombstone;
        conflicts.push(FieldConflict {
            field: "status",
            winner: Winner::Remote,
        });
    }

    let fields_winner = scalar_winner(local, remote, policy);
    if fields_winner == Winner::Remote {
        macro_rules! take_remote {
            ($field:ident, $name:literal) => {
                if local.$field != remote.$field {
                    next.$field = remote.$field.clone();
                    conflicts.push(FieldConflict {
                        field: $name,
                        winner: Winner::Remote,
                    });
                }
            };
        }
        take_remote!(title, "title");
        take_remote!(description, "description");
        take_remote!(priority, "priority");
        take_remote!(assignee, "assignee");
        take_remote!(department, "department");
    }

    let (merged_payload, payload_winner) = merge_emr_payload(&local.emr_payload, &remote.emr_payload);
    if payload_winner == Winner::Remote {
        next.emr_payload = merged_payload;
        conflicts.push(FieldConflict {
            field: "emr_payload",
            winner: Winner::Remote,
        });
        // A new EMR payload invalidates any prior verification decision;
        // the Verification Engine (C9) recomputes it on next read.
        next.verification_state = VerificationState::Pending;
    } else if payload_winner == Winner::Local {
        next.emr_payload = merged_payload;
    }

    if local.handover_lock != remote.handover_lock && local.handover_lock.is_none() {
        next.handover_lock = remote.handover_lock.clone();
    }

    tracing::debug!(
        replica_id = %next.id,
        conflicts = conflicts.len(),
        "merge_remote"
    );

    (
        next,
        ConflictReport {
            replica_id: local.id.clone(),
            conflicts,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinical_core::task::TaskChange;
    use clinical_core::VectorClock;

    fn base() -> TaskReplica {
        TaskReplica::new(TaskId::new("t1"), "Draw blood", Some("patient-1".into()))
    }

    #[test]
    fn merge_idempotent() {
        let local = base();
        let mut remote = base();
        remote.vector_clock = {
            let mut c = VectorClock::new();
            c.increment(&NodeId::new("n2"), 5).unwrap();
            c
        };
        remote.title = "Draw blood panel".into();
        remote.last_modified_physical_ns = 5;

        let (once, _) = merge_remote(&local, &remote, ClockMergePolicy::ClockThenTimestamp);
        let (twice, _) = merge_remote(&once, &remote, ClockMergePolicy::ClockThenTimestamp);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_commutative_on_resulting_fields() {
        let mut a = base();
        a.vector_clock.increment(&NodeId::new("n1"), 1).unwrap();
        a.title = "from A".into();
        a.last_modified_physical_ns = 1;

        let mut b = base();
        b.vector_clock.increment(&NodeId::new("n2"), 2).unwrap();
        b.title = "from B".into();
        b.last_modified_physical_ns = 2;

        let (ab, _) = merge_remote(&a, &b, ClockMergePolicy::ClockThenTimestamp);
        let (ba, _) = merge_remote(&b, &a, ClockMergePolicy::ClockThenTimestamp);
        assert_eq!(ab.title, ba.title);
        assert_eq!(ab.vector_clock, ba.vector_clock);
    }

    #[test]
    fn tombstone_absorbs_when_dominant() {
        let n1 = NodeId::new("n1");
        let n2 = NodeId::new("n2");

        let local = base()
            .apply_local(TaskChange::Status(TaskStatus::InProgress), &n1, 1)
            .unwrap();

        let remote = base()
            .apply_local(TaskChange::CancelWithTombstone, &n2, 1)
            .unwrap();

        let (merged, _) = merge_remote(&local, &remote, ClockMergePolicy::ClockThenTimestamp);
        assert_eq!(merged.status, TaskStatus::Cancelled);
        assert!(merged.tombstone);
        assert_eq!(merged.vector_clock.get(&n1), 1);
        assert_eq!(merged.vector_clock.get(&n2), 1);
    }

    #[test]
    fn emr_payload_higher_version_wins_regardless_of_clock() {
        use clinical_core::task::{EmrResourceFields, EmrSystem};

        let mut local = base();
        local.emr_payload = Some(EmrPayloadEnvelope {
            system: EmrSystem::Epic,
            resource_type: "Task".into(),
            resource_id: "task-1".into(),
            version: 1,
            raw_fields: EmrResourceFields::Other(serde_json::json!({})),
            checksum: "a".into(),
            fetched_at_ns: 100,
        });
        local.vector_clock.increment(&NodeId::new("n1"), 10).unwrap();

        let mut remote = base();
        remote.emr_payload = Some(EmrPayloadEnvelope {
            system: EmrSystem::Epic,
            resource_type: "Task".into(),
            resource_id: "task-1".into(),
            version: 2,
            raw_fields: EmrResourceFields::Other(serde_json::json!({})),
            checksum: "b".into(),
            fetched_at_ns: 50,
        });

        let (merged, report) = merge_remote(&local, &remote, ClockMergePolicy::ClockThenTimestamp);
        assert_eq!(merged.emr_payload.unwrap().version, 2);
        assert!(!report.is_empty());
    }
}
