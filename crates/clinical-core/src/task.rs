//! The CRDT task replica: the atomic unit of synchronization (§3).
//!
//! This module owns the data model and the local write path
//! (`apply_local`); the remote merge function lives in `clinical-journal`
//! since it needs both a local and a remote replica plus the vector-clock
//! comparison to decide field-by-field winners.

use crate::clock::VectorClock;
use crate::errors::ClinicalError;
use crate::ids::{NodeId, TaskId};
use serde::{Deserialize, Serialize};

/// Task priority, ordered low to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
    /// Reached only through the verification workflow, never via a local
    /// status edit (the write-path transition table below has no edges
    /// into or out of this variant).
    Verified,
}

impl TaskStatus {
    /// All six statuses, used to enumerate the 6x6 transition grid in tests.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Blocked,
        TaskStatus::Cancelled,
        TaskStatus::Verified,
    ];
}

/// Verification outcome, computed by the Verification Engine rather than
/// merged directly (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Pending,
    Verified,
    Failed,
    Stale,
}

/// The write-path status transition graph (§3). Enforced only on
/// `apply_local`; CRDT merges never reject a state, so this table has no
/// bearing on `merge_remote`.
pub struct StatusTransition;

impl StatusTransition {
    /// Whether a local write may move a replica from `from` to `to`.
    pub fn is_allowed(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Todo, InProgress)
                | (Todo, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Blocked)
                | (InProgress, Cancelled)
                | (Blocked, InProgress)
                | (Blocked, Cancelled)
                | (Completed, InProgress)
                | (Cancelled, Todo)
        )
    }
}

/// The EMR system a payload was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmrSystem {
    Epic,
    Cerner,
}

/// A single FHIR terminology coding; both `system` and `code` are required
/// for the pair to count as complete (§4.8 `incomplete_coding`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminologyCoding {
    pub system: Option<String>,
    pub code: Option<String>,
}

impl TerminologyCoding {
    pub fn is_complete(&self) -> bool {
        self.system.is_some() && self.code.is_some()
    }
}

/// Typed escape-hatch union for the schema-variable resource content a FHIR
/// or HL7 fetch returns. Known shapes get typed fields; anything else falls
/// to `Other` rather than letting an untyped `serde_json::Value` leak into
/// merge/verification logic (design note: dynamic JSON typing for EMR
/// payloads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resource_kind", rename_all = "snake_case")]
pub enum EmrResourceFields {
    Patient {
        identifiers: Vec<String>,
        general_practitioner_reference: Option<String>,
    },
    Task {
        status: String,
        for_patient_reference: Option<String>,
        codings: Vec<TerminologyCoding>,
    },
    Other(serde_json::Value),
}

/// External-system-tagged wrapper around fetched EMR content (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmrPayloadEnvelope {
    pub system: EmrSystem,
    pub resource_type: String,
    pub resource_id: String,
    pub version: u64,
    pub raw_fields: EmrResourceFields,
    pub checksum: String,
    pub fetched_at_ns: u64,
}

impl EmrPayloadEnvelope {
    /// Whether `self` and `other` refer to the same logical EMR resource,
    /// the key `merge_remote` uses for the version-keyed override rule.
    pub fn same_resource(&self, other: &EmrPayloadEnvelope) -> bool {
        self.system == other.system && self.resource_id == other.resource_id
    }
}

/// A change to apply through the local write path. Every variant bumps the
/// owning node's vector-clock entry by exactly one (§3 invariant); `Status`
/// is additionally checked against [`StatusTransition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskChange {
    Title(String),
    Description(String),
    Priority(Priority),
    Assignee(Option<String>),
    Department(Option<String>),
    Status(TaskStatus),
    /// Cancel and tombstone in one causal step (scenario S1).
    CancelWithTombstone,
}

/// The atomic unit of synchronization (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReplica {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    pub patient_reference: Option<String>,
    pub department: Option<String>,
    pub emr_payload: Option<EmrPayloadEnvelope>,
    pub verification_state: VerificationState,
    pub vector_clock: VectorClock,
    pub last_modified_physical_ns: u64,
    pub tombstone: bool,
    /// Opaque attribute owned by the handover workflow (external
    /// collaborator, design note); core logic never inspects or mutates it
    /// except to carry it through merges untouched when not itself in
    /// conflict.
    pub handover_lock: Option<String>,
}

/// Canonical content hash of a replica's full serialized state, used for
/// persistence integrity checks and audit before/after hashes (§4.4, §9
/// Testable Property 12). `TaskReplica`'s fields serialize in a fixed
/// declaration order, so plain `serde_json` encoding is already
/// deterministic without a separate key-sorting pass.
pub fn content_checksum(replica: &TaskReplica) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(replica)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

impl TaskReplica {
    /// Construct a fresh, untombstoned replica in `todo` state.
    pub fn new(id: TaskId, title: impl Into<String>, patient_reference: Option<String>) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            priority: Priority::Medium,
            status: TaskStatus::Todo,
            assignee: None,
            patient_reference,
            department: None,
            emr_payload: None,
            verification_state: VerificationState::Pending,
            vector_clock: VectorClock::new(),
            last_modified_physical_ns: 0,
            tombstone: false,
            handover_lock: None,
        }
    }

    /// Apply a local edit: validate, increment the owning node's clock
    /// entry, write the field, stamp the physical timestamp.
    ///
    /// Fails with [`ClinicalError::Invalid`] if `change` is a status
    /// transition not present in [`StatusTransition`].
    pub fn apply_local(
        &self,
        change: TaskChange,
        node: &NodeId,
        now_ns: u64,
    ) -> Result<TaskReplica, ClinicalError> {
        let mut next = self.clone();

        match &change {
            TaskChange::Title(v) => next.title = v.clone(),
            TaskChange::Description(v) => next.description = v.clone(),
            TaskChange::Priority(v) => next.priority = *v,
            TaskChange::Assignee(v) => next.assignee = v.clone(),
            TaskChange::Department(v) => next.department = v.clone(),
            TaskChange::Status(to) => {
                if !StatusTransition::is_allowed(self.status, *to) {
                    return Err(ClinicalError::invalid(format!(
                        "illegal status transition {:?} -> {:?}",
                        self.status, to
                    )));
                }
                next.status = *to;
            }
            TaskChange::CancelWithTombstone => {
                if !StatusTransition::is_allowed(self.status, TaskStatus::Cancelled) {
                    return Err(ClinicalError::invalid(format!(
                        "illegal status transition {:?} -> Cancelled",
                        self.status
                    )));
                }
                next.status = TaskStatus::Cancelled;
                next.tombstone = true;
            }
        }

        next.vector_clock.increment(node, now_ns)?;
        next.last_modified_physical_ns = now_ns;
        tracing::debug!(
            task_id = %next.id,
            node = %node,
            change = ?change,
            "apply_local"
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeId {
        NodeId::new("n1")
    }

    fn replica() -> TaskReplica {
        TaskReplica::new(TaskId::new("t1"), "Draw blood", Some("patient-1".into()))
    }

    #[test]
    fn apply_local_bumps_clock_exactly_once() {
        let r = replica();
        let before = r.vector_clock.get(&node());
        let r2 = r
            .apply_local(TaskChange::Title("Draw blood panel".into()), &node(), 1)
            .unwrap();
        assert_eq!(r2.vector_clock.get(&node()), before + 1);
        assert_eq!(r2.title, "Draw blood panel");
    }

    #[test]
    fn apply_local_rejects_illegal_transition() {
        let r = replica(); // todo
        let err = r
            .apply_local(TaskChange::Status(TaskStatus::Completed), &node(), 1)
            .unwrap_err();
        assert!(matches!(err, ClinicalError::Invalid { .. }));
    }

    #[test]
    fn apply_local_allows_legal_transition() {
        let r = replica();
        let r2 = r
            .apply_local(TaskChange::Status(TaskStatus::InProgress), &node(), 1)
            .unwrap();
        assert_eq!(r2.status, TaskStatus::InProgress);
    }

    #[test]
    fn cancel_with_tombstone_sets_both_fields() {
        let r = replica();
        let r2 = r.apply_local(TaskChange::CancelWithTombstone, &node(), 1).unwrap();
        assert_eq!(r2.status, TaskStatus::Cancelled);
        assert!(r2.tombstone);
    }

    #[test]
    fn verified_status_unreachable_via_local_write() {
        for from in TaskStatus::ALL {
            assert!(!StatusTransition::is_allowed(from, TaskStatus::Verified));
            assert!(!StatusTransition::is_allowed(TaskStatus::Verified, from));
        }
    }

    #[test]
    fn transition_table_has_exactly_nine_allowed_pairs() {
        let mut count = 0;
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                if StatusTransition::is_allowed(from, to) {
                    count += 1;
                }
            }
        }
        assert_eq!(count, 9);
    }
}
