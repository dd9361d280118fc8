//! Append-only audit entries (§3). Never deleted; the identity field may be
//! anonymized later to satisfy a right-to-erasure request, but the record
//! itself stays.

use crate::clock::VectorClock;
use crate::ids::{AuditId, TaskId};
use serde::{Deserialize, Serialize};

/// The kind of action an audit entry records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LocalMutation,
    RemoteMerge,
    EmrVerification,
    Migration,
}

/// An append-only record of a mutation or verification decision (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditId,
    pub timestamp_ns: u64,
    /// User or system identity that performed the action. May be
    /// overwritten with an anonymized placeholder after right-to-erasure;
    /// the rest of the entry is never altered.
    pub actor: String,
    pub action: AuditAction,
    pub target_replica_id: TaskId,
    pub before_hash: String,
    pub after_hash: String,
    pub vector_clock_snapshot: VectorClock,
    pub metadata: Option<serde_json::Value>,
}

impl AuditEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: AuditId,
        timestamp_ns: u64,
        actor: impl Into<String>,
        action: AuditAction,
        target_replica_id: TaskId,
        before_hash: impl Into<String>,
        after_hash: impl Into<String>,
        vector_clock_snapshot: VectorClock,
    ) -> Self {
        Self {
            id,
            timestamp_ns,
            actor: actor.into(),
            action,
            target_replica_id,
            before_hash: before_hash.into(),
            after_hash: after_hash.into(),
            vector_clock_snapshot,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Replace the actor with an anonymized placeholder, preserving the
    /// rest of the entry (right-to-erasure support, §3).
    pub fn anonymize_actor(&mut self) {
        self.actor = "[redacted]".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymize_preserves_everything_but_actor() {
        let mut entry = AuditEntry::new(
            AuditId(1),
            1_000,
            "nurse-1",
            AuditAction::LocalMutation,
            TaskId::new("t1"),
            "before",
            "after",
            VectorClock::new(),
        );
        let before_hash = entry.before_hash.clone();
        entry.anonymize_actor();
        assert_eq!(entry.actor, "[redacted]");
        assert_eq!(entry.before_hash, before_hash);
    }
}
