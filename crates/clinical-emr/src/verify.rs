//! Verification Engine (C9, §4.9): decides whether a task's
//! `verification_state` becomes `verified` or `failed` by comparing the
//! local claim against an EMR-fetched payload. Grounded on
//! `clinical-journal::resolver::ConflictResolver`'s shape (an audit-sink
//! wrapper around a pure algorithm, with its own audit-id counter).

use clinical_core::audit::{AuditAction, AuditEntry};
use clinical_core::effects::{AuditSink, StorageError};
use clinical_core::ids::AuditId;
use clinical_core::task::{
    content_checksum, EmrPayloadEnvelope, EmrResourceFields, TaskReplica, TaskStatus, VerificationState,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// A single validation failure (§4.8 validation rules).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationError {
    pub field: String,
    pub code: String,
}

/// A non-fatal validation concern (e.g. incomplete terminology coding).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationWarning {
    pub field: String,
    pub code: String,
}

/// The result of one verification run (§4.9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub errors: Vec<VerificationError>,
    pub warnings: Vec<VerificationWarning>,
    pub checksum: String,
}

/// Canonicalize an EMR payload to a stable byte form (sorted-key JSON, no
/// insignificant whitespace) so its checksum is reproducible regardless of
/// the source system's field ordering.
fn canonicalize(payload: &EmrPayloadEnvelope) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(payload)?;
    serde_json::to_string(&sort_keys(value))
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, serde_json::Value> =
                std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k, sort_keys(v));
            }
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

fn local_status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "todo",
        TaskStatus::InProgress => "in-progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Cancelled => "cancelled",
        TaskStatus::Verified => "completed",
    }
}

/// Barcode format validation (§4.9): length 8-64, known medical-identifier
/// prefix.
fn barcode_well_formed(barcode: &str) -> bool {
    const KNOWN_PREFIXES: &[&str] = &["MRN", "SSN", "NPI", "DEA"];
    (8..=64).contains(&barcode.len()) && KNOWN_PREFIXES.iter().any(|p| barcode.starts_with(p))
}

fn barcode_matches_patient(barcode: &str, local: &TaskReplica) -> bool {
    match &local.patient_reference {
        Some(reference) => barcode.ends_with(reference.as_str()),
        None => false,
    }
}

/// Pure comparison: local claim vs. fetched EMR payload, under the §4.8
/// rules, with an optional barcode cross-check. No I/O, no audit write —
/// see [`VerificationEngine::verify`] for the stateful wrapper.
pub fn evaluate(
    local: &TaskReplica,
    fetched: &EmrPayloadEnvelope,
    remote_status: Option<&str>,
    barcode: Option<&str>,
) -> Result<VerificationResult, serde_json::Error> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    match &fetched.raw_fields {
        EmrResourceFields::Task { status, codings, .. } => {
            if status == "entered_in_error" {
                errors.push(VerificationError {
                    field: "status".into(),
                    code: "entered_in_error".into(),
                });
            }
            let local_status = local_status_label(local.status);
            if status != local_status {
                errors.push(VerificationError {
                    field: "status".into(),
                    code: "status_mismatch".into(),
                });
            }
            if let Some(remote_status) = remote_status {
                if remote_status != status {
                    errors.push(VerificationError {
                        field: "status".into(),
                        code: "status_mismatch".into(),
                    });
                }
            }
            for coding in codings {
                if !coding.is_complete() {
                    warnings.push(VerificationWarning {
                        field: "codings".into(),
                        code: "incomplete_coding".into(),
                    });
                }
            }
        }
        EmrResourceFields::Patient { general_practitioner_reference, .. } => {
            if general_practitioner_reference.is_none() {
                warnings.push(VerificationWarning {
                    field: "general_practitioner_reference".into(),
                    code: "incomplete_coding".into(),
                });
            }
        }
        EmrResourceFields::Other(_) => {
            warnings.push(VerificationWarning {
                field: "raw_fields".into(),
                code: "unknown_resource_shape".into(),
            });
        }
    }

    if let Some(barcode) = barcode {
        if !barcode_well_formed(barcode) {
            errors.push(VerificationError {
                field: "barcode".into(),
                code: "invalid_barcode_format".into(),
            });
        } else if !barcode_matches_patient(barcode, local) {
            errors.push(VerificationError {
                field: "barcode".into(),
                code: "patient_id_mismatch".into(),
            });
        }
    }

    let canonical = canonicalize(fetched)?;
    let checksum = blake3::hash(canonical.as_bytes()).to_hex().to_string();
    let is_valid = errors.is_empty();

    Ok(VerificationResult {
        is_valid,
        errors,
        warnings,
        checksum,
    })
}

/// Whether a verification performed at `verified_at_ns` is still fresh at
/// `now_ns` given `freshness_s` (§4.9 stale detection): a verification
/// older than the freshness window transitions to `stale` on next read.
pub fn is_stale(verified_at_ns: u64, now_ns: u64, freshness_s: u64) -> bool {
    let freshness_ns = freshness_s.saturating_mul(1_000_000_000);
    now_ns.saturating_sub(verified_at_ns) > freshness_ns
}

/// Stateful wrapper: runs [`evaluate`], then writes an `emr_verification`
/// audit entry (§4.9 step 4).
pub struct VerificationEngine<A> {
    audit: Arc<A>,
    actor: String,
    next_audit_id: AtomicU64,
}

impl<A: AuditSink> VerificationEngine<A> {
    pub fn new(audit: Arc<A>, actor: impl Into<String>) -> Self {
        Self {
            audit,
            actor: actor.into(),
            next_audit_id: AtomicU64::new(1),
        }
    }

    /// Runs [`evaluate`], derives the post-verification replica (with
    /// `verification_state` set to `verified`/`failed` and `emr_payload`
    /// updated to the fetched envelope), writes an audit entry hashing the
    /// actual before/after replica content, and returns both the result and
    /// the replica the caller should persist.
    pub async fn verify(
        &self,
        local: &TaskReplica,
        fetched: &EmrPayloadEnvelope,
        remote_status: Option<&str>,
        barcode: Option<&str>,
        now_ns: u64,
    ) -> Result<(VerificationResult, TaskReplica), StorageError> {
        let result = evaluate(local, fetched, remote_status, barcode)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;

        let mut next = local.clone();
        next.verification_state = if result.is_valid {
            VerificationState::Verified
        } else {
            VerificationState::Failed
        };
        next.emr_payload = Some(fetched.clone());

        let before_hash = content_checksum(local).map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        let after_hash = content_checksum(&next).map_err(|e| StorageError::WriteFailed(e.to_string()))?;

        let id = self.next_audit_id.fetch_add(1, AtomicOrdering::Relaxed);
        let entry = AuditEntry::new(
            AuditId(id),
            now_ns,
            self.actor.clone(),
            AuditAction::EmrVerification,
            local.id.clone(),
            before_hash,
            after_hash,
            local.vector_clock.clone(),
        )
        .with_metadata(serde_json::json!({
            "is_valid": result.is_valid,
            "error_count": result.errors.len(),
            "warning_count": result.warnings.len(),
        }));

        tracing::info!(
            task_id = %local.id,
            is_valid = result.is_valid,
            errors = result.errors.len(),
            "emr_verification complete"
        );
        self.audit.record(entry).await?;

        Ok((result, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinical_core::effects::{PersistenceEffects, ReplicaFilter, StorageStats};
    use clinical_core::ids::TaskId;
    use clinical_core::task::{EmrSystem, TaskReplica, TerminologyCoding};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn local_replica(status: TaskStatus, patient_reference: Option<&str>) -> TaskReplica {
        let mut r = TaskReplica::new(
            TaskId::new("t1"),
            "Draw blood",
            patient_reference.map(|s| s.to_string()),
        );
        r.status = status;
        r
    }

    fn fetched_task(status: &str) -> EmrPayloadEnvelope {
        EmrPayloadEnvelope {
            system: EmrSystem::Epic,
            resource_type: "Task".into(),
            resource_id: "task-1".into(),
            version: 1,
            raw_fields: EmrResourceFields::Task {
                status: status.to_string(),
                for_patient_reference: Some("patient-1".into()),
                codings: vec![TerminologyCoding {
                    system: Some("http://loinc.org".into()),
                    code: Some("1234-5".into()),
                }],
            },
            checksum: String::new(),
            fetched_at_ns: 0,
        }
    }

    #[test]
    fn matching_status_is_valid() {
        let local = local_replica(TaskStatus::Completed, Some("patient-1"));
        let fetched = fetched_task("completed");
        let result = evaluate(&local, &fetched, None, None).unwrap();
        assert!(result.is_valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn status_mismatch_is_invalid() {
        let local = local_replica(TaskStatus::Completed, Some("patient-1"));
        let fetched = fetched_task("in-progress");
        let result = evaluate(&local, &fetched, None, None).unwrap();
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.code == "status_mismatch"));
    }

    #[test]
    fn entered_in_error_always_invalid() {
        let local = local_replica(TaskStatus::Completed, Some("patient-1"));
        let fetched = fetched_task("entered_in_error");
        let result = evaluate(&local, &fetched, None, None).unwrap();
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.code == "entered_in_error"));
    }

    #[test]
    fn valid_barcode_matching_patient_passes() {
        let local = local_replica(TaskStatus::Completed, Some("patient-1"));
        let fetched = fetched_task("completed");
        let result = evaluate(&local, &fetched, None, Some("MRN-patient-1")).unwrap();
        assert!(result.is_valid);
    }

    #[test]
    fn barcode_for_different_patient_fails() {
        let local = local_replica(TaskStatus::Completed, Some("patient-1"));
        let fetched = fetched_task("completed");
        let result = evaluate(&local, &fetched, None, Some("MRN-someone-else")).unwrap();
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.code == "patient_id_mismatch"));
    }

    #[test]
    fn malformed_barcode_rejected() {
        let local = local_replica(TaskStatus::Completed, Some("patient-1"));
        let fetched = fetched_task("completed");
        let result = evaluate(&local, &fetched, None, Some("short")).unwrap();
        assert!(!result.is_valid);
        assert!(result.errors.iter().any(|e| e.code == "invalid_barcode_format"));
    }

    #[test]
    fn checksum_is_stable_across_calls() {
        let local = local_replica(TaskStatus::Completed, Some("patient-1"));
        let fetched = fetched_task("completed");
        let r1 = evaluate(&local, &fetched, None, None).unwrap();
        let r2 = evaluate(&local, &fetched, None, None).unwrap();
        assert_eq!(r1.checksum, r2.checksum);
    }

    #[test]
    fn stale_after_freshness_window() {
        let freshness_s = 900;
        assert!(!is_stale(0, 899 * 1_000_000_000, freshness_s));
        assert!(is_stale(0, 901 * 1_000_000_000, freshness_s));
    }

    #[derive(Default)]
    struct MemStore {
        audits: Mutex<Vec<AuditEntry>>,
    }

    #[async_trait::async_trait]
    impl PersistenceEffects for MemStore {
        async fn save_batch(&self, _replicas: &[TaskReplica]) -> Result<(), StorageError> {
            Ok(())
        }
        async fn load(&self, _filter: &ReplicaFilter) -> Result<Vec<TaskReplica>, StorageError> {
            Ok(Vec::new())
        }
        async fn get(&self, _id: &TaskId) -> Result<Option<TaskReplica>, StorageError> {
            Ok(None)
        }
        async fn append_audit(&self, entry: AuditEntry) -> Result<(), StorageError> {
            self.audits.lock().push(entry);
            Ok(())
        }
        async fn audit_for(&self, id: &TaskId) -> Result<Vec<AuditEntry>, StorageError> {
            Ok(self.audits.lock().iter().filter(|e| &e.target_replica_id == id).cloned().collect())
        }
        async fn stats(&self) -> Result<StorageStats, StorageError> {
            Ok(StorageStats::default())
        }
    }

    #[tokio::test]
    async fn verify_writes_one_audit_entry() {
        let store = Arc::new(MemStore::default());
        let engine = VerificationEngine::new(store.clone(), "verifier-1");
        let local = local_replica(TaskStatus::Completed, Some("patient-1"));
        let fetched = fetched_task("in-progress");
        let (result, next) = engine.verify(&local, &fetched, None, None, 0).await.unwrap();
        assert!(!result.is_valid);
        assert_eq!(next.verification_state, VerificationState::Failed);
        assert_eq!(store.audits.lock().len(), 1);
        assert_eq!(store.audits.lock()[0].action, AuditAction::EmrVerification);
        assert_ne!(
            store.audits.lock()[0].before_hash,
            store.audits.lock()[0].after_hash
        );
    }
}
