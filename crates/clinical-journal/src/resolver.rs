//! The batch Conflict Resolver (C3, §4.3): merges a batch of remote
//! replicas against local state, chunked with a per-chunk deadline so a
//! slow round still makes partial progress. Grounded on the teacher's
//! `aura-anti-entropy::sync::anti_entropy` chunked-with-deadline control
//! flow, generalized from op/digest exchange to whole-replica batches.

use crate::merge::{merge_remote, ConflictReport};
use clinical_core::effects::{AuditSink, PersistenceEffects, StorageError};
use clinical_core::task::{content_checksum, TaskReplica};
use clinical_core::{AuditId, ClinicalError, ClockMergePolicy, TaskId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tunables for one resolver instance (`merge.*` config surface).
#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    pub chunk_size: usize,
    pub chunk_deadline: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            chunk_deadline: Duration::from_millis(500),
        }
    }
}

/// Result of resolving one batch.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub merged: Vec<TaskReplica>,
    pub conflict_log: Vec<ConflictReport>,
    /// `true` if a chunk deadline was exceeded and a suffix of `remote` was
    /// left unprocessed (§4.3 `merge_timeout`; the caller reschedules the
    /// remainder).
    pub timed_out: bool,
    pub processed_count: usize,
}

/// Merges a batch of remote replicas against local state, in chunks, with
/// audit logging and atomic per-chunk persistence.
pub struct ConflictResolver<P> {
    persistence: Arc<P>,
    audit: Arc<dyn AuditSink>,
    config: ResolverConfig,
    policy: ClockMergePolicy,
    next_audit_id: AtomicU64,
}

impl<P: PersistenceEffects> ConflictResolver<P> {
    pub fn new(
        persistence: Arc<P>,
        audit: Arc<dyn AuditSink>,
        config: ResolverConfig,
        policy: ClockMergePolicy,
    ) -> Self {
        Self {
            persistence,
            audit,
            config,
            policy,
            next_audit_id: AtomicU64::new(1),
        }
    }

    /// Merge `remote` against `local`, in ascending
    /// `(emr_payload.version, last_modified_physical, id)` order for
    /// reproducible replays (§4.3).
    pub async fn resolve_batch(
        &self,
        mut remote: Vec<TaskReplica>,
        local: &HashMap<TaskId, TaskReplica>,
        now_ns: u64,
    ) -> Result<ResolveOutcome, ClinicalError> {
        remote.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

        let mut merged = Vec::new();
        let mut conflict_log = Vec::new();
        let mut timed_out = false;
        let mut processed = 0usize;

        for chunk in remote.chunks(self.config.chunk_size.max(1)) {
            let deadline = Instant::now() + self.config.chunk_deadline;
            let mut chunk_merged = Vec::with_capacity(chunk.len());

            for r in chunk {
                if Instant::now() >= deadline {
                    timed_out = true;
                    break;
                }
                let before = local.get(&r.id).cloned().unwrap_or_else(|| r.clone());
                let result = match local.get(&r.id) {
                    None => (r.clone(), ConflictReport {
                        replica_id: r.id.clone(),
                        conflicts: Vec::new(),
                    }),
                    Some(l) => merge_remote(l, r, self.policy),
                };
                chunk_merged.push((before, result.0, result.1));
                processed += 1;
            }

            if chunk_merged.is_empty() {
                if timed_out {
                    break;
                }
                continue;
            }

            let replicas: Vec<TaskReplica> = chunk_merged.iter().map(|(_, r, _)| r.clone()).collect();
            self.persistence
                .save_batch(&replicas)
                .await
                .map_err(storage_to_clinical)?;

            for (before, replica, report) in chunk_merged {
                if !report.is_empty() {
                    let id = self.next_audit_id.fetch_add(1, AtomicOrdering::Relaxed);
                    let before_hash = content_checksum(&before).map_err(|e| ClinicalError::internal(e.to_string()))?;
                    let after_hash = content_checksum(&replica).map_err(|e| ClinicalError::internal(e.to_string()))?;
                    let entry = clinical_core::audit::AuditEntry::new(
                        AuditId(id),
                        now_ns,
                        "conflict-resolver",
                        clinical_core::audit::AuditAction::RemoteMerge,
                        replica.id.clone(),
                        before_hash,
                        after_hash,
                        replica.vector_clock.clone(),
                    );
                    self.audit.record(entry).await.map_err(storage_to_clinical)?;
                }
                conflict_log.push(report);
                merged.push(replica);
            }

            if timed_out {
                break;
            }
        }

        if timed_out {
            tracing::warn!(
                processed,
                total = remote.len(),
                "merge_timeout: chunk deadline exceeded, partial batch committed"
            );
        }

        Ok(ResolveOutcome {
            merged,
            conflict_log,
            timed_out,
            processed_count: processed,
        })
    }
}

fn sort_key(r: &TaskReplica) -> (u64, u64, String) {
    let version = r.emr_payload.as_ref().map(|p| p.version).unwrap_or(0);
    (version, r.last_modified_physical_ns, r.id.as_str().to_string())
}

fn storage_to_clinical(err: StorageError) -> ClinicalError {
    match err {
        StorageError::LimitExceeded { .. } => ClinicalError::storage(err.to_string()),
        StorageError::DataCorruption => ClinicalError::internal(err.to_string()),
        _ => ClinicalError::storage(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinical_core::effects::{AuditSink, PersistenceEffects, ReplicaFilter, StorageStats};
    use clinical_core::task::TaskStatus;
    use clinical_core::NodeId;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MemStore {
        replicas: Mutex<HashMap<TaskId, TaskReplica>>,
        audits: Mutex<Vec<clinical_core::audit::AuditEntry>>,
    }

    #[async_trait::async_trait]
    impl PersistenceEffects for MemStore {
        async fn save_batch(&self, replicas: &[TaskReplica]) -> Result<(), StorageError> {
            let mut map = self.replicas.lock();
            for r in replicas {
                map.insert(r.id.clone(), r.clone());
            }
            Ok(())
        }
        async fn load(&self, _filter: &ReplicaFilter) -> Result<Vec<TaskReplica>, StorageError> {
            Ok(self.replicas.lock().values().cloned().collect())
        }
        async fn get(&self, id: &TaskId) -> Result<Option<TaskReplica>, StorageError> {
            Ok(self.replicas.lock().get(id).cloned())
        }
        async fn append_audit(&self, entry: clinical_core::audit::AuditEntry) -> Result<(), StorageError> {
            self.audits.lock().push(entry);
            Ok(())
        }
        async fn audit_for(&self, id: &TaskId) -> Result<Vec<clinical_core::audit::AuditEntry>, StorageError> {
            Ok(self
                .audits
                .lock()
                .iter()
                .filter(|e| &e.target_replica_id == id)
                .cloned()
                .collect())
        }
        async fn stats(&self) -> Result<StorageStats, StorageError> {
            Ok(StorageStats::default())
        }
    }

    fn replica(id: &str) -> TaskReplica {
        TaskReplica::new(TaskId::new(id), "title", None)
    }

    #[tokio::test]
    async fn inserts_unknown_replicas() {
        let store = Arc::new(MemStore::default());
        let resolver = ConflictResolver::new(
            store.clone(),
            store.clone(),
            ResolverConfig::default(),
            ClockMergePolicy::ClockThenTimestamp,
        );
        let remote = vec![replica("t1"), replica("t2")];
        let outcome = resolver
            .resolve_batch(remote, &HashMap::new(), 1)
            .await
            .unwrap();
        assert_eq!(outcome.merged.len(), 2);
        assert!(!outcome.timed_out);
        assert_eq!(store.replicas.lock().len(), 2);
    }

    #[tokio::test]
    async fn merges_known_replicas_and_logs_conflicts() {
        let store = Arc::new(MemStore::default());
        let resolver = ConflictResolver::new(
            store.clone(),
            store.clone(),
            ResolverConfig::default(),
            ClockMergePolicy::ClockThenTimestamp,
        );

        let mut local_replica = replica("t1");
        local_replica
            .vector_clock
            .increment(&NodeId::new("n1"), 1)
            .unwrap();

        let mut remote_replica = local_replica
            .apply_local(
                clinical_core::task::TaskChange::Status(TaskStatus::InProgress),
                &NodeId::new("n2"),
                2,
            )
            .unwrap();
        remote_replica.title = "changed".into();

        let mut local = HashMap::new();
        local.insert(local_replica.id.clone(), local_replica);

        let outcome = resolver
            .resolve_batch(vec![remote_replica], &local, 2)
            .await
            .unwrap();
        assert_eq!(outcome.merged.len(), 1);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn deadline_of_zero_yields_partial_progress() {
        let store = Arc::new(MemStore::default());
        let resolver = ConflictResolver::new(
            store.clone(),
            store.clone(),
            ResolverConfig {
                chunk_size: 100,
                chunk_deadline: Duration::from_nanos(0),
            },
            ClockMergePolicy::ClockThenTimestamp,
        );
        let remote: Vec<TaskReplica> = (0..50).map(|i| replica(&format!("t{i}"))).collect();
        let outcome = resolver
            .resolve_batch(remote, &HashMap::new(), 1)
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(outcome.processed_count < 50);
    }
}
