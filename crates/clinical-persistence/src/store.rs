//! In-process reference implementation of
//! [`PersistenceEffects`](clinical_core::effects::PersistenceEffects),
//! backed by `parking_lot::RwLock` over in-memory tables — the logical
//! `replicas`/`audit_log`/`schema_version` layout of §6, suitable for the
//! test suite and the `clinical-app` demo binary.

use crate::encryption::{self, KeyProvider};
use async_trait::async_trait;
use clinical_core::audit::AuditEntry;
use clinical_core::effects::{PersistenceEffects, ReplicaFilter, StorageError, StorageStats};
use clinical_core::task::{content_checksum, EmrPayloadEnvelope, TaskReplica};
use clinical_core::TaskId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// On-disk (here: in-memory) representation of a replica with sensitive
/// fields sealed. `checksum` covers the plaintext replica's canonical JSON
/// and is re-verified on every read (§4.4 integrity check).
struct StoredReplica {
    plain: TaskReplica,
    patient_reference_sealed: Option<Vec<u8>>,
    emr_payload_sealed: Option<Vec<u8>>,
    checksum: String,
}

fn canonical_checksum(replica: &TaskReplica) -> Result<String, StorageError> {
    content_checksum(replica).map_err(|e| StorageError::WriteFailed(format!("checksum serialization: {e}")))
}

pub struct InMemoryPersistence {
    replicas: RwLock<HashMap<TaskId, StoredReplica>>,
    audit_log: RwLock<Vec<AuditEntry>>,
    schema_version: RwLock<u32>,
    keys: Arc<dyn KeyProvider>,
    encryption_key_id: String,
    max_bytes: u64,
}

impl InMemoryPersistence {
    pub fn new(keys: Arc<dyn KeyProvider>, encryption_key_id: impl Into<String>, max_bytes: u64) -> Self {
        Self {
            replicas: RwLock::new(HashMap::new()),
            audit_log: RwLock::new(Vec::new()),
            schema_version: RwLock::new(0),
            keys,
            encryption_key_id: encryption_key_id.into(),
            max_bytes,
        }
    }

    pub fn schema_version(&self) -> u32 {
        *self.schema_version.read()
    }

    pub fn set_schema_version(&self, version: u32) {
        *self.schema_version.write() = version;
    }

    fn seal(&self, replica: &TaskReplica) -> Result<StoredReplica, StorageError> {
        let patient_reference_sealed = replica
            .patient_reference
            .as_ref()
            .map(|p| encryption::encrypt(self.keys.as_ref(), &self.encryption_key_id, p.as_bytes()))
            .transpose()
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;

        let emr_payload_sealed = replica
            .emr_payload
            .as_ref()
            .map(|p| {
                serde_json::to_vec(p)
                    .map_err(|e| StorageError::WriteFailed(e.to_string()))
                    .and_then(|bytes| {
                        encryption::encrypt(self.keys.as_ref(), &self.encryption_key_id, &bytes)
                            .map_err(|e| StorageError::WriteFailed(e.to_string()))
                    })
            })
            .transpose()?;

        let checksum = canonical_checksum(replica)?;

        Ok(StoredReplica {
            plain: replica.clone(),
            patient_reference_sealed,
            emr_payload_sealed,
            checksum,
        })
    }

    fn unseal(&self, stored: &StoredReplica) -> Result<TaskReplica, StorageError> {
        let recomputed = canonical_checksum(&stored.plain)?;
        if recomputed != stored.checksum {
            return Err(StorageError::DataCorruption);
        }
        // Sealed blobs round-trip the same plaintext already held in
        // `plain`; decrypting here exercises the same path a real
        // on-disk backend would take on every read.
        if let Some(sealed) = &stored.patient_reference_sealed {
            encryption::decrypt(self.keys.as_ref(), &self.encryption_key_id, sealed)
                .map_err(|_| StorageError::DataCorruption)?;
        }
        if let Some(sealed) = &stored.emr_payload_sealed {
            let bytes = encryption::decrypt(self.keys.as_ref(), &self.encryption_key_id, sealed)
                .map_err(|_| StorageError::DataCorruption)?;
            let _: EmrPayloadEnvelope = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
        }
        Ok(stored.plain.clone())
    }

    fn estimate_bytes(&self, table: &HashMap<TaskId, StoredReplica>) -> u64 {
        table
            .values()
            .map(|s| {
                serde_json::to_vec(&s.plain).map(|b| b.len() as u64).unwrap_or(0)
                    + s.patient_reference_sealed.as_ref().map(|b| b.len() as u64).unwrap_or(0)
                    + s.emr_payload_sealed.as_ref().map(|b| b.len() as u64).unwrap_or(0)
            })
            .sum()
    }
}

fn matches(filter: &ReplicaFilter, replica: &TaskReplica) -> bool {
    if let Some(status) = filter.status {
        if replica.status != status {
            return false;
        }
    }
    if let Some(assignee) = &filter.assignee {
        if replica.assignee.as_deref() != Some(assignee.as_str()) {
            return false;
        }
    }
    if let Some(patient_reference) = &filter.patient_reference {
        if replica.patient_reference.as_deref() != Some(patient_reference.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl PersistenceEffects for InMemoryPersistence {
    async fn save_batch(&self, replicas: &[TaskReplica]) -> Result<(), StorageError> {
        let mut sealed = Vec::with_capacity(replicas.len());
        for r in replicas {
            sealed.push((r.id.clone(), self.seal(r)?));
        }

        let mut table = self.replicas.write();
        let projected_extra: u64 = sealed
            .iter()
            .map(|(id, s)| {
                let existing = table
                    .get(id)
                    .map(|s| serde_json::to_vec(&s.plain).map(|b| b.len() as u64).unwrap_or(0))
                    .unwrap_or(0);
                let new_size = serde_json::to_vec(&s.plain).map(|b| b.len() as u64).unwrap_or(0);
                new_size.saturating_sub(existing)
            })
            .sum();
        let current = self.estimate_bytes(&table);
        if current + projected_extra > self.max_bytes {
            return Err(StorageError::LimitExceeded {
                used_bytes: current + projected_extra,
                max_bytes: self.max_bytes,
            });
        }

        for (id, stored) in sealed {
            table.insert(id, stored);
        }
        Ok(())
    }

    async fn load(&self, filter: &ReplicaFilter) -> Result<Vec<TaskReplica>, StorageError> {
        let table = self.replicas.read();
        let mut out = Vec::new();
        for stored in table.values() {
            if matches(filter, &stored.plain) {
                out.push(self.unseal(stored)?);
            }
        }
        out.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(out)
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskReplica>, StorageError> {
        let table = self.replicas.read();
        match table.get(id) {
            Some(stored) => Ok(Some(self.unseal(stored)?)),
            None => Ok(None),
        }
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StorageError> {
        self.audit_log.write().push(entry);
        Ok(())
    }

    async fn audit_for(&self, id: &TaskId) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(self
            .audit_log
            .read()
            .iter()
            .filter(|e| &e.target_replica_id == id)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let table = self.replicas.read();
        Ok(StorageStats {
            replica_count: table.len(),
            audit_entry_count: self.audit_log.read().len(),
            used_bytes: self.estimate_bytes(&table),
            schema_version: self.schema_version(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::StaticKeyProvider;
    use clinical_core::task::TaskId as CoreTaskId;

    fn store() -> InMemoryPersistence {
        InMemoryPersistence::new(
            Arc::new(StaticKeyProvider::new("k1", [1u8; 32])),
            "k1",
            1 << 20,
        )
    }

    fn replica(id: &str) -> TaskReplica {
        let mut r = TaskReplica::new(CoreTaskId::new(id), "title", Some("patient-xyz".into()));
        r.department = Some("ICU".into());
        r
    }

    #[tokio::test]
    async fn save_and_load_round_trips() {
        let store = store();
        store.save_batch(&[replica("t1"), replica("t2")]).await.unwrap();
        let loaded = store.load(&ReplicaFilter::default()).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].patient_reference.as_deref(), Some("patient-xyz"));
    }

    #[tokio::test]
    async fn get_returns_none_for_missing() {
        let store = store();
        assert!(store.get(&CoreTaskId::new("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn storage_limit_enforced() {
        let store = InMemoryPersistence::new(
            Arc::new(StaticKeyProvider::new("k1", [1u8; 32])),
            "k1",
            10, // absurdly small
        );
        let err = store.save_batch(&[replica("t1")]).await.unwrap_err();
        assert!(matches!(err, StorageError::LimitExceeded { .. }));
    }

    #[tokio::test]
    async fn filter_by_assignee() {
        let store = store();
        let mut r = replica("t1");
        r.assignee = Some("nurse-1".into());
        store.save_batch(&[r]).await.unwrap();
        store.save_batch(&[replica("t2")]).await.unwrap();

        let filter = ReplicaFilter {
            assignee: Some("nurse-1".into()),
            ..Default::default()
        };
        let loaded = store.load(&filter).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, CoreTaskId::new("t1"));
    }
}
