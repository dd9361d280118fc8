//! Local Persistence effect surface (C4, §4.4). Specialized to replicas and
//! audit entries rather than raw key/value blobs, following the shape of
//! the teacher's `StorageEffects` trait.

use crate::audit::AuditEntry;
use crate::ids::TaskId;
use crate::task::TaskReplica;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a [`PersistenceEffects`] implementation.
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("storage limit exceeded: {used_bytes} / {max_bytes} bytes")]
    LimitExceeded { used_bytes: u64, max_bytes: u64 },
    #[error("integrity check failed: stored checksum did not match")]
    DataCorruption,
    #[error("migration failed: {message}")]
    MigrationFailed { message: String },
    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("not found: {0}")]
    NotFound(String),
}

/// Usage statistics for the persistence backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub replica_count: usize,
    pub audit_entry_count: usize,
    pub used_bytes: u64,
    pub schema_version: u32,
}

/// A predicate over stored replicas, used by `load`. `None` fields are
/// wildcards.
#[derive(Debug, Clone, Default)]
pub struct ReplicaFilter {
    pub status: Option<crate::task::TaskStatus>,
    pub assignee: Option<String>,
    pub patient_reference: Option<String>,
}

/// Durable storage for replicas and the audit log (§4.4).
#[async_trait]
pub trait PersistenceEffects: Send + Sync {
    /// Persist a batch of replicas atomically; writes one audit entry per
    /// replica. Fails whole-batch on any single failure (no partial writes).
    async fn save_batch(&self, replicas: &[TaskReplica]) -> Result<(), StorageError>;

    /// Retrieve replicas matching `filter`, timeout-bounded by the caller.
    async fn load(&self, filter: &ReplicaFilter) -> Result<Vec<TaskReplica>, StorageError>;

    /// Fetch a single replica by id.
    async fn get(&self, id: &TaskId) -> Result<Option<TaskReplica>, StorageError>;

    /// Append an audit entry.
    async fn append_audit(&self, entry: AuditEntry) -> Result<(), StorageError>;

    /// Read back the audit log for a given replica, oldest first.
    async fn audit_for(&self, id: &TaskId) -> Result<Vec<AuditEntry>, StorageError>;

    /// Current usage statistics.
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Narrow write-only view onto the audit log, used by components (the
/// Conflict Resolver, the Verification Engine) that should not otherwise
/// touch replica storage.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), StorageError>;
}

#[async_trait]
impl<T: PersistenceEffects> AuditSink for T {
    async fn record(&self, entry: AuditEntry) -> Result<(), StorageError> {
        self.append_audit(entry).await
    }
}
