//! Sync Orchestrator effect surface (C5, §4.5): the backend round-trip and
//! the metrics it reports on success. Mirrors the shape of the teacher's
//! `SyncEffects` trait and `AntiEntropyConfig`/metrics pairing.

use crate::clock::VectorClock;
use crate::ids::{BatchId, NodeId};
use crate::task::TaskReplica;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a [`SyncEffects`] implementation.
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    #[error("sync already in progress")]
    InProgress,
    #[error("network unavailable")]
    NetworkDown,
    #[error("sync timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("backend rejected batch {batch_id}: {reason}")]
    Rejected { batch_id: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// One outgoing change to a replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncOp {
    Upsert(TaskReplica),
    Delete(TaskReplica),
}

/// The wire envelope exchanged with the backend (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub batch_id: BatchId,
    pub node_id: NodeId,
    pub operations: Vec<SyncOp>,
    pub since_vector: VectorClock,
}

/// The backend's response: its own pending operations plus its current
/// vector-clock snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub operations: Vec<SyncOp>,
    pub server_vector: VectorClock,
}

/// Backend round-trip used by the Sync Orchestrator. A real implementation
/// sends `envelope` over HTTPS; the in-memory reference handler used in
/// tests just loops a peer's queue back.
#[async_trait]
pub trait SyncEffects: Send + Sync {
    async fn exchange(&self, envelope: SyncEnvelope) -> Result<SyncResponse, SyncError>;
}

/// Counters recorded after each `start_sync` attempt, mirroring the
/// teacher's `SyncMetrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub latency_ms: u64,
    pub operations_sent: usize,
    pub operations_received: usize,
    pub conflicts_resolved: usize,
    pub success: bool,
}

/// Where [`SyncMetrics`] are reported; no concrete exposition (e.g.
/// Prometheus) is implemented here, only the boundary.
pub trait MetricsSink: Send + Sync {
    fn record_sync(&self, metrics: &SyncMetrics);
}

/// The local outbox of not-yet-synced operations, and the acknowledgement
/// path once a round has confirmed the backend received them. Kept
/// separate from [`PersistenceEffects`](crate::effects::PersistenceEffects)
/// since not every persistence backend needs outbox tracking (e.g. a
/// read-only replica).
#[async_trait]
pub trait OutboxEffects: Send + Sync {
    /// Drain up to `max` pending operations without removing them from the
    /// outbox; they are cleared only after `mark_synced`.
    async fn take_pending(&self, max: usize) -> Result<Vec<SyncOp>, SyncError>;

    /// Remove the named replicas from the outbox after a successful round.
    async fn mark_synced(&self, ids: &[crate::ids::TaskId]) -> Result<(), SyncError>;
}
