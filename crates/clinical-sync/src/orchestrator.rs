//! The Sync Orchestrator (C5, §4.5): drives one synchronization round —
//! drain the outbox, exchange with the backend, hand both sides to the
//! Conflict Resolver, persist, and report metrics. Grounded on the
//! teacher's `aura-anti-entropy::sync::anti_entropy` handler shape (a
//! struct holding shared state behind async-aware locks, with a narrow
//! effects trait for the network round-trip).

use crate::backoff::Backoff;
use crate::state::{transition, SyncEvent, SyncState};
use clinical_core::config::SyncConfig;
use clinical_core::effects::{
    AuditSink, MetricsSink, OutboxEffects, PersistenceEffects, SyncEffects, SyncEnvelope,
    SyncError, SyncMetrics, SyncOp,
};
use clinical_core::task::TaskReplica;
use clinical_core::{BatchId, ClinicalError, ClockMergePolicy, NodeId, TaskId, VectorClock};
use clinical_journal::{ConflictResolver, ResolverConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation flag threaded through a sync round; checked at
/// chunk boundaries rather than aborting a task outright (§5, §9 design note
/// on explicit cancellation over implicit task aborts).
#[derive(Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

/// Drives synchronization rounds for one node against one backend.
pub struct SyncOrchestrator<P, S, O> {
    state: RwLock<SyncState>,
    persistence: Arc<P>,
    sync_effects: Arc<S>,
    outbox: Arc<O>,
    resolver: ConflictResolver<P>,
    metrics_sink: Arc<dyn MetricsSink>,
    node_id: NodeId,
    config: SyncConfig,
    backoff: Backoff,
}

impl<P, S, O> SyncOrchestrator<P, S, O>
where
    P: PersistenceEffects,
    S: SyncEffects,
    O: OutboxEffects,
{
    pub fn new(
        node_id: NodeId,
        config: SyncConfig,
        persistence: Arc<P>,
        sync_effects: Arc<S>,
        outbox: Arc<O>,
        audit: Arc<dyn AuditSink>,
        metrics_sink: Arc<dyn MetricsSink>,
        merge_policy: ClockMergePolicy,
    ) -> Self {
        let resolver = ConflictResolver::new(
            persistence.clone(),
            audit,
            ResolverConfig {
                chunk_size: config.batch_size,
                chunk_deadline: Duration::from_millis(config.per_merge_timeout_ms),
            },
            merge_policy,
        );
        let backoff = Backoff::new(
            Duration::from_millis(config.retry_base_ms),
            Duration::from_millis(config.retry_cap_ms),
        );
        Self {
            state: RwLock::new(SyncState::Idle),
            persistence,
            sync_effects,
            outbox,
            resolver,
            metrics_sink,
            node_id,
            config,
            backoff,
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    fn apply_event(&self, event: SyncEvent) -> Result<SyncState, ClinicalError> {
        let mut guard = self.state.write();
        match transition(*guard, event) {
            Some(next) => {
                tracing::info!(from = ?*guard, to = ?next, ?event, "sync_state_transition");
                *guard = next;
                Ok(next)
            }
            None => Err(ClinicalError::SyncInProgress),
        }
    }

    /// Mark the network as reachable again after an `Offline` period,
    /// auto-starting the next round per the state diagram.
    pub fn reconnect(&self) -> Result<(), ClinicalError> {
        self.apply_event(SyncEvent::Reconnect).map(|_| ())
    }

    /// Reset a `Failed` orchestrator back to `Idle` after operator action.
    pub fn manual_reset(&self) -> Result<(), ClinicalError> {
        self.apply_event(SyncEvent::ManualReset).map(|_| ())
    }

    /// Delay to wait before the next retry attempt, given the current
    /// `Retrying(n)` state. Returns `None` if not currently retrying.
    pub fn retry_delay(&self) -> Option<Duration> {
        match *self.state.read() {
            SyncState::Retrying(n) => Some(self.backoff.delay_for(n)),
            _ => None,
        }
    }

    /// Run one synchronization round. Refuses with
    /// [`ClinicalError::SyncInProgress`] unless currently `Idle`.
    pub async fn start_sync(
        &self,
        local: &HashMap<TaskId, TaskReplica>,
        network_available: bool,
        cancel: &CancellationFlag,
        now_ns: u64,
    ) -> Result<SyncMetrics, ClinicalError> {
        self.apply_event(SyncEvent::Start)?;

        if !network_available {
            self.apply_event(SyncEvent::NetworkDown)?;
            return Err(ClinicalError::network("network unavailable"));
        }

        let start = std::time::Instant::now();
        let result = self.run_round(local, cancel, now_ns).await;

        match result {
            Ok(mut metrics) => {
                self.apply_event(SyncEvent::Success)?;
                metrics.latency_ms = start.elapsed().as_millis() as u64;
                self.metrics_sink.record_sync(&metrics);
                Ok(metrics)
            }
            Err(err) => {
                let next = self.apply_event(SyncEvent::Failure)?;
                if let SyncState::Retrying(n) = next {
                    if n >= self.config.max_attempts {
                        let _ = self.apply_event(SyncEvent::Exhausted);
                    }
                }
                tracing::warn!(error = %err, elapsed_ms = start.elapsed().as_millis() as u64, "sync_round_failed");
                self.metrics_sink.record_sync(&SyncMetrics {
                    latency_ms: start.elapsed().as_millis() as u64,
                    operations_sent: 0,
                    operations_received: 0,
                    conflicts_resolved: 0,
                    success: false,
                });
                Err(err)
            }
        }
    }

    async fn run_round(
        &self,
        local: &HashMap<TaskId, TaskReplica>,
        cancel: &CancellationFlag,
        now_ns: u64,
    ) -> Result<SyncMetrics, ClinicalError> {
        if cancel.is_cancelled() {
            return Err(ClinicalError::Cancelled {
                operation: "start_sync".to_string(),
            });
        }

        let pending = self
            .outbox
            .take_pending(self.config.batch_size)
            .await
            .map_err(sync_to_clinical)?;
        let since_vector = VectorClock::new();

        let envelope = SyncEnvelope {
            batch_id: BatchId::generate(),
            node_id: self.node_id.clone(),
            operations: pending.clone(),
            since_vector,
        };

        let deadline = Duration::from_millis(self.config.per_operation_timeout_ms);
        let response = tokio::time::timeout(deadline, self.sync_effects.exchange(envelope))
            .await
            .map_err(|_| {
                ClinicalError::Timeout {
                    operation: "sync_exchange".to_string(),
                    elapsed_ms: deadline.as_millis() as u64,
                }
            })?
            .map_err(sync_to_clinical)?;

        if cancel.is_cancelled() {
            return Err(ClinicalError::Cancelled {
                operation: "start_sync".to_string(),
            });
        }

        let remote_replicas: Vec<TaskReplica> = response
            .operations
            .iter()
            .map(|op| match op {
                SyncOp::Upsert(r) => r.clone(),
                SyncOp::Delete(r) => r.clone(),
            })
            .collect();

        let outcome = self
            .resolver
            .resolve_batch(remote_replicas, local, now_ns)
            .await?;

        let synced_ids: Vec<TaskId> = pending
            .iter()
            .map(|op| match op {
                SyncOp::Upsert(r) => r.id.clone(),
                SyncOp::Delete(r) => r.id.clone(),
            })
            .collect();
        self.outbox
            .mark_synced(&synced_ids)
            .await
            .map_err(sync_to_clinical)?;

        Ok(SyncMetrics {
            // stamped by the caller once the round has fully returned (`start_sync`)
            latency_ms: 0,
            operations_sent: pending.len(),
            operations_received: outcome.merged.len(),
            conflicts_resolved: outcome
                .conflict_log
                .iter()
                .filter(|c| !c.is_empty())
                .count(),
            success: !outcome.timed_out,
        })
    }
}

fn sync_to_clinical(err: SyncError) -> ClinicalError {
    match err {
        SyncError::InProgress => ClinicalError::SyncInProgress,
        SyncError::NetworkDown => ClinicalError::network("network down"),
        SyncError::Timeout { elapsed_ms } => ClinicalError::Timeout {
            operation: "sync_exchange".to_string(),
            elapsed_ms,
        },
        SyncError::Rejected { batch_id, reason } => {
            ClinicalError::invalid(format!("batch {batch_id} rejected: {reason}"))
        }
        SyncError::Transport(msg) => ClinicalError::network(msg),
    }
}
