//! Effect traits: the pure interface boundary between algorithmic core and
//! I/O. Each trait has no implementation here — handlers live in the crate
//! that owns the concern (`clinical-persistence`, `clinical-sync`,
//! `clinical-emr`) or as an in-memory reference handler for tests, mirroring
//! the teacher's `StorageEffects`/`NetworkEffects`/`SyncEffects` split.

mod clock;
mod network;
mod persistence;
mod sync;

pub use clock::ClockEffects;
pub use network::{NetworkEffects, NetworkError};
pub use persistence::{AuditSink, PersistenceEffects, ReplicaFilter, StorageError, StorageStats};
pub use sync::{
    MetricsSink, OutboxEffects, SyncEffects, SyncEnvelope, SyncError, SyncMetrics, SyncOp,
    SyncResponse,
};
