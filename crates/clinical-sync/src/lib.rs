//! The Sync Orchestrator (C5): scheduling, batching, backoff, and
//! network-gated retry for replica synchronization.

pub mod backoff;
pub mod orchestrator;
pub mod state;

pub use backoff::{schedule_next, Backoff, NetworkQuality};
pub use orchestrator::{CancellationFlag, SyncOrchestrator};
pub use state::{transition, SyncEvent, SyncState};
