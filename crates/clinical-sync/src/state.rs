//! The Sync Orchestrator's state machine (§4.5):
//!
//! ```text
//! idle --start--> syncing --success--> idle
//!                 |
//!                 +--network_down--> offline --reconnect--> idle (auto-start)
//!                 |
//!                 +--failure--> retrying(n) --exhausted--> failed --manual--> idle
//!                                  |
//!                                  +--backoff--> syncing
//! ```

use serde::{Deserialize, Serialize};

/// Current state of one [`crate::orchestrator::SyncOrchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Syncing,
    Offline,
    Retrying(u32),
    Failed,
}

impl SyncState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SyncState::Idle)
    }
}

/// The events that drive a [`SyncState`] transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    Start,
    Success,
    NetworkDown,
    Reconnect,
    Failure,
    BackoffElapsed,
    Exhausted,
    ManualReset,
}

/// Apply `event` to `state`, returning the next state, or `None` if the
/// event is not valid from `state` (the caller should treat this as a
/// `sync_in_progress`-style rejection rather than a panic).
pub fn transition(state: SyncState, event: SyncEvent) -> Option<SyncState> {
    use SyncEvent::*;
    use SyncState::*;

    match (state, event) {
        (Idle, Start) => Some(Syncing),
        (Syncing, Success) => Some(Idle),
        (Syncing, NetworkDown) => Some(Offline),
        (Offline, Reconnect) => Some(Syncing),
        (Syncing, Failure) => Some(Retrying(1)),
        (Retrying(n), Failure) => Some(Retrying(n + 1)),
        (Retrying(n), BackoffElapsed) => Some(Syncing).filter(|_| n > 0),
        (Retrying(_), Exhausted) => Some(Failed),
        (Failed, ManualReset) => Some(Idle),
        _ => None,
    }
}
