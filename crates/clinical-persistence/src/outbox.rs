//! In-memory local outbox: operations waiting to be pushed to the backend
//! on the next sync round (§4.5). Entries are keyed by replica id so a
//! replica edited twice before syncing only ever sends its latest state.

use async_trait::async_trait;
use clinical_core::effects::{SyncError, SyncOp};
use clinical_core::ids::TaskId;
use parking_lot::Mutex;
use std::collections::VecDeque;

fn op_task_id(op: &SyncOp) -> TaskId {
    match op {
        SyncOp::Upsert(r) => r.id.clone(),
        SyncOp::Delete(r) => r.id.clone(),
    }
}

struct Entry {
    id: TaskId,
    op: SyncOp,
}

pub struct InMemoryOutbox {
    pending: Mutex<VecDeque<Entry>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue an operation, replacing any earlier queued op for the same
    /// replica so the outbox never sends a stale intermediate state.
    pub fn enqueue(&self, op: SyncOp) {
        let id = op_task_id(&op);
        let mut guard = self.pending.lock();
        if let Some(existing) = guard.iter_mut().find(|e| e.id == id) {
            existing.op = op;
        } else {
            guard.push_back(Entry { id, op });
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl clinical_core::effects::OutboxEffects for InMemoryOutbox {
    async fn take_pending(&self, max: usize) -> Result<Vec<SyncOp>, SyncError> {
        let guard = self.pending.lock();
        Ok(guard.iter().take(max).map(|e| e.op.clone()).collect())
    }

    async fn mark_synced(&self, ids: &[TaskId]) -> Result<(), SyncError> {
        let mut guard = self.pending.lock();
        guard.retain(|e| !ids.contains(&e.id));
        Ok(())
    }
}
