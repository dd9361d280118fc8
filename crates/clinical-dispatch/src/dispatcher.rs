//! Ties the bus, dedup window, inbound queue, and outbound rate limiter
//! together into one consume loop (§4.10): poll, dedup, admit, hand to a
//! handler that merges + persists, commit only on success.

use crate::bus::{DispatchError, EventBus, EventMessage, TopicEvent};
use crate::dedup::{vector_clock_hash, DedupWindow};
use crate::queue::InboundQueue;
use crate::ratelimit::TokenBucket;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// What the dispatcher does with a de-duplicated event: invoke the sync
/// and/or verification paths (C5/C8/C9), composed elsewhere. Kept as a
/// narrow trait so `clinical-dispatch` doesn't need a dependency on every
/// downstream crate to be testable in isolation.
#[async_trait]
pub trait TaskEventHandler: Send + Sync {
    async fn handle(&self, event: &TopicEvent, now_ns: u64) -> Result<(), String>;
}

/// Drives one consume-dispatch-commit cycle per `run_once` call (§4.10,
/// §5). A long-running process calls `run_once` in a loop with its own
/// pacing; this type owns no background task so it stays deterministic to
/// test.
pub struct EventDispatcher<B, H> {
    bus: Arc<B>,
    handler: H,
    dedup: Mutex<DedupWindow>,
    queue: InboundQueue,
    outbound: TokenBucket,
}

impl<B: EventBus, H: TaskEventHandler> EventDispatcher<B, H> {
    pub fn new(
        bus: Arc<B>,
        handler: H,
        dedup_capacity: usize,
        inbound_capacity: usize,
        outbound_ops_per_s: u32,
        now_ns: u64,
    ) -> Self {
        Self {
            bus,
            handler,
            dedup: Mutex::new(DedupWindow::new(dedup_capacity)),
            queue: InboundQueue::new(inbound_capacity),
            outbound: TokenBucket::new(outbound_ops_per_s, now_ns),
        }
    }

    pub async fn subscribe(&self, group_id: &str) -> Result<(), DispatchError> {
        self.bus.subscribe(group_id).await
    }

    /// Outbound admission check for a batch of `count` sync operations,
    /// gating the Sync Orchestrator's backend exchange (§5 "Outbound sync
    /// batches respect a token bucket of 1000 operations/s").
    pub fn admit_outbound(&self, count: u32, now_ns: u64) -> bool {
        self.outbound.try_acquire(count, now_ns)
    }

    pub fn pending_permits(&self) -> usize {
        self.queue.available_permits()
    }

    /// Poll up to `max` messages, subject to the inbound queue's free
    /// capacity (§5 backpressure: pause consumption once the queue is
    /// full), dedup, and dispatch each to the handler. Returns the number
    /// of events actually processed (post-dedup); redeliveries and
    /// messages skipped due to backpressure don't count.
    pub async fn run_once(&self, max: usize, now_ns: u64) -> Result<usize, DispatchError> {
        let available = self.queue.available_permits().min(max);
        if available == 0 {
            tracing::warn!("inbound_queue_full: pausing consumption");
            return Ok(0);
        }

        let messages = self.bus.poll(available).await?;
        let mut processed = 0;

        for message in messages {
            let admitted = self.queue.admit(message).await;
            let EventMessage { partition, offset, event } = admitted.message;

            let dedup_key = dedup_key_for(&event);
            let is_new = match dedup_key {
                Some((id, hash)) => self.dedup.lock().observe(id, hash),
                None => true,
            };
            if !is_new {
                tracing::debug!(partition, offset, "dedup_skip: redelivered event");
                self.bus.commit(partition, offset).await?;
                continue;
            }

            match self.handler.handle(&event, now_ns).await {
                Ok(()) => {
                    self.bus.commit(partition, offset).await?;
                    processed += 1;
                }
                Err(err) => {
                    // Offset deliberately left uncommitted: the bus will
                    // redeliver this message on the next poll.
                    tracing::warn!(partition, offset, error = %err, "dispatch_failed, will replay");
                }
            }
        }

        Ok(processed)
    }
}

fn dedup_key_for(event: &TopicEvent) -> Option<(clinical_core::TaskId, u64)> {
    let id = event.replica_id()?.clone();
    let clock = match event {
        TopicEvent::TaskCreated(r) | TopicEvent::TaskUpdated(r) => &r.vector_clock,
        TopicEvent::TaskDeleted(_) | TopicEvent::SyncRequest { .. } => {
            return Some((id, 0));
        }
    };
    Some((id, vector_clock_hash(clock)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use clinical_core::task::TaskReplica;
    use clinical_core::TaskId;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TaskEventHandler for CountingHandler {
        async fn handle(&self, _event: &TopicEvent, _now_ns: u64) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err("merge failed".into());
            }
            Ok(())
        }
    }

    fn replica(id: &str) -> TaskReplica {
        TaskReplica::new(TaskId::new(id), "Draw blood", None)
    }

    #[tokio::test]
    async fn processes_published_events_once() {
        let bus = Arc::new(InMemoryEventBus::new(4));
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        };
        let dispatcher = EventDispatcher::new(bus.clone(), handler, 100, 100, 1000, 0);
        dispatcher.subscribe("group-1").await.unwrap();
        bus.publish(TopicEvent::TaskCreated(replica("t1")));
        bus.publish(TopicEvent::TaskCreated(replica("t2")));

        let processed = dispatcher.run_once(10, 0).await.unwrap();
        assert_eq!(processed, 2);
    }

    #[tokio::test]
    async fn redelivered_event_is_deduped() {
        let bus = Arc::new(InMemoryEventBus::new(1));
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        };
        let dispatcher = EventDispatcher::new(bus.clone(), handler, 100, 100, 1000, 0);
        dispatcher.subscribe("group-1").await.unwrap();

        let event = TopicEvent::TaskCreated(replica("t1"));
        bus.publish(event.clone());
        dispatcher.run_once(10, 0).await.unwrap();

        bus.publish(event);
        let processed = dispatcher.run_once(10, 0).await.unwrap();
        assert_eq!(processed, 0, "redelivery of the same (id, clock) must be deduped");
    }

    #[tokio::test]
    async fn outbound_bucket_gates_batches() {
        let bus = Arc::new(InMemoryEventBus::new(1));
        let handler = CountingHandler {
            calls: AtomicU32::new(0),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        };
        let dispatcher = EventDispatcher::new(bus, handler, 100, 100, 10, 0);
        assert!(dispatcher.admit_outbound(10, 0));
        assert!(!dispatcher.admit_outbound(1, 0));
    }
}
