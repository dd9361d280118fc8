//! Bounded inbound queue (§4.10, §5 "Backpressure"): a
//! `tokio::sync::Semaphore`-backed admission gate so the dispatcher pauses
//! consuming from the bus once `capacity` messages are in flight, rather
//! than buffering without limit.

use crate::bus::EventMessage;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Default inbound buffer size (§5: "bounded buffer (default 2048
/// messages)").
pub const DEFAULT_CAPACITY: usize = 2048;

pub struct InboundQueue {
    admission: Arc<Semaphore>,
    capacity: usize,
}

/// A message paired with the permit that admitted it; dropping the guard
/// releases the slot back to the queue, which the dispatcher does once the
/// message has been merged and persisted (and its offset committed).
pub struct Admitted<'a> {
    pub message: EventMessage,
    _permit: SemaphorePermit<'a>,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            admission: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently free; `0` means the dispatcher should
    /// pause polling the bus until a permit is released.
    pub fn available_permits(&self) -> usize {
        self.admission.available_permits()
    }

    /// Block until a slot is free, then admit `message`. The returned guard
    /// must be held for the full duration of processing; dropping it frees
    /// the slot.
    pub async fn admit(&self, message: EventMessage) -> Admitted<'_> {
        let permit = self
            .admission
            .acquire()
            .await
            .expect("admission semaphore is never closed");
        Admitted {
            message,
            _permit: permit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TopicEvent;
    use clinical_core::TaskId;

    fn message(offset: u64) -> EventMessage {
        EventMessage {
            partition: 0,
            offset,
            event: TopicEvent::TaskDeleted(TaskId::new("t1")),
        }
    }

    #[tokio::test]
    async fn admitting_consumes_a_permit_until_dropped() {
        let queue = InboundQueue::new(1);
        assert_eq!(queue.available_permits(), 1);
        let admitted = queue.admit(message(0)).await;
        assert_eq!(queue.available_permits(), 0);
        drop(admitted);
        assert_eq!(queue.available_permits(), 1);
    }

    #[tokio::test]
    async fn second_admission_waits_for_the_first_to_release() {
        let queue = Arc::new(InboundQueue::new(1));
        let first = queue.admit(message(0)).await;

        let queue2 = queue.clone();
        let waiter = tokio::spawn(async move {
            let _second = queue2.admit(message(1)).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(first);
        waiter.await.unwrap();
    }
}
