//! The message bus boundary (§4.10): an external collaborator per the
//! spec's §1 system diagram. `EventBus` is the pure trait a real Kafka/NATS
//! client would implement; [`InMemoryEventBus`] is the reference handler
//! used in tests, mirroring the teacher's `SyncEffects` split between a
//! narrow trait and an in-memory stand-in.

use async_trait::async_trait;
use clinical_core::task::TaskReplica;
use clinical_core::{NodeId, TaskId, VectorClock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// The four topics named in §4.10.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TopicEvent {
    TaskCreated(TaskReplica),
    TaskUpdated(TaskReplica),
    TaskDeleted(TaskId),
    SyncRequest { node_id: NodeId, since: VectorClock },
}

impl TopicEvent {
    /// The replica id this event is keyed by, used for dedup and for
    /// per-partition routing.
    pub fn replica_id(&self) -> Option<&TaskId> {
        match self {
            TopicEvent::TaskCreated(r) | TopicEvent::TaskUpdated(r) => Some(&r.id),
            TopicEvent::TaskDeleted(id) => Some(id),
            TopicEvent::SyncRequest { .. } => None,
        }
    }
}

/// A message as delivered by the bus, carrying the partition/offset
/// coordinates needed for ordered, at-least-once delivery (§4.10, §5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub partition: u32,
    pub offset: u64,
    pub event: TopicEvent,
}

/// Errors raised by an [`EventBus`] implementation.
#[derive(Debug, Error, Clone)]
pub enum DispatchError {
    #[error("not subscribed")]
    NotSubscribed,
    #[error("commit failed: partition {partition} offset {offset} not polled")]
    InvalidCommit { partition: u32, offset: u64 },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Durable group-id subscription over the four task/sync topics (§4.10).
/// `poll` returns messages in offset order per partition; `commit` advances
/// the durable read position only after the caller has fully processed a
/// message (merge + persist), so a crash before commit replays it.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn subscribe(&self, group_id: &str) -> Result<(), DispatchError>;

    async fn poll(&self, max: usize) -> Result<Vec<EventMessage>, DispatchError>;

    async fn commit(&self, partition: u32, offset: u64) -> Result<(), DispatchError>;
}

/// In-memory reference bus: a fixed number of partitions, each an ordered
/// queue of not-yet-committed messages. `publish` is test-only plumbing to
/// seed the queue; a real client would receive these from the network.
pub struct InMemoryEventBus {
    partitions: parking_lot::Mutex<Vec<VecDeque<EventMessage>>>,
    next_offset: parking_lot::Mutex<Vec<u64>>,
    subscribed: parking_lot::Mutex<bool>,
}

impl InMemoryEventBus {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partitions: parking_lot::Mutex::new((0..partition_count).map(|_| VecDeque::new()).collect()),
            next_offset: parking_lot::Mutex::new(vec![0; partition_count as usize]),
            subscribed: parking_lot::Mutex::new(false),
        }
    }

    /// Route `event` to a partition by hashing its replica id (or
    /// partition 0 for bus-wide events like `sync.request`), assigning the
    /// next offset for that partition.
    pub fn publish(&self, event: TopicEvent) -> (u32, u64) {
        let mut partitions = self.partitions.lock();
        let count = partitions.len() as u32;
        let partition = event
            .replica_id()
            .map(|id| (fnv1a(id.as_str()) % count.max(1)))
            .unwrap_or(0);

        let mut offsets = self.next_offset.lock();
        let offset = offsets[partition as usize];
        offsets[partition as usize] += 1;

        partitions[partition as usize].push_back(EventMessage {
            partition,
            offset,
            event,
        });
        (partition, offset)
    }

    pub fn pending_count(&self) -> usize {
        self.partitions.lock().iter().map(|q| q.len()).sum()
    }
}

/// Small non-cryptographic hash for partition routing; collisions just mean
/// two replica ids share a partition, which is fine since ordering is only
/// promised within a partition (§5).
fn fnv1a(s: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in s.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn subscribe(&self, _group_id: &str) -> Result<(), DispatchError> {
        *self.subscribed.lock() = true;
        Ok(())
    }

    async fn poll(&self, max: usize) -> Result<Vec<EventMessage>, DispatchError> {
        if !*self.subscribed.lock() {
            return Err(DispatchError::NotSubscribed);
        }
        let mut partitions = self.partitions.lock();
        let mut out = Vec::new();
        'outer: loop {
            let mut any = false;
            for queue in partitions.iter_mut() {
                if out.len() >= max {
                    break 'outer;
                }
                if let Some(msg) = queue.front().cloned() {
                    out.push(msg);
                    queue.pop_front();
                    any = true;
                }
            }
            if !any {
                break;
            }
        }
        Ok(out)
    }

    /// No-op: this in-memory bus pops on `poll` rather than tracking a
    /// separate committed offset, since there is no real durable log to
    /// advance. A Kafka/NATS-backed `EventBus` would persist the offset
    /// here instead.
    async fn commit(&self, _partition: u32, _offset: u64) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinical_core::task::TaskReplica;

    fn replica(id: &str) -> TaskReplica {
        TaskReplica::new(TaskId::new(id), "Draw blood", None)
    }

    #[tokio::test]
    async fn publish_then_poll_round_trips() {
        let bus = InMemoryEventBus::new(4);
        bus.subscribe("group-1").await.unwrap();
        bus.publish(TopicEvent::TaskCreated(replica("t1")));
        let polled = bus.poll(10).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert!(matches!(&polled[0].event, TopicEvent::TaskCreated(r) if r.id == TaskId::new("t1")));
    }

    #[tokio::test]
    async fn poll_without_subscribe_errs() {
        let bus = InMemoryEventBus::new(2);
        assert!(matches!(bus.poll(1).await, Err(DispatchError::NotSubscribed)));
    }

    #[tokio::test]
    async fn same_replica_id_routes_to_same_partition() {
        let bus = InMemoryEventBus::new(8);
        let (p1, _) = bus.publish(TopicEvent::TaskCreated(replica("same-id")));
        let (p2, _) = bus.publish(TopicEvent::TaskUpdated(replica("same-id")));
        assert_eq!(p1, p2);
    }
}
