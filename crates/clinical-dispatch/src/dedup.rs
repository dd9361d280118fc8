//! At-least-once delivery dedup by `(replica.id, vector_clock_hash)`
//! (§4.10). Bounded by insertion order so the seen-set itself can't grow
//! without limit, the same eviction shape the teacher uses for its oplog
//! cache (`aura-anti-entropy::broadcast::BroadcasterHandler`).

use clinical_core::{TaskId, VectorClock};
use std::collections::{HashSet, VecDeque};

/// Deterministic digest of a vector clock's entries, used as the second
/// half of the dedup key so two deliveries of the same causal state
/// collapse to one even if the wire encoding differs byte-for-byte.
pub fn vector_clock_hash(clock: &VectorClock) -> u64 {
    let mut entries: Vec<(String, u64)> = clock
        .iter()
        .map(|(node, counter)| (node.as_str().to_string(), *counter))
        .collect();
    entries.sort();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    use std::hash::{Hash, Hasher};
    entries.hash(&mut hasher);
    hasher.finish()
}

/// A bounded set of `(replica.id, vector_clock_hash)` pairs already
/// processed, oldest evicted first once `capacity` is exceeded.
pub struct DedupWindow {
    seen: HashSet<(TaskId, u64)>,
    order: VecDeque<(TaskId, u64)>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `(id, hash)` as seen if it wasn't already; returns `true` if
    /// this call is the first time it's been observed (i.e. the caller
    /// should process it), `false` if it's a redelivery to be skipped.
    pub fn observe(&mut self, id: TaskId, hash: u64) -> bool {
        let key = (id, hash);
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinical_core::NodeId;

    #[test]
    fn redelivery_of_same_key_is_rejected() {
        let mut window = DedupWindow::new(10);
        let id = TaskId::new("t1");
        assert!(window.observe(id.clone(), 42));
        assert!(!window.observe(id, 42));
    }

    #[test]
    fn different_vector_clocks_are_distinct_keys() {
        let mut window = DedupWindow::new(10);
        let id = TaskId::new("t1");
        assert!(window.observe(id.clone(), 1));
        assert!(window.observe(id, 2));
    }

    #[test]
    fn capacity_evicts_oldest_entries() {
        let mut window = DedupWindow::new(2);
        window.observe(TaskId::new("t1"), 1);
        window.observe(TaskId::new("t2"), 1);
        window.observe(TaskId::new("t3"), 1);
        assert_eq!(window.len(), 2);
        // t1 was evicted, so it's treated as unseen again.
        assert!(window.observe(TaskId::new("t1"), 1));
    }

    #[test]
    fn vector_clock_hash_is_order_independent() {
        let mut a = VectorClock::new();
        a.increment(&NodeId::new("n1"), 1).unwrap();
        a.increment(&NodeId::new("n2"), 2).unwrap();
        let mut b = VectorClock::new();
        b.increment(&NodeId::new("n2"), 2).unwrap();
        b.increment(&NodeId::new("n1"), 1).unwrap();
        assert_eq!(vector_clock_hash(&a), vector_clock_hash(&b));
    }
}
