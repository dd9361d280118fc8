//! Vector clock: causality tracking across replica nodes.
//!
//! Mirrors the shape of a mapping from node identifier to a monotonically
//! increasing counter, plus a physical timestamp and a merge-policy tag
//! (§3, §4.1 of the spec). Uses a `Single`/`Multiple` representation so the
//! common case — a task edited by one or two devices — avoids allocating a
//! `BTreeMap`.

use crate::errors::ClinicalError;
use crate::ids::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Default number of entries a vector clock retains before `prune` kicks in.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 1000;

/// Tie-break policy used by last-write-wins merges that consult the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMergePolicy {
    /// Pure last-write-wins: physical timestamp only, clock ignored.
    PureLww,
    /// Clock dominance first, physical timestamp second, node id last.
    /// The default per the spec's resolution of its tie-breaking Open Question.
    ClockThenTimestamp,
}

impl Default for ClockMergePolicy {
    fn default() -> Self {
        ClockMergePolicy::ClockThenTimestamp
    }
}

/// Result of comparing two vector clocks under the classical Lamport partial order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// `self` happened before `other`.
    Before,
    /// `self` happened after `other`.
    After,
    /// Both clocks are identical.
    Equal,
    /// Neither dominates: concurrent writes.
    Concurrent,
}

/// Vector clock: node id -> counter, plus physical timestamp and merge policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: ClockCounters,
    /// Nanosecond-resolution wall-clock timestamp, updated on every `increment`/`merge`.
    pub physical_timestamp_ns: u64,
    /// Tie-break policy consulted by LWW merges (field-level, see `clinical-journal`).
    pub merge_policy: ClockMergePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum ClockCounters {
    Empty,
    Single { node: NodeId, counter: u64 },
    Multiple(BTreeMap<NodeId, u64>),
}

impl Default for VectorClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorClock {
    /// An empty clock with no entries.
    pub fn new() -> Self {
        Self {
            counters: ClockCounters::Empty,
            physical_timestamp_ns: 0,
            merge_policy: ClockMergePolicy::default(),
        }
    }

    /// Counter recorded for `node`, or 0 if the node has no entry (per the
    /// "missing entries treated as 0" edge case in §4.1).
    pub fn get(&self, node: &NodeId) -> u64 {
        match &self.counters {
            ClockCounters::Empty => 0,
            ClockCounters::Single { node: n, counter } if n == node => *counter,
            ClockCounters::Single { .. } => 0,
            ClockCounters::Multiple(map) => map.get(node).copied().unwrap_or(0),
        }
    }

    /// Number of distinct node entries.
    pub fn len(&self) -> usize {
        match &self.counters {
            ClockCounters::Empty => 0,
            ClockCounters::Single { .. } => 1,
            ClockCounters::Multiple(map) => map.len(),
        }
    }

    /// Whether the clock has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over `(node, counter)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        ClockIter::new(&self.counters)
    }

    /// Raise `node`'s counter by one and stamp the physical timestamp to `now_ns`.
    ///
    /// Fails with [`ClinicalError::Invalid`] if `node` is empty, and with
    /// [`ClinicalError::VectorClockOverflow`] if the counter would overflow.
    pub fn increment(&mut self, node: &NodeId, now_ns: u64) -> Result<(), ClinicalError> {
        if node.is_empty() {
            return Err(ClinicalError::invalid("node identifier must not be empty"));
        }
        let next = self
            .get(node)
            .checked_add(1)
            .ok_or_else(|| ClinicalError::VectorClockOverflow {
                node: node.to_string(),
            })?;
        self.set(node.clone(), next);
        self.physical_timestamp_ns = now_ns;
        Ok(())
    }

    fn set(&mut self, node: NodeId, counter: u64) {
        match &mut self.counters {
            ClockCounters::Empty => {
                self.counters = ClockCounters::Single { node, counter };
            }
            ClockCounters::Single {
                node: cur,
                counter: cur_counter,
            } => {
                if *cur == node {
                    *cur_counter = counter;
                } else {
                    let mut map = BTreeMap::new();
                    map.insert(cur.clone(), *cur_counter);
                    map.insert(node, counter);
                    self.counters = ClockCounters::Multiple(map);
                }
            }
            ClockCounters::Multiple(map) => {
                map.insert(node, counter);
            }
        }
    }

    /// Pointwise maximum of two clocks; timestamp becomes the max of both.
    /// The result dominates both inputs.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        for (node, counter) in other.iter() {
            let merged = result.get(node).max(*counter);
            result.set(node.clone(), merged);
        }
        result.physical_timestamp_ns = self
            .physical_timestamp_ns
            .max(other.physical_timestamp_ns);
        result
    }

    /// Classical Lamport comparison: every entry in `self` <= `other` (and at
    /// least one strictly less) means `Before`; the symmetric case is `After`;
    /// all equal is `Equal`; anything else is `Concurrent`.
    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut self_le_other = true;
        let mut other_le_self = true;
        let mut any_strict_less = false;
        let mut any_strict_greater = false;

        for (node, &c) in self.iter() {
            let o = other.get(node);
            match c.cmp(&o) {
                Ordering::Greater => {
                    self_le_other = false;
                    any_strict_greater = true;
                }
                Ordering::Less => any_strict_less = true,
                Ordering::Equal => {}
            }
        }
        for (node, &o) in other.iter() {
            let c = self.get(node);
            if o > c {
                other_le_self = false;
                any_strict_less = true;
            } else if o < c {
                any_strict_greater = true;
            }
        }

        match (self_le_other, other_le_self) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (false, false) => {
                debug_assert!(any_strict_less || any_strict_greater || self.len() != other.len());
                CausalOrder::Concurrent
            }
        }
    }

    /// Whether `self` causally dominates `other` (is `After` or `Equal`).
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), CausalOrder::After | CausalOrder::Equal)
    }

    /// Retain the highest-counter half of entries, dropping the rest.
    ///
    /// Pruning is lossy: two pruned clocks may subsequently compare as
    /// `Concurrent` where one truthfully dominated the other (documented
    /// limitation, §4.1 and scenario S6). Returns `true` if pruning occurred.
    pub fn prune(&mut self, threshold: usize) -> bool {
        if self.len() <= threshold {
            return false;
        }
        let mut entries: Vec<(NodeId, u64)> = self
            .iter()
            .map(|(n, c)| (n.clone(), *c))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(threshold.max(1) / 2 + threshold.max(1) % 2);
        let mut map = BTreeMap::new();
        for (node, counter) in entries {
            map.insert(node, counter);
        }
        self.counters = if map.len() == 1 {
            let (node, counter) = map.into_iter().next().expect("len checked above");
            ClockCounters::Single { node, counter }
        } else {
            ClockCounters::Multiple(map)
        };
        tracing::warn!(
            remaining = self.len(),
            threshold,
            "vector_clock_prune: dropped low-counter entries, precision loss possible"
        );
        true
    }
}

enum ClockIter<'a> {
    Empty,
    Single {
        node: &'a NodeId,
        counter: &'a u64,
        yielded: bool,
    },
    Multiple(std::collections::btree_map::Iter<'a, NodeId, u64>),
}

impl<'a> ClockIter<'a> {
    fn new(counters: &'a ClockCounters) -> Self {
        match counters {
            ClockCounters::Empty => ClockIter::Empty,
            ClockCounters::Single { node, counter } => ClockIter::Single {
                node,
                counter,
                yielded: false,
            },
            ClockCounters::Multiple(map) => ClockIter::Multiple(map.iter()),
        }
    }
}

impl<'a> Iterator for ClockIter<'a> {
    type Item = (&'a NodeId, &'a u64);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ClockIter::Empty => None,
            ClockIter::Single {
                node,
                counter,
                yielded,
            } => {
                if *yielded {
                    None
                } else {
                    *yielded = true;
                    Some((node, counter))
                }
            }
            ClockIter::Multiple(iter) => iter.next(),
        }
    }
}
