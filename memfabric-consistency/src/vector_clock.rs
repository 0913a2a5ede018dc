//! Version vectors for causality tracking.
//!
//! A version vector records, per node, how many writes that node has made
//! to one key and when it last did. Comparing two vectors tells whether one
//! view of the key causally includes the other or whether they diverged.
//!
//! Use cases:
//! - Detecting concurrent writes to the same key from different principals
//! - Choosing between "take the newer side" and "merge" during sync

use memfabric_types::Millis;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Causality relationship between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CausalOrder {
    /// First vector happened before second.
    Before,
    /// First vector happened after second.
    After,
    /// Neither includes the other.
    Concurrent,
    /// Identical counters.
    Equal,
}

/// One node's slot in a version vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    pub counter: u64,
    /// Wall-clock time of the node's latest write. Informational; never
    /// consulted for ordering.
    pub timestamp: Millis,
}

/// A per-key version vector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionVector {
    clocks: BTreeMap<String, ClockEntry>,
}

impl VersionVector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a vector with a single node at counter 0.
    #[must_use]
    pub fn for_node(node: impl Into<String>) -> Self {
        let mut clocks = BTreeMap::new();
        clocks.insert(node.into(), ClockEntry::default());
        Self { clocks }
    }

    /// Returns the counter for a node (0 if not present).
    #[must_use]
    pub fn get(&self, node: &str) -> u64 {
        self.clocks.get(node).map_or(0, |e| e.counter)
    }

    /// Returns a node's full slot.
    #[must_use]
    pub fn entry(&self, node: &str) -> Option<&ClockEntry> {
        self.clocks.get(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &ClockEntry)> {
        self.clocks.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Records a write by `node` at `now` and returns its new counter.
    pub fn increment(&mut self, node: &str, now: Millis) -> u64 {
        let entry = self.clocks.entry(node.to_string()).or_default();
        entry.counter += 1;
        entry.timestamp = entry.timestamp.max(now);
        entry.counter
    }

    /// Raises a node's counter to `counter` if it is behind.
    pub fn update(&mut self, node: &str, counter: u64, timestamp: Millis) {
        let entry = self.clocks.entry(node.to_string()).or_default();
        if counter > entry.counter {
            entry.counter = counter;
        }
        entry.timestamp = entry.timestamp.max(timestamp);
    }

    /// Merges another vector into this one, taking the per-node maximum.
    ///
    /// Commutative, associative and idempotent.
    pub fn merge(&mut self, other: &Self) {
        for (node, theirs) in &other.clocks {
            let ours = self.clocks.entry(node.clone()).or_default();
            ours.counter = ours.counter.max(theirs.counter);
            ours.timestamp = ours.timestamp.max(theirs.timestamp);
        }
    }

    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compares counters to determine causal ordering.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let mut self_covers = true;
        let mut other_covers = true;

        let nodes: BTreeSet<&str> = self
            .clocks
            .keys()
            .chain(other.clocks.keys())
            .map(String::as_str)
            .collect();

        for node in nodes {
            let ours = self.get(node);
            let theirs = other.get(node);
            if ours < theirs {
                self_covers = false;
            }
            if theirs < ours {
                other_covers = false;
            }
        }

        match (self_covers, other_covers) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    #[must_use]
    pub fn is_before(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::After
    }

    #[must_use]
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// True if this vector is `>=` the other for every node.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(self.compare(other), CausalOrder::After | CausalOrder::Equal)
    }

    /// True if this vector is `>=` everywhere and `>` somewhere.
    #[must_use]
    pub fn strictly_dominates(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::After
    }
}

impl PartialEq for VersionVector {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Equal
    }
}

impl Eq for VersionVector {}
