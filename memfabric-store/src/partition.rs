//! Partition accounting.
//!
//! The controller knows which partition each key belongs to and how many
//! bytes were charged for it. It never sees payloads. Every key is a member
//! of at most one partition; moving a key subtracts the bytes recorded for
//! its previous membership, so `aggregate_size` always equals the sum of
//! the member sizes.

use memfabric_types::Millis;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Partition used when the caller names none.
pub const DEFAULT_PARTITION: &str = "default";

/// Priority given to partitions created on first use.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Partitions every controller starts with. Lower priority is evicted first.
pub const DEFAULT_PARTITIONS: &[(&str, u8)] = &[
    ("temporary", 1),
    ("cache", 2),
    (DEFAULT_PARTITION, DEFAULT_PRIORITY),
    ("shared", 7),
    ("critical", 10),
];

/// A named subdivision of a store's keyspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    pub aggregate_size: u64,
    pub entry_count: usize,
    pub max_size: Option<u64>,
    pub priority: u8,
    pub created_at: Millis,
    pub last_accessed: Millis,
    pub member_keys: HashSet<String>,
}

impl Partition {
    fn new(id: impl Into<String>, priority: u8, max_size: Option<u64>, now: Millis) -> Self {
        Self {
            id: id.into(),
            aggregate_size: 0,
            entry_count: 0,
            max_size,
            priority,
            created_at: now,
            last_accessed: now,
            member_keys: HashSet::new(),
        }
    }

    /// Bytes still available under `max_size`, if the partition has one.
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        self.max_size.map(|max| max.saturating_sub(self.aggregate_size))
    }
}

/// A partition proposed for eviction, with its member keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub partition_id: String,
    pub priority: u8,
    pub aggregate_size: u64,
    pub keys: Vec<String>,
}

/// Tracks membership and byte accounting for all partitions of one store.
#[derive(Debug, Clone)]
pub struct PartitionController {
    partitions: HashMap<String, Partition>,
    /// key → (partition id, charged bytes)
    membership: HashMap<String, (String, u64)>,
}

impl Default for PartitionController {
    fn default() -> Self {
        Self::new(0)
    }
}

impl PartitionController {
    /// Creates a controller with the [`DEFAULT_PARTITIONS`] declared.
    #[must_use]
    pub fn new(now: Millis) -> Self {
        let mut controller = Self::empty();
        for (id, priority) in DEFAULT_PARTITIONS {
            controller.declare(*id, *priority, None, now);
        }
        controller
    }

    /// Creates a controller with no partitions.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            partitions: HashMap::new(),
            membership: HashMap::new(),
        }
    }

    /// Declares a partition, or updates priority and budget of an existing one.
    pub fn declare(
        &mut self,
        id: impl Into<String>,
        priority: u8,
        max_size: Option<u64>,
        now: Millis,
    ) {
        let id = id.into();
        match self.partitions.get_mut(&id) {
            Some(p) => {
                p.priority = priority;
                p.max_size = max_size;
            }
            None => {
                self.partitions
                    .insert(id.clone(), Partition::new(id, priority, max_size, now));
            }
        }
    }

    /// Charges `size` bytes for `key` to `partition_id`.
    ///
    /// A key already charged elsewhere (or to the same partition) is moved:
    /// its previously recorded bytes are released first. Unknown partitions
    /// are created with [`DEFAULT_PRIORITY`].
    pub fn add_to_partition(&mut self, partition_id: &str, key: &str, size: u64, now: Millis) {
        self.remove_from_partition(key);

        let partition = self
            .partitions
            .entry(partition_id.to_string())
            .or_insert_with(|| {
                debug!("creating partition {partition_id} on first use");
                Partition::new(partition_id, DEFAULT_PRIORITY, None, now)
            });
        partition.aggregate_size += size;
        partition.entry_count += 1;
        partition.last_accessed = now;
        partition.member_keys.insert(key.to_string());

        self.membership
            .insert(key.to_string(), (partition_id.to_string(), size));
    }

    /// Releases `key` from its partition. Returns the partition and the
    /// bytes that had been charged, or `None` if the key was not a member.
    pub fn remove_from_partition(&mut self, key: &str) -> Option<(String, u64)> {
        let (partition_id, size) = self.membership.remove(key)?;
        if let Some(partition) = self.partitions.get_mut(&partition_id) {
            partition.aggregate_size = partition.aggregate_size.saturating_sub(size);
            partition.entry_count = partition.entry_count.saturating_sub(1);
            partition.member_keys.remove(key);
        }
        Some((partition_id, size))
    }

    /// Records an access to `key`'s partition.
    pub fn touch(&mut self, key: &str, now: Millis) {
        if let Some((partition_id, _)) = self.membership.get(key) {
            if let Some(partition) = self.partitions.get_mut(partition_id) {
                partition.last_accessed = now;
            }
        }
    }

    /// Returns the partition `key` belongs to.
    #[must_use]
    pub fn partition_of(&self, key: &str) -> Option<&str> {
        self.membership.get(key).map(|(p, _)| p.as_str())
    }

    /// Returns the bytes charged for `key`.
    #[must_use]
    pub fn charged_size(&self, key: &str) -> Option<u64> {
        self.membership.get(key).map(|(_, size)| *size)
    }

    /// Returns a partition's state.
    #[must_use]
    pub fn get_partition_info(&self, partition_id: &str) -> Option<&Partition> {
        self.partitions.get(partition_id)
    }

    /// Iterates all partitions.
    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    /// Aggregate bytes per partition.
    #[must_use]
    pub fn sizes(&self) -> BTreeMap<String, u64> {
        self.partitions
            .values()
            .map(|p| (p.id.clone(), p.aggregate_size))
            .collect()
    }

    /// Sum of all partition aggregates.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.partitions.values().map(|p| p.aggregate_size).sum()
    }

    /// Partitions to evict from, in order, until their combined aggregate
    /// covers `required_space`.
    ///
    /// Ordered by `(priority, last_accessed)` ascending. Empty partitions
    /// are skipped. If all partitions together cannot cover the request,
    /// every non-empty partition is returned.
    #[must_use]
    pub fn eviction_candidates(&self, required_space: u64) -> Vec<EvictionCandidate> {
        let mut ordered: Vec<&Partition> = self
            .partitions
            .values()
            .filter(|p| p.entry_count > 0)
            .collect();
        ordered.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.last_accessed.cmp(&b.last_accessed))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut covered = 0u64;
        let mut candidates = Vec::new();
        for partition in ordered {
            if covered >= required_space {
                break;
            }
            covered += partition.aggregate_size;
            let mut keys: Vec<String> = partition.member_keys.iter().cloned().collect();
            keys.sort();
            candidates.push(EvictionCandidate {
                partition_id: partition.id.clone(),
                priority: partition.priority,
                aggregate_size: partition.aggregate_size,
                keys,
            });
        }
        candidates
    }

    /// Drops all memberships; declared partitions remain with zeroed counters.
    pub fn clear(&mut self) {
        self.membership.clear();
        for partition in self.partitions.values_mut() {
            partition.aggregate_size = 0;
            partition.entry_count = 0;
            partition.member_keys.clear();
        }
    }
}
