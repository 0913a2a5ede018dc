//! Store configuration.

use memfabric_codec::CodecConfig;
use serde::{Deserialize, Serialize};

/// How the store picks victims when it needs room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently accessed first.
    #[default]
    Lru,
    /// Fewest accesses first, ties by recency.
    Lfu,
    /// Lowest-priority partition first, LRU within a partition.
    PartitionPriority,
}

/// Configuration for a [`LocalStore`](crate::LocalStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Byte budget for all encoded payloads.
    pub max_size_bytes: u64,
    /// Optional cap on the number of entries.
    pub max_entries: Option<usize>,
    pub compression_enabled: bool,
    /// Payloads smaller than this are never compressed.
    pub compression_threshold: usize,
    /// Write through to the persistence adapter, if one is attached.
    pub persistence_enabled: bool,
    /// Upper bound on any single persistence call (ms).
    pub persistence_timeout_ms: u64,
    /// Interval of the background GC sweep (ms).
    pub gc_interval_ms: u64,
    /// Interval of the background persistence flush (ms).
    pub flush_interval_ms: u64,
    /// Entries not accessed for this long are collected by GC (ms).
    pub max_entry_age_ms: u64,
    pub eviction_policy: EvictionPolicy,
    /// Capacity of the signal channel.
    pub signal_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 64 * 1024 * 1024,
            max_entries: None,
            compression_enabled: true,
            compression_threshold: 1024,
            persistence_enabled: false,
            persistence_timeout_ms: 5_000,
            gc_interval_ms: 60_000,
            flush_interval_ms: 30_000,
            max_entry_age_ms: 24 * 60 * 60 * 1000,
            eviction_policy: EvictionPolicy::Lru,
            signal_capacity: 256,
        }
    }
}

impl StoreConfig {
    /// A config with the given byte budget and defaults elsewhere.
    #[must_use]
    pub fn with_max_size(max_size_bytes: u64) -> Self {
        Self {
            max_size_bytes,
            ..Default::default()
        }
    }

    /// Codec settings derived from this config.
    #[must_use]
    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            compression_enabled: self.compression_enabled,
            compression_threshold: self.compression_threshold,
            ..Default::default()
        }
    }
}
