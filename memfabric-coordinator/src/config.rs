//! Coordinator and principal configuration.

use memfabric_bus::{BroadcasterConfig, BusConfig, SubscriberConfig};
use memfabric_consistency::{ResolverConfig, Strategy, VersionConfig};
use memfabric_store::{DEFAULT_PARTITION, DEFAULT_PRIORITY, StoreConfig};
use memfabric_types::PrincipalId;
use serde::{Deserialize, Serialize};

/// Configuration for a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Hard cap on concurrently registered principals.
    pub max_principals: usize,
    /// Interval of the background incremental sync (ms).
    pub sync_interval_ms: u64,
    /// Interval of the background health check (ms).
    pub health_check_interval_ms: u64,
    /// Utilization above which `load_balance` moves entries away.
    pub high_utilization: f64,
    /// Utilization below which a principal may receive entries.
    pub low_utilization: f64,
    /// Utilization above which a principal reports degraded.
    pub degraded_utilization: f64,
    /// Read-cache capacity per principal, in entries.
    pub cache_capacity: u64,
    /// Strategy used when sync finds concurrent writes.
    pub default_strategy: Strategy,
    /// Run the sync scheduler when started.
    pub auto_sync: bool,
    /// Capacity of the signal channel.
    pub signal_capacity: usize,
    pub bus: BusConfig,
    pub broadcaster: BroadcasterConfig,
    pub subscriber: SubscriberConfig,
    pub resolver: ResolverConfig,
    pub versions: VersionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_principals: 16,
            sync_interval_ms: 30_000,
            health_check_interval_ms: 10_000,
            high_utilization: 0.8,
            low_utilization: 0.5,
            degraded_utilization: 0.95,
            cache_capacity: 1000,
            default_strategy: Strategy::Auto,
            auto_sync: true,
            signal_capacity: 256,
            bus: BusConfig::default(),
            broadcaster: BroadcasterConfig::default(),
            subscriber: SubscriberConfig::default(),
            resolver: ResolverConfig::default(),
            versions: VersionConfig::default(),
        }
    }
}

/// Registration options for one principal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrincipalConfig {
    pub principal_id: PrincipalId,
    /// Free-form area of responsibility, reported in status.
    #[serde(default)]
    pub domain: String,
    /// Byte budget of the principal's store.
    pub max_memory_size: u64,
    /// Partitions this principal writes to and is interested in.
    #[serde(default = "default_partitions")]
    pub partition_ids: Vec<String>,
    /// Eviction priority of the principal's partitions and channel.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Publish writes and take part in cross-principal sync.
    #[serde(default)]
    pub enable_sharing: bool,
    /// Record a version history for every write.
    #[serde(default)]
    pub enable_versioning: bool,
    /// Store settings; `max_size_bytes` is overridden by `max_memory_size`.
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_partitions() -> Vec<String> {
    vec![DEFAULT_PARTITION.to_string()]
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl PrincipalConfig {
    /// A principal with a byte budget and defaults elsewhere: the default
    /// partition, no sharing, no versioning.
    #[must_use]
    pub fn new(principal_id: PrincipalId, max_memory_size: u64) -> Self {
        Self {
            principal_id,
            domain: String::new(),
            max_memory_size,
            partition_ids: default_partitions(),
            priority: DEFAULT_PRIORITY,
            enable_sharing: false,
            enable_versioning: false,
            store: StoreConfig::default(),
        }
    }

    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    #[must_use]
    pub fn with_partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partition_ids = partitions.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn sharing(mut self, enabled: bool) -> Self {
        self.enable_sharing = enabled;
        self
    }

    #[must_use]
    pub fn versioning(mut self, enabled: bool) -> Self {
        self.enable_versioning = enabled;
        self
    }

    #[must_use]
    pub fn with_store_config(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// The partition a write lands in when the caller names none.
    #[must_use]
    pub fn home_partition(&self) -> &str {
        self.partition_ids
            .first()
            .map_or(DEFAULT_PARTITION, String::as_str)
    }

    /// True if this principal wants entries of `partition_id`.
    #[must_use]
    pub fn is_interested_in(&self, partition_id: &str) -> bool {
        self.partition_ids.iter().any(|p| p == partition_id)
    }

    /// Store settings with the principal's byte budget applied.
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_size_bytes: self.max_memory_size,
            ..self.store.clone()
        }
    }
}
