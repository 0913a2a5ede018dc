//! A registered principal: its store, read cache, subscriber and the
//! per-key causality and version state the coordinator keeps for it.
//!
//! Per-key state lives only as long as the store holds the key. A watcher
//! task drops it when the store reports an eviction or expiry, and
//! [`Principal::forget_untracked`] sweeps whatever the watcher missed.

use crate::config::PrincipalConfig;
use crate::error::CoordinatorResult;
use memfabric_bus::Subscriber;
use memfabric_consistency::{VersionController, VersionVector, VersionedValue};
use memfabric_store::{EntryInfo, LocalStore, StoreSignal};
use memfabric_types::{ChannelId, Millis, PrincipalId, Value, now_millis};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio::task::JoinHandle;
use tracing::debug;

/// Health of one principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalHealth {
    Healthy,
    /// Over the degraded utilization threshold, or its persistence failed.
    Degraded,
}

impl fmt::Display for PrincipalHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
        })
    }
}

/// Point-in-time view of a principal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrincipalStatus {
    pub principal_id: PrincipalId,
    pub domain: String,
    pub health: PrincipalHealth,
    pub utilization: f64,
    pub memory_used: u64,
    pub memory_limit: u64,
    pub entry_count: usize,
    pub partition_ids: Vec<String>,
    pub sharing: bool,
    pub versioning: bool,
    pub operations: u64,
    pub cache_hit_rate: f64,
    /// Bus events from other principals seen by this one.
    pub events_received: u64,
    pub registered_at: Millis,
    pub last_activity: Millis,
}

/// Counters shared with the subscriber callback.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) operations: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    pub(crate) events_received: AtomicU64,
    pub(crate) last_activity: AtomicU64,
}

impl Counters {
    pub(crate) fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    pub(crate) fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 { 0.0 } else { hits as f64 / total as f64 }
    }
}

/// A cached decoded value, valid while the store still holds `version`.
#[derive(Debug, Clone)]
pub(crate) struct Cached {
    pub(crate) version: u64,
    pub(crate) value: Value,
}

/// Everything bound to one registered principal.
///
/// Mutating helpers assume the caller holds the principal's operation lock
/// (see [`Principal::lock`]).
pub(crate) struct Principal {
    pub(crate) config: PrincipalConfig,
    pub(crate) store: Arc<LocalStore>,
    pub(crate) cache: Cache<String, Cached>,
    pub(crate) subscriber: Arc<Subscriber>,
    /// Outgoing broadcaster channel, present when sharing is enabled.
    pub(crate) channel: Option<ChannelId>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) registered_at: Millis,
    vectors: Mutex<HashMap<String, VersionVector>>,
    versions: Mutex<VersionController>,
    /// Keys written locally since the last sync.
    dirty: Mutex<BTreeSet<String>>,
    op_lock: Mutex<()>,
    store_watch: JoinHandle<()>,
}

/// Where a write comes from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Origin<'a> {
    /// The principal itself; bumps its own clock and marks the key dirty.
    Local,
    /// Like `Local`, for a rollback already recorded in version history.
    Rollback,
    /// Sync or transfer; adopts the given causal history.
    Remote {
        author: &'a str,
        vector: Option<&'a VersionVector>,
    },
}

impl Principal {
    pub(crate) fn new(
        config: PrincipalConfig,
        store: Arc<LocalStore>,
        cache: Cache<String, Cached>,
        subscriber: Arc<Subscriber>,
        channel: Option<ChannelId>,
        counters: Arc<Counters>,
        versions: VersionController,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            let store_watch = watch_store(me.clone(), store.signals());
            Self {
                config,
                store,
                cache,
                subscriber,
                channel,
                counters,
                registered_at: now_millis(),
                vectors: Mutex::new(HashMap::new()),
                versions: Mutex::new(versions),
                dirty: Mutex::new(BTreeSet::new()),
                op_lock: Mutex::new(()),
                store_watch,
            }
        })
    }

    pub(crate) fn id(&self) -> &PrincipalId {
        &self.config.principal_id
    }

    /// Serializes operations on this principal.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    /// Writes `value` and updates cache, clock and history.
    pub(crate) async fn put(
        &self,
        key: &str,
        value: &Value,
        partition_id: Option<&str>,
        ttl: Option<Millis>,
        origin: Origin<'_>,
    ) -> CoordinatorResult<bool> {
        let partition = partition_id.unwrap_or_else(|| self.config.home_partition());
        let stored = self.store.store(key, value, Some(partition), ttl).await?;
        if !stored {
            return Ok(false);
        }

        let version = self.store.entry_info(key).await.map_or(1, |i| i.version);
        self.cache.insert(
            key.to_string(),
            Cached {
                version,
                value: value.clone(),
            },
        );

        let author = match origin {
            Origin::Local | Origin::Rollback => {
                let mut vectors = self.vectors.lock().await;
                vectors
                    .entry(key.to_string())
                    .or_default()
                    .increment(self.id().as_str(), now_millis());
                self.dirty.lock().await.insert(key.to_string());
                self.id().as_str()
            }
            Origin::Remote { author, vector } => {
                if let Some(incoming) = vector {
                    self.vectors
                        .lock()
                        .await
                        .entry(key.to_string())
                        .or_default()
                        .merge(incoming);
                }
                author
            }
        };

        if self.config.enable_versioning && !matches!(origin, Origin::Rollback) {
            self.versions
                .lock()
                .await
                .create_version(key, value, author, None)?;
        }
        Ok(true)
    }

    /// Reads through the cache. A cached copy is served only while the
    /// store still holds the same entry version.
    pub(crate) async fn get(&self, key: &str) -> CoordinatorResult<Option<Value>> {
        let fresh = match self.cache.get(key) {
            Some(cached) => match self.store.touch(key).await {
                Some(info) if info.version == cached.version => {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(cached.value));
                }
                // Stale copy; the access was already counted.
                Some(_) => self.store.peek(key).await?,
                None => None,
            },
            None => self.store.retrieve_with_info(key).await?,
        };
        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        let Some((value, info)) = fresh else {
            self.cache.invalidate(key);
            return Ok(None);
        };
        self.cache.insert(
            key.to_string(),
            Cached {
                version: info.version,
                value: value.clone(),
            },
        );
        Ok(Some(value))
    }

    /// Value and metadata without counting an access.
    pub(crate) async fn peek(&self, key: &str) -> CoordinatorResult<Option<(Value, EntryInfo)>> {
        Ok(self.store.peek(key).await?)
    }

    /// Removes a key with its cache entry and causal history.
    pub(crate) async fn delete(&self, key: &str) -> CoordinatorResult<bool> {
        self.cache.invalidate(key);
        self.vectors.lock().await.remove(key);
        self.dirty.lock().await.remove(key);
        Ok(self.store.remove(key).await?)
    }

    /// Drops the cache entry, clock, dirty mark and history of a key the
    /// store no longer holds.
    async fn forget(&self, key: &str) {
        self.cache.invalidate(key);
        self.vectors.lock().await.remove(key);
        self.dirty.lock().await.remove(key);
        self.versions.lock().await.delete_history(key);
    }

    /// Forgets every key with a clock or history that the store no longer
    /// holds. Returns how many were forgotten.
    pub(crate) async fn forget_untracked(&self) -> usize {
        let mut tracked: BTreeSet<String> = self.vectors.lock().await.keys().cloned().collect();
        tracked.extend(self.versions.lock().await.keys().map(str::to_string));

        let mut forgotten = 0;
        for key in tracked {
            if !self.store.contains(&key).await {
                self.forget(&key).await;
                forgotten += 1;
            }
        }
        forgotten
    }

    pub(crate) async fn vector(&self, key: &str) -> Option<VersionVector> {
        self.vectors.lock().await.get(key).cloned()
    }

    /// Folds `incoming` into the key's clock without writing.
    pub(crate) async fn adopt_vector(&self, key: &str, incoming: &VersionVector) {
        self.vectors
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .merge(incoming);
    }

    /// The key as one side of a conflict, with its entry metadata.
    pub(crate) async fn versioned(
        &self,
        key: &str,
    ) -> CoordinatorResult<Option<(VersionedValue, EntryInfo)>> {
        let Some((value, info)) = self.peek(key).await? else {
            return Ok(None);
        };
        let mut side = VersionedValue::new(key, value)
            .with_version(info.version)
            .with_timestamp(info.updated_at)
            .with_size(info.size_bytes)
            .with_partition(info.partition_id.clone())
            .with_access_count(info.access_count)
            .with_source(self.id().as_str());
        if let Some(vector) = self.vector(key).await {
            side = side.with_vector(vector);
        }
        Ok(Some((side, info)))
    }

    /// Drains the keys written locally since the last call.
    pub(crate) async fn take_dirty(&self) -> BTreeSet<String> {
        std::mem::take(&mut *self.dirty.lock().await)
    }

    /// Marks keys for the next incremental sync.
    pub(crate) async fn mark_dirty(&self, keys: impl IntoIterator<Item = String>) {
        self.dirty.lock().await.extend(keys);
    }

    pub(crate) async fn versions(&self) -> MutexGuard<'_, VersionController> {
        self.versions.lock().await
    }

    /// Live status, with `degraded_at` as the utilization threshold.
    pub(crate) async fn status(&self, degraded_at: f64) -> PrincipalStatus {
        let stats = self.store.stats().await;
        let health = if stats.utilization > degraded_at || self.store.is_degraded() {
            PrincipalHealth::Degraded
        } else {
            PrincipalHealth::Healthy
        };
        PrincipalStatus {
            principal_id: self.id().clone(),
            domain: self.config.domain.clone(),
            health,
            utilization: stats.utilization,
            memory_used: stats.total_size,
            memory_limit: stats.max_size,
            entry_count: stats.entry_count,
            partition_ids: self.config.partition_ids.clone(),
            sharing: self.config.enable_sharing,
            versioning: self.config.enable_versioning,
            operations: self.counters.operations.load(Ordering::Relaxed),
            cache_hit_rate: self.counters.cache_hit_rate(),
            events_received: self.counters.events_received.load(Ordering::Relaxed),
            registered_at: self.registered_at,
            last_activity: self.counters.last_activity.load(Ordering::Relaxed),
        }
    }

    /// Flushes pending events and stops the principal's components.
    pub(crate) async fn close(&self) -> CoordinatorResult<()> {
        self.store_watch.abort();
        self.subscriber.shutdown().await;
        self.store.shutdown().await?;
        self.cache.invalidate_all();
        debug!("principal {} closed", self.id());
        Ok(())
    }
}

/// Forgets per-key state as the store evicts or expires keys. A lagged
/// receiver falls back to a full sweep.
fn watch_store(
    me: Weak<Principal>,
    mut signals: broadcast::Receiver<StoreSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let key = match signals.recv().await {
                Ok(StoreSignal::Evicted { key, .. } | StoreSignal::Expired { key }) => Some(key),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    debug!("store watcher lagged by {missed} signals, sweeping");
                    None
                }
                Err(RecvError::Closed) => break,
            };
            let Some(principal) = me.upgrade() else {
                break;
            };
            let _op = principal.lock().await;
            match key {
                Some(key) if !principal.store.contains(&key).await => principal.forget(&key).await,
                Some(_) => {}
                None => {
                    principal.forget_untracked().await;
                }
            }
        }
    })
}
