//! Bounded per-principal key/value store.
//!
//! Writes are encoded through the codec, charged to a partition and admitted
//! only if the byte budget allows, evicting victims chosen by the configured
//! [`EvictionPolicy`] first. Reads refresh recency and lazily expire TTL'd
//! entries. Durability is delegated to an optional [`PersistenceAdapter`]
//! and is best-effort: adapter failures are signalled, never rolled back.

use crate::config::{EvictionPolicy, StoreConfig};
use crate::entry::{Entry, EntryInfo};
use crate::error::{StoreError, StoreResult};
use crate::partition::{DEFAULT_PARTITION, Partition, PartitionController};
use crate::persistence::PersistenceAdapter;
use memfabric_codec::{Codec, peek_compression};
use memfabric_types::{InFlight, Millis, Value, now_millis, spawn_periodic};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notifications emitted by a store. Receivers obtained through
/// [`LocalStore::signals`]; a slow receiver lags rather than blocking writes.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreSignal {
    Stored {
        key: String,
        partition_id: String,
        version: u64,
        size_bytes: u64,
    },
    Updated {
        key: String,
        partition_id: String,
        version: u64,
        size_bytes: u64,
    },
    Removed {
        key: String,
    },
    Evicted {
        key: String,
        partition_id: String,
        size_bytes: u64,
    },
    Expired {
        key: String,
    },
    Cleared {
        count: usize,
    },
    /// Compression failed; the payload was stored uncompressed.
    CompressionFallback {
        key: String,
    },
    /// A persistence call failed; the in-memory state is unaffected.
    PersistenceFailed {
        key: Option<String>,
        error: String,
    },
}

/// Point-in-time store statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_size: u64,
    pub max_size: u64,
    pub entry_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    /// Serialized bytes divided by stored bytes over live entries.
    pub compression_ratio: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub utilization: f64,
    pub partition_sizes: BTreeMap<String, u64>,
}

struct Slot {
    entry: Entry,
    serialized_size: u64,
    touch_seq: u64,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

struct StoreState {
    entries: HashMap<String, Slot>,
    partitions: PartitionController,
    current_size: u64,
    next_seq: u64,
    counters: Counters,
}

impl StoreState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn detach(&mut self, key: &str) -> Option<Slot> {
        let slot = self.entries.remove(key)?;
        self.partitions.remove_from_partition(key);
        self.current_size = self.current_size.saturating_sub(slot.entry.size_bytes);
        Some(slot)
    }

    fn attach(&mut self, slot: Slot, now: Millis) {
        let entry = &slot.entry;
        self.partitions
            .add_to_partition(&entry.partition_id, &entry.id, entry.size_bytes, now);
        self.current_size += entry.size_bytes;
        self.entries.insert(entry.id.clone(), slot);
    }

    fn lru_key(slot: &Slot) -> (Millis, u64) {
        (slot.entry.last_accessed, slot.touch_seq)
    }

    /// Candidate victims in eviction order, as `(key, size)`.
    fn victim_order(
        &self,
        policy: EvictionPolicy,
        scope: Option<&str>,
        excluded: &HashSet<String>,
    ) -> Vec<(String, u64)> {
        let eligible = |key: &String, slot: &Slot| {
            !excluded.contains(key) && scope.is_none_or(|p| slot.entry.partition_id == p)
        };

        let mut slots: Vec<(&String, &Slot)> =
            self.entries.iter().filter(|(k, s)| eligible(*k, *s)).collect();

        match (policy, scope) {
            (EvictionPolicy::Lfu, _) => slots.sort_by_key(|(_, s)| {
                let (accessed, seq) = Self::lru_key(s);
                (s.entry.access_count, accessed, seq)
            }),
            (EvictionPolicy::PartitionPriority, None) => {
                let rank: HashMap<String, usize> = self
                    .partitions
                    .eviction_candidates(u64::MAX)
                    .into_iter()
                    .enumerate()
                    .map(|(i, c)| (c.partition_id, i))
                    .collect();
                slots.sort_by_key(|(_, s)| {
                    let r = rank.get(&s.entry.partition_id).copied().unwrap_or(usize::MAX);
                    (r, Self::lru_key(s))
                });
            }
            _ => slots.sort_by_key(|(_, s)| Self::lru_key(s)),
        }

        slots
            .into_iter()
            .map(|(k, s)| (k.clone(), s.entry.size_bytes))
            .collect()
    }

    /// Picks victims freeing at least `required` bytes, or `None` if the
    /// eligible entries cannot cover it.
    fn plan_eviction(
        &self,
        policy: EvictionPolicy,
        required: u64,
        scope: Option<&str>,
        excluded: &HashSet<String>,
    ) -> Option<Vec<(String, u64)>> {
        if required == 0 {
            return Some(Vec::new());
        }
        let mut freed = 0u64;
        let mut plan = Vec::new();
        for (key, size) in self.victim_order(policy, scope, excluded) {
            freed += size;
            plan.push((key, size));
            if freed >= required {
                return Some(plan);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Upsert,
    UpdateExisting,
}

/// A bounded, TTL-aware, partitioned key/value store owned by one principal.
pub struct LocalStore {
    name: String,
    config: StoreConfig,
    codec: Codec,
    state: Mutex<StoreState>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    signals: broadcast::Sender<StoreSignal>,
    gc_in_flight: AtomicBool,
    degraded: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalStore {
    /// Creates a store without durability.
    pub fn new(name: impl Into<String>, config: StoreConfig) -> Self {
        Self::build(name.into(), config, None)
    }

    /// Creates a store that writes through to `adapter` when
    /// `config.persistence_enabled` is set.
    pub fn with_persistence(
        name: impl Into<String>,
        config: StoreConfig,
        adapter: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        Self::build(name.into(), config, Some(adapter))
    }

    fn build(
        name: String,
        config: StoreConfig,
        persistence: Option<Arc<dyn PersistenceAdapter>>,
    ) -> Self {
        let (signals, _) = broadcast::channel(config.signal_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            name,
            codec: Codec::new(config.codec_config()),
            state: Mutex::new(StoreState {
                entries: HashMap::new(),
                partitions: PartitionController::new(now_millis()),
                current_size: 0,
                next_seq: 0,
                counters: Counters::default(),
            }),
            config,
            persistence,
            signals,
            gc_in_flight: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The owner label given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration in use.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Subscribes to store signals.
    pub fn signals(&self) -> broadcast::Receiver<StoreSignal> {
        self.signals.subscribe()
    }

    /// True after a persistence failure, until the next successful flush.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Declares (or reconfigures) a partition.
    pub async fn declare_partition(&self, id: &str, priority: u8, max_size: Option<u64>) {
        self.state
            .lock()
            .await
            .partitions
            .declare(id, priority, max_size, now_millis());
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// `ttl` is an absolute deadline in epoch milliseconds. Evicts victims
    /// if needed; fails with a capacity error if that cannot make room.
    pub async fn store(
        &self,
        key: &str,
        value: &Value,
        partition_id: Option<&str>,
        ttl: Option<Millis>,
    ) -> StoreResult<bool> {
        self.write(key, value, partition_id, ttl, WriteMode::Upsert)
            .await
    }

    /// Replaces the value of an existing key, keeping its partition and TTL.
    /// Returns `false` if the key is absent or expired.
    pub async fn update(&self, key: &str, value: &Value) -> StoreResult<bool> {
        self.write(key, value, None, None, WriteMode::UpdateExisting)
            .await
    }

    async fn write(
        &self,
        key: &str,
        value: &Value,
        partition_id: Option<&str>,
        ttl: Option<Millis>,
        mode: WriteMode,
    ) -> StoreResult<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }

        let encoded = self.codec.encode(value)?;
        let size = encoded.bytes.len() as u64;
        let max = self.config.max_size_bytes;
        if size > max {
            return Err(StoreError::InsufficientSpace {
                required: size,
                available: max,
            });
        }

        let now = now_millis();
        let mut state = self.state.lock().await;

        let previous = state.entries.get(key).map(|s| {
            (
                s.entry.created_at,
                s.entry.access_count,
                s.entry.version,
                s.entry.partition_id.clone(),
                s.entry.size_bytes,
                s.entry.ttl,
                s.entry.is_expired(now),
            )
        });

        // An expired entry is gone as far as callers are concerned.
        let previous = match previous {
            Some((.., true)) => {
                state.detach(key);
                state.counters.expirations += 1;
                self.emit(StoreSignal::Expired {
                    key: key.to_string(),
                });
                None
            }
            other => other,
        };

        if mode == WriteMode::UpdateExisting && previous.is_none() {
            return Ok(false);
        }

        let partition = partition_id
            .map(str::to_string)
            .or_else(|| previous.as_ref().map(|p| p.3.clone()))
            .unwrap_or_else(|| DEFAULT_PARTITION.to_string());
        let ttl = match mode {
            WriteMode::Upsert => ttl,
            WriteMode::UpdateExisting => previous.as_ref().and_then(|p| p.5),
        };
        let old_size = previous.as_ref().map_or(0, |p| p.4);
        let old_in_partition = previous
            .as_ref()
            .filter(|p| p.3 == partition)
            .map_or(0, |p| p.4);

        let mut excluded: HashSet<String> = HashSet::from([key.to_string()]);
        let mut victims: Vec<(String, u64)> = Vec::new();

        // Partition budget first: victims must come from the same partition.
        if let Some(limit) = state
            .partitions
            .get_partition_info(&partition)
            .and_then(|p| p.max_size.map(|m| (m, p.aggregate_size)))
            .map(|(m, used)| (m, used.saturating_sub(old_in_partition)))
            .filter(|(m, used)| used + size > *m)
            .map(|(m, used)| (m, used + size - m))
        {
            let (partition_max, needed) = limit;
            let plan = (size <= partition_max)
                .then(|| {
                    state.plan_eviction(
                        EvictionPolicy::Lru,
                        needed,
                        Some(partition.as_str()),
                        &excluded,
                    )
                })
                .flatten();
            match plan {
                Some(plan) => {
                    excluded.extend(plan.iter().map(|(k, _)| k.clone()));
                    victims.extend(plan);
                }
                None => {
                    return Err(StoreError::PartitionFull {
                        partition,
                        required: size,
                        limit: partition_max,
                    });
                }
            }
        }

        // Global budget.
        let freed: u64 = victims.iter().map(|(_, s)| *s).sum();
        let projected = state.current_size - old_size - freed + size;
        if projected > max {
            match state.plan_eviction(self.config.eviction_policy, projected - max, None, &excluded)
            {
                Some(plan) => {
                    excluded.extend(plan.iter().map(|(k, _)| k.clone()));
                    victims.extend(plan);
                }
                None => {
                    return Err(StoreError::InsufficientSpace {
                        required: size,
                        available: max.saturating_sub(state.current_size - old_size),
                    });
                }
            }
        }

        // Entry-count budget.
        if let Some(max_entries) = self.config.max_entries {
            let incoming = usize::from(previous.is_none());
            let remaining = state.entries.len() - victims.len();
            if remaining + incoming > max_entries {
                let extra = remaining + incoming - max_entries;
                let more: Vec<(String, u64)> = state
                    .victim_order(self.config.eviction_policy, None, &excluded)
                    .into_iter()
                    .take(extra)
                    .collect();
                if more.len() < extra {
                    return Err(StoreError::InsufficientSpace {
                        required: size,
                        available: 0,
                    });
                }
                victims.extend(more);
            }
        }

        let mut evicted = Vec::with_capacity(victims.len());
        for (victim, _) in &victims {
            if let Some(slot) = state.detach(victim) {
                state.counters.evictions += 1;
                evicted.push(slot.entry);
            }
        }
        state.detach(key);

        let mut entry = Entry::new(key, encoded.bytes, partition.clone(), now, ttl);
        if let Some((created_at, access_count, version, ..)) = previous {
            entry.created_at = created_at;
            entry.access_count = access_count;
            entry.version = version + 1;
        }
        let seq = state.next_seq();
        let persisted = self.persistence().is_some().then(|| entry.clone());
        let (version, size_bytes) = (entry.version, entry.size_bytes);
        state.attach(
            Slot {
                entry,
                serialized_size: encoded.serialized_size as u64,
                touch_seq: seq,
            },
            now,
        );
        drop(state);

        for victim in &evicted {
            debug!(
                "[{}] evicted {} ({} bytes, partition {})",
                self.name, victim.id, victim.size_bytes, victim.partition_id
            );
            self.emit(StoreSignal::Evicted {
                key: victim.id.clone(),
                partition_id: victim.partition_id.clone(),
                size_bytes: victim.size_bytes,
            });
        }
        if encoded.fell_back {
            self.emit(StoreSignal::CompressionFallback {
                key: key.to_string(),
            });
        }
        let signal = if previous.is_some() {
            StoreSignal::Updated {
                key: key.to_string(),
                partition_id: partition,
                version,
                size_bytes,
            }
        } else {
            StoreSignal::Stored {
                key: key.to_string(),
                partition_id: partition,
                version,
                size_bytes,
            }
        };
        self.emit(signal);

        if let (Some(adapter), Some(entry)) = (self.persistence(), persisted) {
            for victim in &evicted {
                self.persist(Some(victim.id.as_str()), adapter.remove(&victim.id))
                    .await;
            }
            self.persist(Some(key), adapter.store(key, &entry)).await;
        }
        Ok(true)
    }

    /// Removes `key`. Returns `false` if it was not present.
    pub async fn remove(&self, key: &str) -> StoreResult<bool> {
        let removed = self.state.lock().await.detach(key).is_some();
        if !removed {
            return Ok(false);
        }
        self.emit(StoreSignal::Removed {
            key: key.to_string(),
        });
        if let Some(adapter) = self.persistence() {
            self.persist(Some(key), adapter.remove(key)).await;
        }
        Ok(true)
    }

    /// Removes every entry. Returns how many were removed.
    pub async fn clear(&self) -> StoreResult<usize> {
        let keys: Vec<String> = {
            let mut state = self.state.lock().await;
            let keys = state.entries.keys().cloned().collect();
            state.entries.clear();
            state.partitions.clear();
            state.current_size = 0;
            keys
        };
        self.emit(StoreSignal::Cleared { count: keys.len() });
        if let Some(adapter) = self.persistence() {
            for key in &keys {
                self.persist(Some(key.as_str()), adapter.remove(key)).await;
            }
        }
        Ok(keys.len())
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Returns the value under `key`, counting the access.
    ///
    /// An expired entry is removed and reported as a miss.
    pub async fn retrieve(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.retrieve_with_info(key).await?.map(|(value, _)| value))
    }

    /// Like [`retrieve`](Self::retrieve), also returning entry metadata.
    pub async fn retrieve_with_info(&self, key: &str) -> StoreResult<Option<(Value, EntryInfo)>> {
        let Some((payload, info)) = self.access(key, true).await else {
            return Ok(None);
        };
        let value = self.codec.decode(&payload)?;
        Ok(Some((value, info)))
    }

    /// Counts an access to `key` exactly like a read, without decoding the
    /// payload. Lets callers with their own decoded copy keep LRU order
    /// and hit rates honest.
    pub async fn touch(&self, key: &str) -> Option<EntryInfo> {
        self.access(key, false).await.map(|(_, info)| info)
    }

    /// Decodes the value under `key` without counting an access.
    pub async fn peek(&self, key: &str) -> StoreResult<Option<(Value, EntryInfo)>> {
        let now = now_millis();
        let found = {
            let state = self.state.lock().await;
            state
                .entries
                .get(key)
                .filter(|s| !s.entry.is_expired(now))
                .map(|s| (s.entry.payload.clone(), s.entry.info()))
        };
        match found {
            Some((payload, info)) => Ok(Some((self.codec.decode(&payload)?, info))),
            None => Ok(None),
        }
    }

    async fn access(&self, key: &str, with_payload: bool) -> Option<(Vec<u8>, EntryInfo)> {
        let now = now_millis();
        let mut state = self.state.lock().await;

        let expired = match state.entries.get(key) {
            None => {
                state.counters.misses += 1;
                return None;
            }
            Some(slot) => slot.entry.is_expired(now),
        };

        if expired {
            state.detach(key);
            state.counters.expirations += 1;
            state.counters.misses += 1;
            drop(state);
            debug!("[{}] {key} expired on read", self.name);
            self.emit(StoreSignal::Expired {
                key: key.to_string(),
            });
            if let Some(adapter) = self.persistence() {
                self.persist(Some(key), adapter.remove(key)).await;
            }
            return None;
        }

        let seq = state.next_seq();
        state.partitions.touch(key, now);
        state.counters.hits += 1;
        let slot = state.entries.get_mut(key)?;
        slot.entry.access_count += 1;
        slot.entry.last_accessed = now;
        slot.touch_seq = seq;
        let payload = if with_payload {
            slot.entry.payload.clone()
        } else {
            Vec::new()
        };
        Some((payload, slot.entry.info()))
    }

    /// True if `key` is present and not expired. Does not count as an access.
    pub async fn contains(&self, key: &str) -> bool {
        let now = now_millis();
        self.state
            .lock()
            .await
            .entries
            .get(key)
            .is_some_and(|s| !s.entry.is_expired(now))
    }

    /// Metadata for `key` without counting an access.
    pub async fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let now = now_millis();
        self.state
            .lock()
            .await
            .entries
            .get(key)
            .filter(|s| !s.entry.is_expired(now))
            .map(|s| s.entry.info())
    }

    /// Live keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let now = now_millis();
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, s)| !s.entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Live entries' metadata, least recently accessed first.
    pub async fn entries_by_recency(&self) -> Vec<EntryInfo> {
        let now = now_millis();
        let state = self.state.lock().await;
        let mut slots: Vec<&Slot> = state
            .entries
            .values()
            .filter(|s| !s.entry.is_expired(now))
            .collect();
        slots.sort_by_key(|s| StoreState::lru_key(s));
        slots.into_iter().map(|s| s.entry.info()).collect()
    }

    /// A partition's accounting state.
    pub async fn partition_info(&self, partition_id: &str) -> Option<Partition> {
        self.state
            .lock()
            .await
            .partitions
            .get_partition_info(partition_id)
            .cloned()
    }

    /// Number of entries (expired-but-uncollected included).
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// True if the store holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bytes currently charged.
    pub async fn current_size(&self) -> u64 {
        self.state.lock().await.current_size
    }

    /// Fraction of the byte budget in use.
    pub async fn utilization(&self) -> f64 {
        let used = self.current_size().await;
        if self.config.max_size_bytes == 0 {
            return 1.0;
        }
        used as f64 / self.config.max_size_bytes as f64
    }

    /// Current statistics.
    pub async fn stats(&self) -> StoreStats {
        let state = self.state.lock().await;
        let lookups = state.counters.hits + state.counters.misses;
        let (hit_rate, miss_rate) = if lookups == 0 {
            (0.0, 0.0)
        } else {
            (
                state.counters.hits as f64 / lookups as f64,
                state.counters.misses as f64 / lookups as f64,
            )
        };
        let serialized: u64 = state.entries.values().map(|s| s.serialized_size).sum();
        let compression_ratio = if state.current_size == 0 {
            1.0
        } else {
            serialized as f64 / state.current_size as f64
        };
        let max_size = self.config.max_size_bytes;
        StoreStats {
            total_size: state.current_size,
            max_size,
            entry_count: state.entries.len(),
            hits: state.counters.hits,
            misses: state.counters.misses,
            hit_rate,
            miss_rate,
            compression_ratio,
            evictions: state.counters.evictions,
            expirations: state.counters.expirations,
            utilization: if max_size == 0 {
                1.0
            } else {
                state.current_size as f64 / max_size as f64
            },
            partition_sizes: state.partitions.sizes(),
        }
    }

    // ── Maintenance ──────────────────────────────────────────────

    /// Removes expired entries and entries idle longer than
    /// `max_entry_age_ms`. Returns how many were removed.
    ///
    /// Only one sweep runs at a time; a concurrent call gets `Busy`.
    pub async fn gc(&self) -> StoreResult<usize> {
        let _guard = InFlight::acquire(&self.gc_in_flight).ok_or(StoreError::Busy("gc"))?;
        let now = now_millis();
        let max_age = self.config.max_entry_age_ms;

        let removed: Vec<(Entry, bool)> = {
            let mut state = self.state.lock().await;
            let doomed: Vec<(String, bool)> = state
                .entries
                .iter()
                .filter_map(|(key, slot)| {
                    if slot.entry.is_expired(now) {
                        Some((key.clone(), true))
                    } else if now.saturating_sub(slot.entry.last_accessed) > max_age {
                        Some((key.clone(), false))
                    } else {
                        None
                    }
                })
                .collect();
            let mut removed = Vec::with_capacity(doomed.len());
            for (key, expired) in doomed {
                if let Some(slot) = state.detach(&key) {
                    if expired {
                        state.counters.expirations += 1;
                    } else {
                        state.counters.evictions += 1;
                    }
                    removed.push((slot.entry, expired));
                }
            }
            removed
        };

        for (entry, expired) in &removed {
            let signal = if *expired {
                StoreSignal::Expired {
                    key: entry.id.clone(),
                }
            } else {
                StoreSignal::Evicted {
                    key: entry.id.clone(),
                    partition_id: entry.partition_id.clone(),
                    size_bytes: entry.size_bytes,
                }
            };
            self.emit(signal);
        }
        if let Some(adapter) = self.persistence() {
            for (entry, _) in &removed {
                self.persist(Some(entry.id.as_str()), adapter.remove(&entry.id))
                    .await;
            }
        }
        if !removed.is_empty() {
            info!("[{}] gc removed {} entries", self.name, removed.len());
        }
        Ok(removed.len())
    }

    /// Reloads entries from the persistence adapter.
    ///
    /// Expired entries, keys already in memory, and entries that no longer
    /// fit the byte budget are skipped. Returns how many were restored.
    pub async fn restore(&self) -> StoreResult<usize> {
        let Some(adapter) = self.persistence() else {
            return Ok(0);
        };
        let mut loaded = self.with_timeout("load_all", adapter.load_all()).await?;
        loaded.sort_by_key(|e| e.last_accessed);

        let now = now_millis();
        let mut state = self.state.lock().await;
        let mut restored = 0;
        for mut entry in loaded {
            if entry.is_expired(now) || state.entries.contains_key(&entry.id) {
                continue;
            }
            entry.size_bytes = entry.payload.len() as u64;
            if state.current_size + entry.size_bytes > self.config.max_size_bytes {
                warn!("[{}] skipping {} on restore: over budget", self.name, entry.id);
                continue;
            }
            let serialized_size = peek_compression(&entry.payload)
                .map_or(entry.size_bytes, |h| h.original_size as u64);
            let seq = state.next_seq();
            state.attach(
                Slot {
                    entry,
                    serialized_size,
                    touch_seq: seq,
                },
                now,
            );
            restored += 1;
        }
        info!("[{}] restored {restored} entries", self.name);
        Ok(restored)
    }

    /// Makes staged persistence writes durable.
    pub async fn flush(&self) -> StoreResult<()> {
        let Some(adapter) = self.persistence() else {
            return Ok(());
        };
        match self.with_timeout("flush", adapter.flush()).await {
            Ok(()) => {
                self.degraded.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.report_persistence_failure(None, &e);
                Err(e)
            }
        }
    }

    /// Starts the periodic GC sweep and, with persistence, the periodic flush.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let store = Arc::clone(self);
        tasks.push(spawn_periodic(
            self.config.gc_interval_ms,
            self.shutdown.subscribe(),
            move || {
                let store = Arc::clone(&store);
                async move {
                    if let Err(e) = store.gc().await {
                        debug!("[{}] gc skipped: {e}", store.name);
                    }
                }
            },
        ));

        if self.persistence().is_some() {
            let store = Arc::clone(self);
            tasks.push(spawn_periodic(
                self.config.flush_interval_ms,
                self.shutdown.subscribe(),
                move || {
                    let store = Arc::clone(&store);
                    async move {
                        let _ = store.flush().await;
                    }
                },
            ));
        }
        debug!("[{}] started {} background tasks", self.name, tasks.len());
    }

    /// Stops background tasks, flushes and closes persistence. Later writes
    /// fail with [`StoreError::Closed`].
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.closed.store(true, Ordering::SeqCst);

        if let Some(adapter) = self.persistence() {
            self.flush().await?;
            self.with_timeout("close", adapter.close()).await?;
        }
        info!("[{}] store shut down", self.name);
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────

    fn emit(&self, signal: StoreSignal) {
        let _ = self.signals.send(signal);
    }

    fn persistence(&self) -> Option<&Arc<dyn PersistenceAdapter>> {
        if self.config.persistence_enabled {
            self.persistence.as_ref()
        } else {
            None
        }
    }

    async fn with_timeout<T>(
        &self,
        op: &str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        let limit = Duration::from_millis(self.config.persistence_timeout_ms);
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(StoreError::Timeout(op.to_string())))
    }

    /// Runs a best-effort persistence call; failures are signalled and swallowed.
    async fn persist<T>(&self, key: Option<&str>, fut: impl Future<Output = StoreResult<T>>) {
        if let Err(e) = self.with_timeout("write", fut).await {
            self.report_persistence_failure(key, &e);
        }
    }

    fn report_persistence_failure(&self, key: Option<&str>, error: &StoreError) {
        warn!("[{}] persistence failure ({key:?}): {error}", self.name);
        self.degraded.store(true, Ordering::SeqCst);
        self.emit(StoreSignal::PersistenceFailed {
            key: key.map(str::to_string),
            error: error.to_string(),
        });
    }
}
