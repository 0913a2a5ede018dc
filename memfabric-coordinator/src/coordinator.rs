//! The coordinator: one shared bus and broadcaster, N principals.
//!
//! Each registered principal gets its own [`LocalStore`], a read cache and a
//! [`Subscriber`]. Principals with sharing enabled also get an outgoing
//! broadcaster channel; their writes are queued there, delivered onto the
//! shared [`EventBus`], and fanned out to every other sharing principal
//! interested in the partition.
//!
//! ```text
//! store(p, k, v) ──► p.store ──► p.channel ──► bus ──► q.subscriber (q ≠ p)
//! ```
//!
//! Operations on one principal are serialized by its operation lock.
//! Cross-principal work (sync, transfer, balancing) takes at most one lock
//! at a time, except transfers, which lock both ends in id order.

use crate::config::{CoordinatorConfig, PrincipalConfig};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::principal::{Counters, Origin, Principal, PrincipalHealth, PrincipalStatus};
use crate::sync::{SyncMode, SyncReport};
use memfabric_bus::{Broadcaster, BusSink, EventBus, EventFilter, Subscriber};
use memfabric_consistency::{
    ConflictResolver, ReviewDecision, ReviewItem, VersionController, VersionDiff, VersionInfo,
};
use memfabric_store::{LocalStore, PersistenceAdapter};
use memfabric_types::{
    BusEvent, EventKind, Millis, PrincipalId, SubscriptionId, Value, now_millis, spawn_periodic,
};
use moka::sync::Cache;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Out-of-band notifications from the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorSignal {
    PrincipalRegistered {
        principal_id: PrincipalId,
    },
    PrincipalUnregistered {
        principal_id: PrincipalId,
    },
    HealthChanged {
        principal_id: PrincipalId,
        from: PrincipalHealth,
        to: PrincipalHealth,
    },
    SyncCompleted {
        mode: SyncMode,
        entries_synced: usize,
        conflicts_resolved: usize,
        failures: usize,
    },
    /// Sync found a conflict it may not settle automatically.
    ConflictEscalated {
        key: String,
        review_id: Option<u64>,
    },
}

/// Running totals across sync runs.
#[derive(Debug, Clone, Default)]
pub(crate) struct SyncTotals {
    pub(crate) runs: u64,
    pub(crate) entries_synced: u64,
    pub(crate) conflicts_resolved: u64,
    pub(crate) last_sync_at: Option<Millis>,
    pub(crate) last_report: Option<SyncReport>,
}

/// Outcome of [`Coordinator::run_maintenance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Keys whose clock and history were dropped because the store no
    /// longer holds them.
    pub forgotten_keys: usize,
    /// Versions removed for being older than the retention period.
    pub expired_versions: usize,
}

/// Orchestrates a set of principals sharing one event fabric.
pub struct Coordinator {
    pub(crate) config: CoordinatorConfig,
    bus: Arc<EventBus>,
    broadcaster: Arc<Broadcaster>,
    pub(crate) principals: RwLock<BTreeMap<PrincipalId, Arc<Principal>>>,
    pub(crate) resolver: Mutex<ConflictResolver>,
    pub(crate) totals: Mutex<SyncTotals>,
    pub(crate) sync_in_flight: AtomicBool,
    health: Mutex<HashMap<PrincipalId, PrincipalHealth>>,
    signals: broadcast::Sender<CoordinatorSignal>,
    running: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    me: Weak<Self>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(config.bus.clone()));
        let broadcaster = Broadcaster::new(
            config.broadcaster.clone(),
            Arc::new(BusSink::new(Arc::clone(&bus))),
        );
        let (signals, _) = broadcast::channel(config.signal_capacity.max(1));
        let resolver = ConflictResolver::new(config.resolver.clone());
        Arc::new_cyclic(|me| Self {
            config,
            bus,
            broadcaster,
            principals: RwLock::new(BTreeMap::new()),
            resolver: Mutex::new(resolver),
            totals: Mutex::new(SyncTotals::default()),
            sync_in_flight: AtomicBool::new(false),
            health: Mutex::new(HashMap::new()),
            signals,
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The shared event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn signals(&self) -> broadcast::Receiver<CoordinatorSignal> {
        self.signals.subscribe()
    }

    pub(crate) fn emit(&self, signal: CoordinatorSignal) {
        let _ = self.signals.send(signal);
    }

    pub(crate) fn ensure_open(&self) -> CoordinatorResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Closed);
        }
        Ok(())
    }

    // ── Registration ─────────────────────────────────────────────

    /// Registers a principal with an in-memory store.
    pub async fn register_principal(&self, config: PrincipalConfig) -> CoordinatorResult<()> {
        let store = LocalStore::new(config.principal_id.as_str(), config.store_config());
        self.register(config, store).await
    }

    /// Registers a principal whose store writes through to `adapter`.
    /// Entries already held by the adapter are restored first.
    pub async fn register_principal_with_persistence(
        &self,
        config: PrincipalConfig,
        adapter: Arc<dyn PersistenceAdapter>,
    ) -> CoordinatorResult<()> {
        let mut store_config = config.store_config();
        store_config.persistence_enabled = true;
        let store =
            LocalStore::with_persistence(config.principal_id.as_str(), store_config, adapter);
        let restored = store.restore().await?;
        if restored > 0 {
            info!("principal {}: restored {restored} entries", config.principal_id);
        }
        self.register(config, store).await
    }

    async fn register(&self, config: PrincipalConfig, store: LocalStore) -> CoordinatorResult<()> {
        self.ensure_open()?;
        let mut principals = self.principals.write().await;
        if principals.contains_key(&config.principal_id) {
            return Err(CoordinatorError::AlreadyRegistered(config.principal_id));
        }
        if principals.len() >= self.config.max_principals {
            return Err(CoordinatorError::CapacityExceeded {
                limit: self.config.max_principals,
            });
        }

        let id = config.principal_id.clone();
        for partition in &config.partition_ids {
            store
                .declare_partition(partition, config.priority, None)
                .await;
        }
        let store = Arc::new(store);
        let cache = Cache::builder()
            .max_capacity(self.config.cache_capacity)
            .build();
        let counters = Arc::new(Counters::default());

        let subscriber = Subscriber::new(id.as_str(), self.config.subscriber.clone());
        let seen = Arc::clone(&counters);
        subscriber
            .subscribe(EventFilter::all(), move |events: &[BusEvent]| {
                seen.events_received
                    .fetch_add(events.len() as u64, Ordering::Relaxed);
                Ok(())
            })
            .await?;

        let channel = if config.enable_sharing {
            let filter = EventFilter::all()
                .partitions(config.partition_ids.iter().cloned())
                .exclude_source(id.as_str());
            subscriber.attach(&self.bus, filter).await?;
            let created = self
                .broadcaster
                .create_channel(
                    id.as_str(),
                    config.partition_ids.iter().cloned(),
                    config.priority,
                    None,
                    None,
                )
                .await;
            match created {
                Ok(channel) => Some(channel),
                Err(e) => {
                    // Drops the bus subscription made by `attach`.
                    subscriber.shutdown().await;
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let principal = Principal::new(
            config,
            store,
            cache,
            subscriber,
            channel,
            counters,
            VersionController::new(self.config.versions.clone()),
        );
        if self.running.load(Ordering::SeqCst) {
            principal.store.start().await;
            principal.subscriber.start().await;
        }
        principals.insert(id.clone(), principal);
        drop(principals);

        self.health
            .lock()
            .await
            .insert(id.clone(), PrincipalHealth::Healthy);
        info!("principal {id} registered");
        self.emit(CoordinatorSignal::PrincipalRegistered { principal_id: id });
        Ok(())
    }

    /// Removes a principal after delivering its queued events and flushing
    /// its store. Returns `false` if it was not registered.
    pub async fn unregister_principal(&self, id: &PrincipalId) -> CoordinatorResult<bool> {
        let Some(principal) = self.principals.write().await.remove(id) else {
            return Ok(false);
        };
        let _op = principal.lock().await;

        self.broadcaster.drain_ready().await;
        if let Some(channel) = principal.channel {
            self.broadcaster.remove_channel(channel).await;
        }
        principal.close().await?;

        self.health.lock().await.remove(id);
        info!("principal {id} unregistered");
        self.emit(CoordinatorSignal::PrincipalUnregistered {
            principal_id: id.clone(),
        });
        Ok(true)
    }

    pub async fn is_registered(&self, id: &PrincipalId) -> bool {
        self.principals.read().await.contains_key(id)
    }

    pub async fn principal_ids(&self) -> Vec<PrincipalId> {
        self.principals.read().await.keys().cloned().collect()
    }

    pub(crate) async fn principal(&self, id: &PrincipalId) -> Option<Arc<Principal>> {
        self.principals.read().await.get(id).cloned()
    }

    pub(crate) async fn all_principals(&self) -> Vec<Arc<Principal>> {
        self.principals.read().await.values().cloned().collect()
    }

    // ── Data path ────────────────────────────────────────────────

    /// Stores `data` under `key` for a principal. `partition_id` defaults to
    /// the principal's first partition. Returns `false` for an unknown
    /// principal.
    pub async fn store(
        &self,
        principal_id: &PrincipalId,
        key: &str,
        data: Value,
        partition_id: Option<&str>,
    ) -> CoordinatorResult<bool> {
        self.store_with_ttl(principal_id, key, data, partition_id, None)
            .await
    }

    /// Like [`store`](Self::store) with an absolute expiry deadline.
    pub async fn store_with_ttl(
        &self,
        principal_id: &PrincipalId,
        key: &str,
        data: Value,
        partition_id: Option<&str>,
        ttl: Option<Millis>,
    ) -> CoordinatorResult<bool> {
        self.ensure_open()?;
        let Some(principal) = self.principal(principal_id).await else {
            debug!("store for unknown principal {principal_id}");
            return Ok(false);
        };
        let _op = principal.lock().await;
        principal.counters.record_operation();

        let existed = principal.store.contains(key).await;
        let partition = partition_id
            .unwrap_or_else(|| principal.config.home_partition())
            .to_string();
        if !principal
            .put(key, &data, Some(&partition), ttl, Origin::Local)
            .await?
        {
            return Ok(false);
        }

        let kind = if existed {
            EventKind::Update
        } else {
            EventKind::Store
        };
        self.publish(
            &principal,
            BusEvent::new(kind, key, partition, principal_id.as_str()).with_data(data),
        )
        .await;
        Ok(true)
    }

    /// Reads `key` for a principal through its cache.
    pub async fn retrieve(
        &self,
        principal_id: &PrincipalId,
        key: &str,
    ) -> CoordinatorResult<Option<Value>> {
        self.ensure_open()?;
        let Some(principal) = self.principal(principal_id).await else {
            return Ok(None);
        };
        let _op = principal.lock().await;
        principal.counters.record_operation();
        principal.get(key).await
    }

    /// Removes `key` from a principal. Returns `false` if absent.
    pub async fn remove(&self, principal_id: &PrincipalId, key: &str) -> CoordinatorResult<bool> {
        self.ensure_open()?;
        let Some(principal) = self.principal(principal_id).await else {
            return Ok(false);
        };
        let _op = principal.lock().await;
        principal.counters.record_operation();

        let partition = principal.store.entry_info(key).await.map(|i| i.partition_id);
        if !principal.delete(key).await? {
            return Ok(false);
        }
        if let Some(partition) = partition {
            self.publish(
                &principal,
                BusEvent::remove(key, partition, principal_id.as_str()),
            )
            .await;
        }
        Ok(true)
    }

    /// Queues an event on the principal's outgoing channel. Sharing is
    /// best-effort: failures are logged, never returned.
    pub(crate) async fn publish(&self, principal: &Principal, event: BusEvent) {
        let Some(channel) = principal.channel else {
            return;
        };
        if let Err(e) = self.broadcaster.broadcast(channel, event).await {
            warn!("principal {}: event not published: {e}", principal.id());
        }
    }

    /// Registers a batch callback on a principal's subscriber. Returns
    /// `None` for an unknown principal.
    pub async fn subscribe(
        &self,
        principal_id: &PrincipalId,
        filter: EventFilter,
        callback: impl Fn(&[BusEvent]) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> CoordinatorResult<Option<SubscriptionId>> {
        let Some(principal) = self.principal(principal_id).await else {
            return Ok(None);
        };
        Ok(Some(principal.subscriber.subscribe(filter, callback).await?))
    }

    /// Delivers everything queued: broadcaster channels onto the bus, then
    /// every subscriber buffer to its callbacks, until nothing moves.
    /// Returns the number of messages and events handled.
    pub async fn pump_events(&self) -> usize {
        let principals = self.all_principals().await;
        let mut total = 0;
        loop {
            let mut progressed = self.broadcaster.drain_ready().await;
            // Attached subscribers are fed by forwarding tasks.
            tokio::task::yield_now().await;
            for principal in &principals {
                loop {
                    let taken = principal.subscriber.process_pending(true).await;
                    if taken == 0 {
                        break;
                    }
                    progressed += taken;
                }
            }
            if progressed == 0 {
                return total;
            }
            total += progressed;
        }
    }

    // ── Version history ──────────────────────────────────────────

    /// Recorded versions of a principal's key, oldest first.
    pub async fn version_history(&self, principal_id: &PrincipalId, key: &str) -> Vec<VersionInfo> {
        match self.principal(principal_id).await {
            Some(principal) => principal.versions().await.list_versions(key),
            None => Vec::new(),
        }
    }

    pub async fn version_diff(
        &self,
        principal_id: &PrincipalId,
        key: &str,
        from: u64,
        to: u64,
    ) -> CoordinatorResult<Option<VersionDiff>> {
        let Some(principal) = self.principal(principal_id).await else {
            return Ok(None);
        };
        let diff = principal.versions().await.get_diff(key, from, to)?;
        Ok(Some(diff))
    }

    /// Restores the payload of an earlier version as a new write. Returns
    /// the new version number, or `None` for an unknown principal.
    pub async fn rollback(
        &self,
        principal_id: &PrincipalId,
        key: &str,
        target_version: u64,
    ) -> CoordinatorResult<Option<u64>> {
        self.ensure_open()?;
        let Some(principal) = self.principal(principal_id).await else {
            return Ok(None);
        };
        let _op = principal.lock().await;
        let (version, value) = principal
            .versions()
            .await
            .rollback(key, target_version, principal_id.as_str())?;
        let info = principal.store.entry_info(key).await;
        principal
            .put(
                key,
                &value,
                info.as_ref().map(|i| i.partition_id.as_str()),
                info.as_ref().and_then(|i| i.ttl),
                Origin::Rollback,
            )
            .await?;
        Ok(Some(version))
    }

    // ── Manual review ────────────────────────────────────────────

    pub async fn pending_reviews(&self) -> Vec<ReviewItem> {
        self.resolver.lock().await.pending_reviews().to_vec()
    }

    /// Settles an escalated conflict and writes the outcome to every
    /// principal holding the key. Returns how many were written.
    pub async fn resolve_review(
        &self,
        review_id: u64,
        decision: ReviewDecision,
    ) -> CoordinatorResult<usize> {
        self.ensure_open()?;
        let resolved = self
            .resolver
            .lock()
            .await
            .resolve_review(review_id, decision)?;

        let mut written = 0;
        for principal in self.all_principals().await {
            let _op = principal.lock().await;
            if !principal.store.contains(&resolved.key).await {
                continue;
            }
            let origin = Origin::Remote {
                author: "review",
                vector: resolved.vector.as_ref(),
            };
            if principal
                .put(
                    &resolved.key,
                    &resolved.value,
                    Some(&resolved.partition_id),
                    None,
                    origin,
                )
                .await?
            {
                written += 1;
            }
        }
        info!("review #{review_id} applied to {written} principals");
        Ok(written)
    }

    // ── Health ───────────────────────────────────────────────────

    pub async fn principal_statuses(&self) -> Vec<PrincipalStatus> {
        let mut statuses = Vec::new();
        for principal in self.all_principals().await {
            statuses.push(principal.status(self.config.degraded_utilization).await);
        }
        statuses
    }

    pub async fn principal_status(&self, id: &PrincipalId) -> Option<PrincipalStatus> {
        let principal = self.principal(id).await?;
        Some(principal.status(self.config.degraded_utilization).await)
    }

    /// Re-evaluates every principal's health and reports transitions.
    pub async fn check_health(&self) -> Vec<(PrincipalId, PrincipalHealth)> {
        let statuses = self.principal_statuses().await;
        let mut known = self.health.lock().await;
        let mut changed = Vec::new();
        for status in statuses {
            let previous = known
                .insert(status.principal_id.clone(), status.health)
                .unwrap_or(PrincipalHealth::Healthy);
            if previous != status.health {
                warn!(
                    "principal {} is now {} ({:.0}% used)",
                    status.principal_id,
                    status.health,
                    status.utilization * 100.0
                );
                self.emit(CoordinatorSignal::HealthChanged {
                    principal_id: status.principal_id.clone(),
                    from: previous,
                    to: status.health,
                });
                changed.push((status.principal_id, status.health));
            }
        }
        changed
    }

    /// Drops per-key clocks and history for keys a principal's store no
    /// longer holds (evicted, expired or collected), then prunes versions
    /// past the retention period.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let now = now_millis();
        for principal in self.all_principals().await {
            let _op = principal.lock().await;
            report.forgotten_keys += principal.forget_untracked().await;
            report.expired_versions += principal.versions().await.cleanup_expired(now);
        }
        if report != MaintenanceReport::default() {
            debug!(
                "maintenance: {} keys forgotten, {} versions expired",
                report.forgotten_keys, report.expired_versions
            );
        }
        report
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Starts delivery, every principal's background tasks, the health and
    /// maintenance tick and, with `auto_sync`, the sync scheduler.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broadcaster.start().await;
        for principal in self.all_principals().await {
            principal.store.start().await;
            principal.subscriber.start().await;
        }

        let mut tasks = self.tasks.lock().await;
        let me = self.me.clone();
        tasks.push(spawn_periodic(
            self.config.health_check_interval_ms,
            self.shutdown.subscribe(),
            move || {
                let me = me.clone();
                async move {
                    if let Some(coordinator) = me.upgrade() {
                        coordinator.check_health().await;
                        coordinator.run_maintenance().await;
                    }
                }
            },
        ));

        if self.config.auto_sync {
            let me = self.me.clone();
            tasks.push(spawn_periodic(
                self.config.sync_interval_ms,
                self.shutdown.subscribe(),
                move || {
                    let me = me.clone();
                    async move {
                        let Some(coordinator) = me.upgrade() else {
                            return;
                        };
                        if let Err(e) = coordinator.synchronize_all(SyncMode::Incremental).await {
                            debug!("scheduled sync skipped: {e}");
                        }
                    }
                },
            ));
        }
        info!("coordinator started ({} background tasks)", tasks.len());
    }

    /// Stops scheduling, drains queued events, closes every principal, then
    /// the broadcaster and finally the bus.
    pub async fn shutdown(&self) -> CoordinatorResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.pump_events().await;
        let principals: Vec<Arc<Principal>> = {
            let mut map = self.principals.write().await;
            std::mem::take(&mut *map).into_values().collect()
        };
        let mut first_error = None;
        for principal in &principals {
            let _op = principal.lock().await;
            if let Err(e) = principal.close().await {
                warn!("principal {} did not close cleanly: {e}", principal.id());
                first_error.get_or_insert(e);
            }
        }

        self.broadcaster.shutdown().await;
        self.bus.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        info!("coordinator shut down ({} principals)", principals.len());
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
