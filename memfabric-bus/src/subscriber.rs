//! Buffered, filtered, batching consumer.
//!
//! Incoming events land in one bounded ring buffer (oldest dropped on
//! overflow). Draining takes up to `batch_size` events at a time and hands
//! each active subscription the slice that passes its filter. A callback
//! error moves only that subscription to [`SubscriptionState::Error`]; with
//! `auto_reconnect` it comes back through `Reconnecting` after
//! `reconnect_delay_ms`.

use crate::bus::EventBus;
use crate::error::{BusError, BusResult};
use crate::filter::EventFilter;
use memfabric_types::{BusEvent, Millis, SubscriptionId, now_millis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Callback receiving one batch of matching events.
pub type BatchCallback = Arc<dyn Fn(&[BusEvent]) -> anyhow::Result<()> + Send + Sync>;

/// Configuration for a [`Subscriber`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    pub buffer_size: usize,
    pub batch_size: usize,
    /// A partial batch is flushed once this long has passed (ms).
    pub batch_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub max_subscriptions: usize,
    pub signal_capacity: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            batch_size: 10,
            batch_timeout_ms: 100,
            auto_reconnect: true,
            reconnect_delay_ms: 1000,
            max_subscriptions: 256,
            signal_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Active,
    Paused,
    Error,
    Reconnecting,
}

/// Out-of-band notifications from the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberSignal {
    /// The buffer was full; the oldest event was discarded.
    BufferOverflow { dropped_version: u64 },
    CallbackFailed {
        subscription_id: SubscriptionId,
        error: String,
    },
    StateChanged {
        subscription_id: SubscriptionId,
        from: SubscriptionState,
        to: SubscriptionState,
    },
}

/// Counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    pub received: u64,
    pub processed: u64,
    pub dropped: u64,
    pub callback_failures: u64,
    pub buffered: usize,
    pub subscriptions: usize,
}

struct Subscription {
    filter: EventFilter,
    callback: BatchCallback,
    state: SubscriptionState,
    failed_at: Option<Instant>,
    delivered: u64,
}

struct SubscriberState {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    buffer: VecDeque<BusEvent>,
    /// Recently processed events, kept for replay.
    recent: VecDeque<BusEvent>,
    last_flush: Instant,
    stats: SubscriberStats,
}

/// Consumes events from a bus (or any producer) on behalf of callbacks.
pub struct Subscriber {
    me: Weak<Self>,
    name: String,
    config: SubscriberConfig,
    state: Mutex<SubscriberState>,
    signals: broadcast::Sender<SubscriberSignal>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    attachments: Mutex<Vec<(Arc<EventBus>, SubscriptionId)>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Subscriber {
    pub fn new(name: impl Into<String>, config: SubscriberConfig) -> Arc<Self> {
        let (signals, _) = broadcast::channel(config.signal_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.into(),
            state: Mutex::new(SubscriberState {
                subscriptions: BTreeMap::new(),
                buffer: VecDeque::with_capacity(config.buffer_size.min(1024)),
                recent: VecDeque::new(),
                last_flush: Instant::now(),
                stats: SubscriberStats::default(),
            }),
            config,
            signals,
            tasks: Mutex::new(Vec::new()),
            attachments: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signals(&self) -> broadcast::Receiver<SubscriberSignal> {
        self.signals.subscribe()
    }

    /// Registers a batch callback for events matching `filter`.
    pub async fn subscribe(
        &self,
        filter: EventFilter,
        callback: impl Fn(&[BusEvent]) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> BusResult<SubscriptionId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let mut state = self.state.lock().await;
        if state.subscriptions.len() >= self.config.max_subscriptions {
            return Err(BusError::SubscriptionLimit {
                limit: self.config.max_subscriptions,
            });
        }
        let id = SubscriptionId::new();
        state.subscriptions.insert(
            id,
            Subscription {
                filter,
                callback: Arc::new(callback),
                state: SubscriptionState::Active,
                failed_at: None,
                delivered: 0,
            },
        );
        Ok(id)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.state.lock().await.subscriptions.remove(&id).is_some()
    }

    /// Stops deliveries to a subscription until resumed.
    pub async fn pause_subscription(&self, id: SubscriptionId) -> bool {
        self.transition(id, |s| {
            (s != SubscriptionState::Paused).then_some(SubscriptionState::Paused)
        })
        .await
    }

    /// Re-activates a paused or failed subscription.
    pub async fn resume_subscription(&self, id: SubscriptionId) -> bool {
        self.transition(id, |s| {
            (s != SubscriptionState::Active).then_some(SubscriptionState::Active)
        })
        .await
    }

    pub async fn subscription_state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.state.lock().await.subscriptions.get(&id).map(|s| s.state)
    }

    /// Events delivered to a subscription so far.
    pub async fn delivered_count(&self, id: SubscriptionId) -> Option<u64> {
        self.state.lock().await.subscriptions.get(&id).map(|s| s.delivered)
    }

    async fn transition(
        &self,
        id: SubscriptionId,
        next: impl Fn(SubscriptionState) -> Option<SubscriptionState>,
    ) -> bool {
        let mut state = self.state.lock().await;
        let Some(sub) = state.subscriptions.get_mut(&id) else {
            return false;
        };
        let from = sub.state;
        let Some(to) = next(from) else {
            return false;
        };
        sub.state = to;
        sub.failed_at = None;
        self.emit(SubscriberSignal::StateChanged {
            subscription_id: id,
            from,
            to,
        });
        true
    }

    /// Appends an event to the buffer, dropping the oldest on overflow.
    pub async fn push(&self, event: BusEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        state.stats.received += 1;
        if state.buffer.len() >= self.config.buffer_size.max(1) {
            if let Some(dropped) = state.buffer.pop_front() {
                state.stats.dropped += 1;
                self.emit(SubscriberSignal::BufferOverflow {
                    dropped_version: dropped.version,
                });
            }
        }
        state.buffer.push_back(event);
    }

    /// Feeds this subscriber from a bus subscription with `filter`.
    ///
    /// Events are forwarded by a background task until shutdown.
    pub async fn attach(
        &self,
        bus: &Arc<EventBus>,
        filter: EventFilter,
    ) -> BusResult<SubscriptionId> {
        let (id, mut rx) = bus.subscribe_channel(filter).await?;
        let me = self.me.clone();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => {
                        let (Some(event), Some(subscriber)) = (received, me.upgrade()) else {
                            break;
                        };
                        subscriber.push(event).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.push(task);
        self.attachments.lock().await.push((Arc::clone(bus), id));
        debug!("[{}] attached to bus as {id}", self.name);
        Ok(id)
    }

    /// One drain step. Delivers a batch if `force` is set, the buffer holds
    /// a full batch, or the batch timeout has elapsed. Returns the number of
    /// events taken from the buffer.
    pub async fn process_pending(&self, force: bool) -> usize {
        self.recover().await;

        let (batch, targets) = {
            let mut state = self.state.lock().await;
            let timed_out =
                state.last_flush.elapsed() >= Duration::from_millis(self.config.batch_timeout_ms);
            let full = state.buffer.len() >= self.config.batch_size.max(1);
            if state.buffer.is_empty() || !(force || full || timed_out) {
                return 0;
            }
            let take = state.buffer.len().min(self.config.batch_size.max(1));
            let batch: Vec<BusEvent> = state.buffer.drain(..take).collect();
            state.last_flush = Instant::now();
            state.stats.processed += batch.len() as u64;

            for event in &batch {
                state.recent.push_back(event.clone());
            }
            while state.recent.len() > self.config.buffer_size {
                state.recent.pop_front();
            }

            let targets: Vec<(SubscriptionId, EventFilter, BatchCallback)> = state
                .subscriptions
                .iter()
                .filter(|(_, s)| s.state == SubscriptionState::Active)
                .map(|(id, s)| (*id, s.filter.clone(), Arc::clone(&s.callback)))
                .collect();
            (batch, targets)
        };

        let now = now_millis();
        let mut results = Vec::with_capacity(targets.len());
        for (id, filter, callback) in targets {
            let matching: Vec<BusEvent> = batch
                .iter()
                .filter(|e| filter.matches(e, now))
                .cloned()
                .collect();
            if matching.is_empty() {
                continue;
            }
            let result = callback(&matching).map_err(|e| format!("{e:#}"));
            results.push((id, matching.len() as u64, result));
        }
        self.record(results).await;
        batch.len()
    }

    /// Re-delivers recently processed events to one subscription, at or
    /// after `from_timestamp` if given. Returns how many were delivered.
    pub async fn replay_events(
        &self,
        id: SubscriptionId,
        from_timestamp: Option<Millis>,
    ) -> BusResult<usize> {
        let now = now_millis();
        let (events, callback) = {
            let state = self.state.lock().await;
            let sub = state
                .subscriptions
                .get(&id)
                .ok_or(BusError::SubscriptionNotFound(id))?;
            let events: Vec<BusEvent> = state
                .recent
                .iter()
                .filter(|e| from_timestamp.is_none_or(|from| e.timestamp >= from))
                .filter(|e| sub.filter.matches(e, now))
                .cloned()
                .collect();
            (events, Arc::clone(&sub.callback))
        };
        if events.is_empty() {
            return Ok(0);
        }
        let count = events.len();
        let result = callback(&events).map_err(|e| format!("{e:#}"));
        let ok = result.is_ok();
        self.record(vec![(id, count as u64, result)]).await;
        Ok(if ok { count } else { 0 })
    }

    async fn record(&self, results: Vec<(SubscriptionId, u64, Result<(), String>)>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Instant::now();
        for (id, count, result) in results {
            let Some(sub) = state.subscriptions.get_mut(&id) else {
                continue;
            };
            match result {
                Ok(()) => sub.delivered += count,
                Err(error) => {
                    let from = sub.state;
                    sub.state = SubscriptionState::Error;
                    sub.failed_at = Some(now);
                    state.stats.callback_failures += 1;
                    warn!("[{}] subscription {id} callback failed: {error}", self.name);
                    self.emit(SubscriberSignal::CallbackFailed {
                        subscription_id: id,
                        error,
                    });
                    if from != SubscriptionState::Error {
                        self.emit(SubscriberSignal::StateChanged {
                            subscription_id: id,
                            from,
                            to: SubscriptionState::Error,
                        });
                    }
                }
            }
        }
    }

    /// Moves failed subscriptions whose reconnect delay has passed back to
    /// active, through `Reconnecting`.
    async fn recover(&self) {
        if !self.config.auto_reconnect {
            return;
        }
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);
        let mut state = self.state.lock().await;
        for (id, sub) in &mut state.subscriptions {
            let due = sub.state == SubscriptionState::Error
                && sub.failed_at.is_some_and(|t| t.elapsed() >= delay);
            if !due {
                continue;
            }
            for (from, to) in [
                (SubscriptionState::Error, SubscriptionState::Reconnecting),
                (SubscriptionState::Reconnecting, SubscriptionState::Active),
            ] {
                sub.state = to;
                self.emit(SubscriberSignal::StateChanged {
                    subscription_id: *id,
                    from,
                    to,
                });
            }
            sub.failed_at = None;
            info!("[{}] subscription {id} reconnected", self.name);
        }
    }

    pub async fn stats(&self) -> SubscriberStats {
        let state = self.state.lock().await;
        SubscriberStats {
            buffered: state.buffer.len(),
            subscriptions: state.subscriptions.len(),
            ..state.stats
        }
    }

    /// Starts the periodic drain at `batch_timeout_ms`.
    pub async fn start(&self) {
        let me = self.me.clone();
        let mut shutdown = self.shutdown.subscribe();
        let period = Duration::from_millis(self.config.batch_timeout_ms.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(subscriber) = me.upgrade() else { break };
                        subscriber.process_pending(false).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    /// Detaches from buses, stops background tasks, and delivers whatever
    /// is still buffered.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (bus, id) in self.attachments.lock().await.drain(..) {
            bus.unsubscribe(id).await;
        }
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        while self.process_pending(true).await > 0 {}
        info!("[{}] subscriber shut down", self.name);
    }

    fn emit(&self, signal: SubscriberSignal) {
        let _ = self.signals.send(signal);
    }
}
