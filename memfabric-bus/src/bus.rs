//! The event bus.
//!
//! Every broadcast is stamped with a strictly increasing version and the
//! current time, appended to a bounded rolling history, and delivered to
//! each matching subscription before `broadcast` returns. Callback failures
//! are isolated per subscription and reported as [`BusSignal::SubscriberError`].

use crate::error::{BusError, BusResult};
use crate::filter::EventFilter;
use memfabric_types::{BusEvent, Millis, SubscriptionId, now_millis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

/// Callback invoked for each delivered event.
pub type EventCallback = Arc<dyn Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync>;

/// Configuration for an [`EventBus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// History ring capacity.
    pub max_event_history: usize,
    /// Events older than this are pruned from history (ms).
    pub event_ttl_ms: Millis,
    pub max_subscriptions: usize,
    /// Capacity of channel-backed subscriptions and of the signal channel.
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_event_history: 1000,
            event_ttl_ms: 60 * 60 * 1000,
            max_subscriptions: 1024,
            channel_capacity: 256,
        }
    }
}

/// Out-of-band notifications from the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusSignal {
    /// A subscription callback returned an error.
    SubscriberError {
        subscription_id: SubscriptionId,
        event_version: u64,
        error: String,
    },
    /// A channel-backed subscription was full; the event was not queued.
    EventDropped {
        subscription_id: SubscriptionId,
        event_version: u64,
    },
}

/// Counters since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub events_emitted: u64,
    pub events_delivered: u64,
    pub subscriber_errors: u64,
    pub events_dropped: u64,
    pub subscriptions: usize,
    pub history_len: usize,
}

#[derive(Clone)]
enum Sink {
    Callback(EventCallback),
    Channel(mpsc::Sender<BusEvent>),
}

struct Subscription {
    filter: EventFilter,
    sink: Sink,
}

#[derive(Default)]
struct BusState {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    history: VecDeque<BusEvent>,
    last_version: u64,
    stats: BusStats,
}

impl BusState {
    fn prune(&mut self, now: Millis, config: &BusConfig) {
        let cutoff = now.saturating_sub(config.event_ttl_ms);
        while self.history.front().is_some_and(|e| e.timestamp < cutoff) {
            self.history.pop_front();
        }
        while self.history.len() > config.max_event_history {
            self.history.pop_front();
        }
    }
}

enum Outcome {
    Delivered,
    Failed(String),
    Dropped,
    Disconnected,
}

/// In-process publish/subscribe hub with history and replay.
pub struct EventBus {
    config: BusConfig,
    state: Mutex<BusState>,
    signals: broadcast::Sender<BusSignal>,
    closed: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let (signals, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            config,
            state: Mutex::new(BusState::default()),
            signals,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Subscribes to bus signals.
    pub fn signals(&self) -> broadcast::Receiver<BusSignal> {
        self.signals.subscribe()
    }

    /// Registers a callback for events matching `filter`.
    pub async fn subscribe(
        &self,
        filter: EventFilter,
        callback: impl Fn(&BusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> BusResult<SubscriptionId> {
        self.add_subscription(filter, Sink::Callback(Arc::new(callback)))
            .await
    }

    /// Registers a bounded channel for events matching `filter`.
    ///
    /// When the receiver is full the event is dropped for this subscription
    /// and [`BusSignal::EventDropped`] is emitted. Dropping the receiver
    /// ends the subscription on the next delivery.
    pub async fn subscribe_channel(
        &self,
        filter: EventFilter,
    ) -> BusResult<(SubscriptionId, mpsc::Receiver<BusEvent>)> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let id = self.add_subscription(filter, Sink::Channel(tx)).await?;
        Ok((id, rx))
    }

    async fn add_subscription(&self, filter: EventFilter, sink: Sink) -> BusResult<SubscriptionId> {
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
        state.subscriptions.insert(id, Subscription { filter, sink });
        debug!("bus subscription {id} added");
        Ok(id)
    }

    /// Removes a subscription. Returns `false` if it did not exist.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.state.lock().await.subscriptions.remove(&id).is_some();
        if removed {
            debug!("bus subscription {id} removed");
        }
        removed
    }

    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    /// Stamps `event`, records it, and delivers it to every matching
    /// subscription. Returns the stamped event.
    pub async fn broadcast(&self, mut event: BusEvent) -> BusResult<BusEvent> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let now = now_millis();
        let targets: Vec<(SubscriptionId, Sink)> = {
            let mut state = self.state.lock().await;
            state.last_version += 1;
            event.version = state.last_version;
            event.timestamp = now;
            state.history.push_back(event.clone());
            state.prune(now, &self.config);
            state.stats.events_emitted += 1;
            state
                .subscriptions
                .iter()
                .filter(|(_, s)| s.filter.matches(&event, now))
                .map(|(id, s)| (*id, s.sink.clone()))
                .collect()
        };

        let outcomes: Vec<(SubscriptionId, Outcome)> = targets
            .into_iter()
            .map(|(id, sink)| (id, deliver(&sink, &event)))
            .collect();
        self.record(&event, outcomes).await;
        Ok(event)
    }

    /// Re-delivers historical events matching the subscription's filter,
    /// oldest first, optionally only those at or after `from_timestamp`.
    /// Returns how many were delivered.
    pub async fn replay_events(
        &self,
        id: SubscriptionId,
        from_timestamp: Option<Millis>,
    ) -> BusResult<usize> {
        let now = now_millis();
        let (sink, events) = {
            let mut state = self.state.lock().await;
            state.prune(now, &self.config);
            let sub = state
                .subscriptions
                .get(&id)
                .ok_or(BusError::SubscriptionNotFound(id))?;
            let events: Vec<BusEvent> = state
                .history
                .iter()
                .filter(|e| from_timestamp.is_none_or(|from| e.timestamp >= from))
                .filter(|e| sub.filter.matches(e, now))
                .cloned()
                .collect();
            (sub.sink.clone(), events)
        };

        let mut delivered = 0;
        for event in &events {
            let outcome = deliver(&sink, event);
            if matches!(outcome, Outcome::Delivered) {
                delivered += 1;
            }
            self.record(event, vec![(id, outcome)]).await;
        }
        debug!("replayed {delivered}/{} events to {id}", events.len());
        Ok(delivered)
    }

    /// Unexpired events, oldest first. `partition_id` restricts to one
    /// partition; `limit` keeps only the most recent `limit`.
    pub async fn event_history(
        &self,
        partition_id: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<BusEvent> {
        let mut state = self.state.lock().await;
        state.prune(now_millis(), &self.config);
        let matching: Vec<&BusEvent> = state
            .history
            .iter()
            .filter(|e| partition_id.is_none_or(|p| e.partition_id == p))
            .collect();
        let skip = limit.map_or(0, |l| matching.len().saturating_sub(l));
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub async fn clear_history(&self) {
        self.state.lock().await.history.clear();
    }

    /// The version of the most recent broadcast (0 if none).
    pub async fn last_version(&self) -> u64 {
        self.state.lock().await.last_version
    }

    pub async fn stats(&self) -> BusStats {
        let mut state = self.state.lock().await;
        state.prune(now_millis(), &self.config);
        BusStats {
            subscriptions: state.subscriptions.len(),
            history_len: state.history.len(),
            ..state.stats
        }
    }

    /// Rejects further broadcasts and drops all subscriptions.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        let count = state.subscriptions.len();
        state.subscriptions.clear();
        info!("event bus shut down ({count} subscriptions dropped)");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn record(&self, event: &BusEvent, outcomes: Vec<(SubscriptionId, Outcome)>) {
        let mut state = self.state.lock().await;
        for (id, outcome) in outcomes {
            match outcome {
                Outcome::Delivered => state.stats.events_delivered += 1,
                Outcome::Failed(error) => {
                    state.stats.subscriber_errors += 1;
                    warn!("subscriber {id} failed on event {}: {error}", event.version);
                    let _ = self.signals.send(BusSignal::SubscriberError {
                        subscription_id: id,
                        event_version: event.version,
                        error,
                    });
                }
                Outcome::Dropped => {
                    state.stats.events_dropped += 1;
                    let _ = self.signals.send(BusSignal::EventDropped {
                        subscription_id: id,
                        event_version: event.version,
                    });
                }
                Outcome::Disconnected => {
                    state.subscriptions.remove(&id);
                    debug!("bus subscription {id} closed by receiver");
                }
            }
        }
    }
}

fn deliver(sink: &Sink, event: &BusEvent) -> Outcome {
    match sink {
        Sink::Callback(callback) => match callback(event) {
            Ok(()) => Outcome::Delivered,
            Err(e) => Outcome::Failed(format!("{e:#}")),
        },
        Sink::Channel(tx) => match tx.try_send(event.clone()) {
            Ok(()) => Outcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Outcome::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Outcome::Disconnected,
        },
    }
}
