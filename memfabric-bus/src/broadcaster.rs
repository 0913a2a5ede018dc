//! Rate-limited, channelled delivery with retry.
//!
//! Each channel owns a bounded FIFO. Enqueueing into a full channel drops
//! the oldest queued message. Once [`Broadcaster::start`] has been called,
//! every channel is drained by its own task at one message per
//! `max(1000 / rate_limit, 10)` ms. A failed delivery is re-queued at the
//! front with linear backoff until `retry_attempts` retries are used up,
//! so a message reaches the sink at most `retry_attempts + 1` times.

use crate::bus::EventBus;
use crate::error::{BusError, BusResult};
use async_trait::async_trait;
use memfabric_types::{BusEvent, ChannelId, MessageId, Millis, now_millis};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lower bound on a channel's drain interval.
pub const MIN_DRAIN_INTERVAL_MS: u64 = 10;

/// Configuration for a [`Broadcaster`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Queue bound for channels created without one.
    pub default_queue_size: usize,
    /// Messages per second for channels created without a rate.
    pub default_rate_limit: u32,
    pub retry_attempts: u32,
    /// Base retry delay; the n-th retry waits `n * retry_delay_ms`.
    pub retry_delay_ms: u64,
    pub signal_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            default_queue_size: 1000,
            default_rate_limit: 100,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            signal_capacity: 256,
        }
    }
}

/// A message queued on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub event: BusEvent,
    pub created_at: Millis,
    pub retry_count: u32,
}

/// Where drained messages go.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Delivers one message. An error schedules a retry.
    async fn deliver(&self, message: &BroadcastMessage) -> anyhow::Result<()>;
}

/// Delivers messages by broadcasting their event on an [`EventBus`].
pub struct BusSink {
    bus: Arc<EventBus>,
}

impl BusSink {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl DeliverySink for BusSink {
    async fn deliver(&self, message: &BroadcastMessage) -> anyhow::Result<()> {
        self.bus.broadcast(message.event.clone()).await?;
        Ok(())
    }
}

/// Out-of-band notifications from the broadcaster.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastSignal {
    MessageDelivered {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    /// Evicted from a full queue before delivery.
    MessageDropped {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    MessageRetry {
        channel_id: ChannelId,
        message_id: MessageId,
        retry_count: u32,
        delay_ms: u64,
    },
    /// Retries exhausted; the message is gone.
    MessageFailed {
        channel_id: ChannelId,
        message_id: MessageId,
        error: String,
    },
}

/// Per-channel counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub name: String,
    pub priority: u8,
    pub queued: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub retried: u64,
    pub failed: u64,
}

/// Result of one drain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Nothing queued.
    Idle,
    /// The head message is waiting out its retry delay.
    Deferred,
    Delivered(MessageId),
    Retrying(MessageId),
    Failed(MessageId),
    /// Delivery failed and the queue refilled meanwhile, so the message
    /// was dropped as the oldest instead of being retried.
    Dropped(MessageId),
}

struct Queued {
    message: BroadcastMessage,
    not_before: Option<Instant>,
}

struct Channel {
    name: String,
    partition_ids: HashSet<String>,
    priority: u8,
    queue_size: usize,
    rate_limit: u32,
    queue: VecDeque<Queued>,
    stats: ChannelStats,
}

impl Channel {
    fn interested_in(&self, partition_id: &str) -> bool {
        self.partition_ids.is_empty() || self.partition_ids.contains(partition_id)
    }

    fn drain_interval(&self) -> Duration {
        let per_message = 1000 / u64::from(self.rate_limit.max(1));
        Duration::from_millis(per_message.max(MIN_DRAIN_INTERVAL_MS))
    }
}

/// Fans events out over named, rate-limited channels.
pub struct Broadcaster {
    me: Weak<Self>,
    config: BroadcasterConfig,
    sink: Arc<dyn DeliverySink>,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    signals: broadcast::Sender<BroadcastSignal>,
    tasks: Mutex<HashMap<ChannelId, JoinHandle<()>>>,
    running: AtomicBool,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Broadcaster {
    pub fn new(config: BroadcasterConfig, sink: Arc<dyn DeliverySink>) -> Arc<Self> {
        let (signals, _) = broadcast::channel(config.signal_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            sink,
            channels: Mutex::new(HashMap::new()),
            signals,
            tasks: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.config
    }

    pub fn signals(&self) -> broadcast::Receiver<BroadcastSignal> {
        self.signals.subscribe()
    }

    /// Creates a channel. `partition_ids` scopes [`route`](Self::route);
    /// an empty set means every partition.
    pub async fn create_channel<I, S>(
        &self,
        name: &str,
        partition_ids: I,
        priority: u8,
        queue_size: Option<usize>,
        rate_limit: Option<u32>,
    ) -> BusResult<ChannelId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let id = ChannelId::new();
        let channel = Channel {
            name: name.to_string(),
            partition_ids: partition_ids.into_iter().map(Into::into).collect(),
            priority,
            queue_size: queue_size.unwrap_or(self.config.default_queue_size).max(1),
            rate_limit: rate_limit.unwrap_or(self.config.default_rate_limit),
            queue: VecDeque::new(),
            stats: ChannelStats {
                name: name.to_string(),
                priority,
                ..Default::default()
            },
        };
        let interval = channel.drain_interval();
        self.channels.lock().await.insert(id, channel);
        info!("created channel {name} ({id}), drain every {interval:?}");

        if self.running.load(Ordering::SeqCst) {
            self.spawn_drain(id, interval).await;
        }
        Ok(id)
    }

    /// Removes a channel, discarding anything still queued.
    pub async fn remove_channel(&self, id: ChannelId) -> bool {
        if let Some(task) = self.tasks.lock().await.remove(&id) {
            task.abort();
        }
        let removed = self.channels.lock().await.remove(&id);
        if let Some(channel) = &removed {
            debug!(
                "removed channel {} with {} queued",
                channel.name,
                channel.queue.len()
            );
        }
        removed.is_some()
    }

    /// Ids of all channels, highest priority first.
    pub async fn channel_ids(&self) -> Vec<ChannelId> {
        let channels = self.channels.lock().await;
        let mut ids: Vec<(u8, ChannelId)> =
            channels.iter().map(|(id, c)| (c.priority, *id)).collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn channel_stats(&self, id: ChannelId) -> Option<ChannelStats> {
        self.channels.lock().await.get(&id).map(|c| ChannelStats {
            queued: c.queue.len(),
            ..c.stats.clone()
        })
    }

    /// Queues `event` on a channel.
    pub async fn broadcast(&self, channel_id: ChannelId, event: BusEvent) -> BusResult<MessageId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let mut channels = self.channels.lock().await;
        let channel = channels
            .get_mut(&channel_id)
            .ok_or(BusError::ChannelNotFound(channel_id))?;

        let message = BroadcastMessage {
            id: MessageId::new(),
            channel_id,
            event,
            created_at: now_millis(),
            retry_count: 0,
        };
        let id = message.id;

        while channel.queue.len() >= channel.queue_size {
            let Some(dropped) = channel.queue.pop_front() else {
                break;
            };
            channel.stats.dropped += 1;
            debug!(
                "channel {} full, dropped {}",
                channel.name, dropped.message.id
            );
            self.emit(BroadcastSignal::MessageDropped {
                channel_id,
                message_id: dropped.message.id,
            });
        }
        channel.queue.push_back(Queued {
            message,
            not_before: None,
        });
        channel.stats.enqueued += 1;
        Ok(id)
    }

    /// Queues `event` on each channel. Results are in input order.
    pub async fn broadcast_to_multiple(
        &self,
        channel_ids: &[ChannelId],
        event: &BusEvent,
    ) -> Vec<BusResult<MessageId>> {
        let mut results = Vec::with_capacity(channel_ids.len());
        for id in channel_ids {
            results.push(self.broadcast(*id, event.clone()).await);
        }
        results
    }

    /// Queues `event` on every channel interested in its partition,
    /// highest priority first. Returns the channels used.
    pub async fn route(&self, event: &BusEvent) -> BusResult<Vec<ChannelId>> {
        let targets: Vec<ChannelId> = {
            let channels = self.channels.lock().await;
            let mut targets: Vec<(u8, ChannelId)> = channels
                .iter()
                .filter(|(_, c)| c.interested_in(&event.partition_id))
                .map(|(id, c)| (c.priority, *id))
                .collect();
            targets.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            targets.into_iter().map(|(_, id)| id).collect()
        };
        for id in &targets {
            self.broadcast(*id, event.clone()).await?;
        }
        Ok(targets)
    }

    /// Performs one drain step on a channel.
    pub async fn pump(&self, channel_id: ChannelId) -> BusResult<PumpOutcome> {
        self.pump_inner(channel_id, true).await
    }

    /// Pumps every channel until none has a deliverable head message.
    /// Deferred retries are left queued. Returns the number of steps taken.
    pub async fn drain_ready(&self) -> usize {
        let mut steps = 0;
        loop {
            let mut progressed = false;
            for id in self.channel_ids().await {
                match self.pump(id).await {
                    Ok(PumpOutcome::Idle | PumpOutcome::Deferred) | Err(_) => {}
                    Ok(_) => {
                        steps += 1;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                return steps;
            }
        }
    }

    async fn pump_inner(&self, channel_id: ChannelId, allow_retry: bool) -> BusResult<PumpOutcome> {
        let queued = {
            let mut channels = self.channels.lock().await;
            let channel = channels
                .get_mut(&channel_id)
                .ok_or(BusError::ChannelNotFound(channel_id))?;
            let Some(head) = channel.queue.pop_front() else {
                return Ok(PumpOutcome::Idle);
            };
            if allow_retry && head.not_before.is_some_and(|t| Instant::now() < t) {
                channel.queue.push_front(head);
                return Ok(PumpOutcome::Deferred);
            }
            head
        };

        let result = self.sink.deliver(&queued.message).await;

        let mut channels = self.channels.lock().await;
        let Some(channel) = channels.get_mut(&channel_id) else {
            return Ok(PumpOutcome::Idle);
        };
        let mut message = queued.message;
        let message_id = message.id;

        match result {
            Ok(()) => {
                channel.stats.delivered += 1;
                self.emit(BroadcastSignal::MessageDelivered {
                    channel_id,
                    message_id,
                });
                Ok(PumpOutcome::Delivered(message_id))
            }
            Err(e) => {
                message.retry_count += 1;
                let wants_retry = allow_retry && message.retry_count <= self.config.retry_attempts;
                if wants_retry && channel.queue.len() >= channel.queue_size {
                    channel.stats.dropped += 1;
                    debug!(
                        "channel {} full, dropped {message_id} instead of retrying ({e:#})",
                        channel.name
                    );
                    self.emit(BroadcastSignal::MessageDropped {
                        channel_id,
                        message_id,
                    });
                    Ok(PumpOutcome::Dropped(message_id))
                } else if wants_retry {
                    let delay_ms = self.config.retry_delay_ms * u64::from(message.retry_count);
                    channel.stats.retried += 1;
                    debug!(
                        "delivery of {message_id} on {} failed ({e:#}), retry {} in {delay_ms}ms",
                        channel.name, message.retry_count
                    );
                    self.emit(BroadcastSignal::MessageRetry {
                        channel_id,
                        message_id,
                        retry_count: message.retry_count,
                        delay_ms,
                    });
                    channel.queue.push_front(Queued {
                        message,
                        not_before: Some(Instant::now() + Duration::from_millis(delay_ms)),
                    });
                    Ok(PumpOutcome::Retrying(message_id))
                } else {
                    channel.stats.failed += 1;
                    warn!(
                        "message {message_id} on {} failed permanently: {e:#}",
                        channel.name
                    );
                    self.emit(BroadcastSignal::MessageFailed {
                        channel_id,
                        message_id,
                        error: format!("{e:#}"),
                    });
                    Ok(PumpOutcome::Failed(message_id))
                }
            }
        }
    }

    /// Starts a drain task for every channel, and for channels created later.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let intervals: Vec<(ChannelId, Duration)> = self
            .channels
            .lock()
            .await
            .iter()
            .map(|(id, c)| (*id, c.drain_interval()))
            .collect();
        for (id, interval) in intervals {
            self.spawn_drain(id, interval).await;
        }
    }

    async fn spawn_drain(&self, id: ChannelId, interval: Duration) {
        let me = self.me.clone();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(broadcaster) = me.upgrade() else { break };
                        if let Err(BusError::ChannelNotFound(_)) = broadcaster.pump(id).await {
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        self.tasks.lock().await.insert(id, task);
    }

    /// Stops drain tasks, then makes one final pass delivering every
    /// queued message once without retry. Later broadcasts fail.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain().map(|(_, t)| t).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.running.store(false, Ordering::SeqCst);

        let mut flushed = 0;
        for id in self.channel_ids().await {
            while let Ok(outcome) = self.pump_inner(id, false).await {
                if outcome == PumpOutcome::Idle {
                    break;
                }
                flushed += 1;
            }
        }
        info!("broadcaster shut down, final pass handled {flushed} messages");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn emit(&self, signal: BroadcastSignal) {
        let _ = self.signals.send(signal);
    }
}
