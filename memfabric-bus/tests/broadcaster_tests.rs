use async_trait::async_trait;
use memfabric_bus::{
    BroadcastMessage, BroadcastSignal, Broadcaster, BroadcasterConfig, BusError, BusSink,
    DeliverySink, EventBus, PumpOutcome,
};
use memfabric_types::{BusEvent, MessageId, Value};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fails the first `fail_first` deliveries, then succeeds.
#[derive(Default)]
struct ScriptedSink {
    fail_first: usize,
    calls: AtomicUsize,
    delivered: Mutex<Vec<MessageId>>,
}

impl ScriptedSink {
    fn failing(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_first,
            ..Default::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn delivered(&self) -> Vec<MessageId> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliverySink for ScriptedSink {
    async fn deliver(&self, message: &BroadcastMessage) -> anyhow::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            anyhow::bail!("delivery {n} refused");
        }
        self.delivered.lock().unwrap().push(message.id);
        Ok(())
    }
}

/// Signals `entered` when a delivery starts, then fails once `release`
/// is notified.
#[derive(Default)]
struct GatedSink {
    entered: tokio::sync::Notify,
    release: tokio::sync::Notify,
}

#[async_trait]
impl DeliverySink for GatedSink {
    async fn deliver(&self, _message: &BroadcastMessage) -> anyhow::Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        anyhow::bail!("receiver unavailable")
    }
}

fn event(key: &str) -> BusEvent {
    BusEvent::store(key, "default", Value::from(key), "test")
}

fn config(retry_attempts: u32) -> BroadcasterConfig {
    BroadcasterConfig {
        retry_attempts,
        retry_delay_ms: 100,
        ..Default::default()
    }
}

// ── Queueing ─────────────────────────────────────────────────────

#[tokio::test]
async fn pump_delivers_in_fifo_order() {
    let sink = ScriptedSink::failing(0);
    let broadcaster = Broadcaster::new(config(3), sink.clone());
    let channel = broadcaster
        .create_channel("main", ["default"], 5, None, None)
        .await
        .unwrap();

    let first = broadcaster.broadcast(channel, event("a")).await.unwrap();
    let second = broadcaster.broadcast(channel, event("b")).await.unwrap();

    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Delivered(first));
    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Delivered(second));
    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Idle);
    assert_eq!(sink.delivered(), vec![first, second]);
}

#[tokio::test]
async fn overflow_drops_oldest() {
    let sink = ScriptedSink::failing(0);
    let broadcaster = Broadcaster::new(config(3), sink.clone());
    let mut signals = broadcaster.signals();
    let channel = broadcaster
        .create_channel("small", Vec::<String>::new(), 1, Some(2), None)
        .await
        .unwrap();

    let oldest = broadcaster.broadcast(channel, event("a")).await.unwrap();
    broadcaster.broadcast(channel, event("b")).await.unwrap();
    broadcaster.broadcast(channel, event("c")).await.unwrap();

    assert_eq!(
        signals.recv().await.unwrap(),
        BroadcastSignal::MessageDropped {
            channel_id: channel,
            message_id: oldest
        }
    );
    let stats = broadcaster.channel_stats(channel).await.unwrap();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.enqueued, 3);
}

#[tokio::test]
async fn failed_delivery_is_not_requeued_into_a_full_queue() {
    let sink = Arc::new(GatedSink::default());
    let broadcaster = Broadcaster::new(config(3), sink.clone());
    let channel = broadcaster
        .create_channel("small", Vec::<String>::new(), 1, Some(2), None)
        .await
        .unwrap();
    let head = broadcaster.broadcast(channel, event("a")).await.unwrap();

    let pumping = {
        let broadcaster = Arc::clone(&broadcaster);
        tokio::spawn(async move { broadcaster.pump(channel).await })
    };
    sink.entered.notified().await;
    broadcaster.broadcast(channel, event("b")).await.unwrap();
    broadcaster.broadcast(channel, event("c")).await.unwrap();
    sink.release.notify_one();

    assert_eq!(pumping.await.unwrap().unwrap(), PumpOutcome::Dropped(head));
    let stats = broadcaster.channel_stats(channel).await.unwrap();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.retried, 0);
}

#[tokio::test]
async fn unknown_channel_is_reported() {
    let broadcaster = Broadcaster::new(config(3), ScriptedSink::failing(0));
    let missing = memfabric_types::ChannelId::new();
    assert!(matches!(
        broadcaster.broadcast(missing, event("a")).await,
        Err(BusError::ChannelNotFound(id)) if id == missing
    ));
    assert!(!broadcaster.remove_channel(missing).await);
}

#[tokio::test]
async fn broadcast_to_multiple_reports_per_channel() {
    let broadcaster = Broadcaster::new(config(3), ScriptedSink::failing(0));
    let a = broadcaster
        .create_channel("a", ["default"], 1, None, None)
        .await
        .unwrap();
    let missing = memfabric_types::ChannelId::new();

    let results = broadcaster.broadcast_to_multiple(&[a, missing], &event("k")).await;
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
}

#[tokio::test]
async fn route_targets_interested_channels_by_priority() {
    let broadcaster = Broadcaster::new(config(3), ScriptedSink::failing(0));
    let low = broadcaster
        .create_channel("low", ["default"], 1, None, None)
        .await
        .unwrap();
    let high = broadcaster
        .create_channel("high", Vec::<String>::new(), 9, None, None)
        .await
        .unwrap();
    broadcaster
        .create_channel("other", ["cache"], 5, None, None)
        .await
        .unwrap();

    let routed = broadcaster.route(&event("k")).await.unwrap();
    assert_eq!(routed, vec![high, low]);
}

// ── Retry ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn failing_sink_is_tried_retry_attempts_plus_one_times() {
    let sink = ScriptedSink::failing(usize::MAX);
    let broadcaster = Broadcaster::new(config(2), sink.clone());
    let mut signals = broadcaster.signals();
    let channel = broadcaster
        .create_channel("main", ["default"], 5, None, None)
        .await
        .unwrap();
    let id = broadcaster.broadcast(channel, event("a")).await.unwrap();

    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Retrying(id));
    // Linear backoff: first retry waits 100ms.
    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Deferred);
    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Retrying(id));
    // Second retry waits 200ms.
    tokio::time::advance(Duration::from_millis(150)).await;
    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Deferred);
    tokio::time::advance(Duration::from_millis(50)).await;
    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Failed(id));

    assert_eq!(sink.calls(), 3);
    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Idle);

    let mut failed = false;
    while let Ok(signal) = signals.try_recv() {
        if let BroadcastSignal::MessageFailed { message_id, .. } = signal {
            assert_eq!(message_id, id);
            failed = true;
        }
    }
    assert!(failed);
    assert_eq!(broadcaster.channel_stats(channel).await.unwrap().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_to_success() {
    let sink = ScriptedSink::failing(1);
    let broadcaster = Broadcaster::new(config(3), sink.clone());
    let channel = broadcaster
        .create_channel("main", ["default"], 5, None, None)
        .await
        .unwrap();
    let id = broadcaster.broadcast(channel, event("a")).await.unwrap();

    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Retrying(id));
    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(broadcaster.pump(channel).await.unwrap(), PumpOutcome::Delivered(id));

    let stats = broadcaster.channel_stats(channel).await.unwrap();
    assert_eq!((stats.retried, stats.delivered), (1, 1));
}

// ── Background drain ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn drain_task_respects_rate_limit() {
    let sink = ScriptedSink::failing(0);
    let broadcaster = Broadcaster::new(config(3), sink.clone());
    let channel = broadcaster
        .create_channel("slow", ["default"], 5, None, Some(10))
        .await
        .unwrap();
    for key in ["a", "b", "c", "d", "e"] {
        broadcaster.broadcast(channel, event(key)).await.unwrap();
    }

    broadcaster.start().await;
    // Ticks at 0, 100 and 200ms.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(sink.delivered().len(), 3);

    broadcaster.shutdown().await;
    assert_eq!(sink.delivered().len(), 5);
}

#[tokio::test]
async fn shutdown_makes_one_final_pass_without_retry() {
    let sink = ScriptedSink::failing(usize::MAX);
    let broadcaster = Broadcaster::new(config(3), sink.clone());
    let channel = broadcaster
        .create_channel("main", ["default"], 5, None, None)
        .await
        .unwrap();
    broadcaster.broadcast(channel, event("a")).await.unwrap();
    broadcaster.broadcast(channel, event("b")).await.unwrap();

    broadcaster.shutdown().await;

    assert_eq!(sink.calls(), 2);
    assert_eq!(broadcaster.channel_stats(channel).await.unwrap().failed, 2);
    assert!(matches!(
        broadcaster.broadcast(channel, event("c")).await,
        Err(BusError::Closed)
    ));
}

// ── Bus integration ──────────────────────────────────────────────

#[tokio::test]
async fn bus_sink_publishes_onto_the_bus() {
    let bus = Arc::new(EventBus::default());
    let broadcaster = Broadcaster::new(config(3), Arc::new(BusSink::new(Arc::clone(&bus))));
    broadcaster
        .create_channel("fanout", ["default"], 5, None, None)
        .await
        .unwrap();

    broadcaster.route(&event("k")).await.unwrap();
    assert_eq!(broadcaster.drain_ready().await, 1);

    let history = bus.event_history(None, None).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].key, "k");
    assert_eq!(history[0].version, 1);
}
