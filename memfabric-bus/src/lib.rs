//! Event distribution for the memory fabric.
//!
//! Three layers, usable independently:
//! - [`EventBus`]: synchronous in-process pub/sub with a bounded,
//!   TTL-pruned history and replay for late joiners
//! - [`Broadcaster`]: named, rate-limited channels with bounded queues and
//!   retry-with-backoff on top of any [`DeliverySink`]
//! - [`Subscriber`]: a buffered, batching consumer with per-subscription
//!   failure isolation and automatic recovery
//!
//! Each component reports out-of-band conditions through a typed
//! `signals()` channel instead of shared listener registries.

mod broadcaster;
mod bus;
mod error;
mod filter;
mod subscriber;

pub use broadcaster::{
    BroadcastMessage, BroadcastSignal, Broadcaster, BroadcasterConfig, BusSink, ChannelStats,
    DeliverySink, MIN_DRAIN_INTERVAL_MS, PumpOutcome,
};
pub use bus::{BusConfig, BusSignal, BusStats, EventBus, EventCallback};
pub use error::{BusError, BusResult};
pub use filter::{EventFilter, EventPredicate};
pub use subscriber::{
    BatchCallback, Subscriber, SubscriberConfig, SubscriberSignal, SubscriberStats,
    SubscriptionState,
};
