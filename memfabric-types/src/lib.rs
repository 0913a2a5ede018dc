//! Core type definitions for the memory fabric.
//!
//! This crate defines the fundamental types shared by every layer:
//! - [`Value`], the tagged-union payload stored under every key
//! - [`BusEvent`], the immutable record of a state-changing operation
//! - Identifier newtypes (principals, subscriptions, channels, messages)
//! - A millisecond wall clock used for TTLs, ages and event stamps
//! - Background task helpers ([`spawn_periodic`], [`InFlight`])
//!
//! Nothing in here owns state; stores, buses and coordinators live in
//! their own crates.

mod event;
mod ids;
mod task;
mod timestamp;
mod value;

pub use event::{BusEvent, EventKind};
pub use ids::{ChannelId, MessageId, PrincipalId, SubscriptionId};
pub use task::{InFlight, spawn_periodic};
pub use timestamp::{Millis, age_millis, now_millis};
pub use value::{Value, ValueKind};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid principal id: {0:?}")]
    InvalidPrincipal(String),
}
