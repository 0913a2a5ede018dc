//! Error types for the event layer.

use memfabric_types::{ChannelId, SubscriptionId};
use thiserror::Error;

/// Result type for bus, broadcaster and subscriber operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors that can occur in event distribution.
#[derive(Debug, Error)]
pub enum BusError {
    /// Too many live subscriptions.
    #[error("subscription limit of {limit} reached")]
    SubscriptionLimit { limit: usize },

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    /// A key pattern did not compile.
    #[error("invalid key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The component has been shut down.
    #[error("closed")]
    Closed,
}

impl BusError {
    /// True for "out of room" errors.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::SubscriptionLimit { .. })
    }
}
