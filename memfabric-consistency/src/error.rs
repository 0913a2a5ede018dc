//! Error types for the consistency layer.

use crate::conflict::Severity;
use thiserror::Error;

/// Result type for consistency operations.
pub type ConsistencyResult<T> = Result<T, ConsistencyError>;

/// Errors that can occur in conflict resolution and version history.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    /// The conflict could not be resolved automatically.
    #[error("conflict on {key} ({severity}) requires manual review")]
    ManualReviewRequired { key: String, severity: Severity },

    #[error("no review with id {0}")]
    ReviewNotFound(u64),

    #[error("no history for key {0}")]
    UnknownKey(String),

    #[error("key {key} has no version {version}")]
    UnknownVersion { key: String, version: u64 },

    /// Serialization failed while checksumming a payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
