//! Error types for the store layer.

use memfabric_codec::CodecError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Not enough evictable space to admit the write.
    #[error("insufficient space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    /// The partition's own budget cannot admit the write.
    #[error("partition {partition} full: need {required} bytes, limit {limit}")]
    PartitionFull {
        partition: String,
        required: u64,
        limit: u64,
    },

    /// Encoding or decoding the payload failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The persistence adapter reported a failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A persistence call did not finish within the configured timeout.
    #[error("persistence operation timed out: {0}")]
    Timeout(String),

    /// A guarded operation is already running.
    #[error("{0} already in progress")]
    Busy(&'static str),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store or adapter has been shut down.
    #[error("store closed")]
    Closed,
}

impl StoreError {
    /// True for errors that mean "out of room": retry later or shed load.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::InsufficientSpace { .. } | Self::PartitionFull { .. })
    }
}
