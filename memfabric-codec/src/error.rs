//! Error types for the codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The value cannot be represented (a non-finite float, or nesting
    /// beyond [`MAX_NESTING_DEPTH`](crate::MAX_NESTING_DEPTH)).
    #[error("encode error: {0}")]
    Encode(String),

    /// Corrupt, truncated or otherwise unreadable payload.
    #[error("decode error: {0}")]
    Decode(String),
}

impl CodecError {
    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }
}
