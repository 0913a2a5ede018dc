//! Error types for the coordinator.

use memfabric_bus::BusError;
use memfabric_consistency::ConsistencyError;
use memfabric_store::StoreError;
use memfabric_types::PrincipalId;
use thiserror::Error;

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Errors surfaced by the coordinator.
///
/// Unknown principals and keys are not errors here: lookups return
/// `None` or `false` instead.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("principal {0} is already registered")]
    AlreadyRegistered(PrincipalId),

    /// The hard cap on concurrently registered principals was reached.
    #[error("principal capacity exceeded (limit {limit})")]
    CapacityExceeded { limit: usize },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    /// A guarded operation is already running.
    #[error("{0} already in progress")]
    Busy(&'static str),

    #[error("coordinator closed")]
    Closed,
}

impl CoordinatorError {
    /// True for errors that mean "out of room": retry later or shed load.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        match self {
            Self::CapacityExceeded { .. } => true,
            Self::Store(e) => e.is_capacity(),
            Self::Bus(e) => e.is_capacity(),
            _ => false,
        }
    }
}
