//! Bounded per-principal storage for the memory fabric.
//!
//! A [`LocalStore`] keeps encoded values in memory under a byte budget,
//! grouped into prioritised partitions. It evicts by a configurable policy
//! when full, expires entries by TTL, and optionally writes through to a
//! [`PersistenceAdapter`].
//!
//! # Architecture
//!
//! - Payloads are encoded and compressed by `memfabric-codec`; sizes are post-codec
//! - Partition accounting lives in [`PartitionController`]
//! - Durability is best-effort and reported through [`StoreSignal`]

mod config;
mod entry;
mod error;
mod local_store;
mod partition;
mod persistence;

pub use config::{EvictionPolicy, StoreConfig};
pub use entry::{Entry, EntryInfo};
pub use error::{StoreError, StoreResult};
pub use local_store::{LocalStore, StoreSignal, StoreStats};
pub use partition::{
    DEFAULT_PARTITION, DEFAULT_PARTITIONS, DEFAULT_PRIORITY, EvictionCandidate, Partition,
    PartitionController,
};
pub use persistence::{FilePersistence, MemoryPersistence, PersistenceAdapter};
