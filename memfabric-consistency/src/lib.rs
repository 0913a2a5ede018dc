//! Consistency primitives for the memory fabric.
//!
//! - [`VersionVector`]: per-key causality tracking across principals
//! - [`ConflictResolver`]: classifies competing versions and settles them
//! - [`semantic_merge`]: structural merge of maps and arrays
//! - [`VersionController`]: bounded per-key version history with diffs
//!   and rollback
//!
//! None of these types lock internally; owners wrap them as needed.

mod conflict;
mod diff;
mod error;
mod merge;
mod vector_clock;
mod version;

pub use conflict::{
    ConflictFlags, ConflictResolver, Resolution, ResolutionRecord, ResolverConfig, ResolverStats,
    ReviewDecision, ReviewItem, Severity, Strategy, VersionedValue, Winner,
};
pub use diff::{Modification, VersionDiff};
pub use error::{ConsistencyError, ConsistencyResult};
pub use merge::semantic_merge;
pub use vector_clock::{CausalOrder, ClockEntry, VersionVector};
pub use version::{VersionConfig, VersionController, VersionInfo, VersionRecord, VersionStats};
