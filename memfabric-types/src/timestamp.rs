//! Millisecond wall clock.
//!
//! Every timestamp in the fabric (entry access times, TTL deadlines, bus
//! event stamps, version records) is milliseconds since the Unix epoch.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Returns the current wall time in milliseconds.
///
/// A clock set before the epoch reads as `0` rather than panicking.
#[must_use]
pub fn now_millis() -> Millis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Millis)
        .unwrap_or(0)
}

/// Milliseconds elapsed since `since`, saturating at zero for future stamps.
#[must_use]
pub fn age_millis(since: Millis) -> Millis {
    now_millis().saturating_sub(since)
}
