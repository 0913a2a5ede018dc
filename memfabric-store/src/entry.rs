//! Stored entries.

use memfabric_types::Millis;
use serde::{Deserialize, Serialize};

/// One stored key: the encoded payload plus its bookkeeping.
///
/// `size_bytes` is the length of `payload` (post-codec) and is the number
/// charged to the owning partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub payload: Vec<u8>,
    pub created_at: Millis,
    /// Time of the last successful write.
    pub updated_at: Millis,
    pub last_accessed: Millis,
    pub access_count: u64,
    pub size_bytes: u64,
    pub partition_id: String,
    /// Starts at 1, incremented on every successful write.
    pub version: u64,
    /// Absolute expiry deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Millis>,
}

impl Entry {
    /// Creates a first-version entry for `payload`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        payload: Vec<u8>,
        partition_id: impl Into<String>,
        now: Millis,
        ttl: Option<Millis>,
    ) -> Self {
        let size_bytes = payload.len() as u64;
        Self {
            id: id.into(),
            payload,
            created_at: now,
            updated_at: now,
            last_accessed: now,
            access_count: 0,
            size_bytes,
            partition_id: partition_id.into(),
            version: 1,
            ttl,
        }
    }

    /// True once `now` is past the TTL deadline.
    #[must_use]
    pub fn is_expired(&self, now: Millis) -> bool {
        self.ttl.is_some_and(|deadline| now > deadline)
    }

    /// Metadata view without the payload.
    #[must_use]
    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            id: self.id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            size_bytes: self.size_bytes,
            partition_id: self.partition_id.clone(),
            version: self.version,
            ttl: self.ttl,
        }
    }
}

/// Entry metadata, as returned by inspection calls that must not count
/// as an access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub id: String,
    pub created_at: Millis,
    pub updated_at: Millis,
    pub last_accessed: Millis,
    pub access_count: u64,
    pub size_bytes: u64,
    pub partition_id: String,
    pub version: u64,
    pub ttl: Option<Millis>,
}
