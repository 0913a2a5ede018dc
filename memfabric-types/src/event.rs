//! Bus events.
//!
//! A [`BusEvent`] records one state-changing operation on a store. Events
//! are stamped with a version and timestamp by the bus that emits them and
//! are never mutated afterwards. The serialized field names are the stable
//! wire shape: `{type, key, partitionId, data?, metadata, timestamp, source, version}`.

use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The operation an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Store,
    Update,
    Remove,
    Clear,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Store => "store",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Clear => "clear",
        };
        f.write_str(s)
    }
}

/// An immutable, timestamped, versioned record of a store operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// The affected key (empty for `Clear`).
    pub key: String,

    /// Partition the key lives in.
    pub partition_id: String,

    /// New payload for `Store`/`Update`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Free-form annotations.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Emission time, milliseconds since epoch. Assigned by the bus.
    pub timestamp: u64,

    /// Who produced the event (principal id or component name).
    pub source: String,

    /// Strictly increasing per bus. Assigned by the bus.
    pub version: u64,
}

impl BusEvent {
    /// Creates an unstamped event; the bus assigns `timestamp` and `version`.
    #[must_use]
    pub fn new(
        kind: EventKind,
        key: impl Into<String>,
        partition_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            key: key.into(),
            partition_id: partition_id.into(),
            data: None,
            metadata: BTreeMap::new(),
            timestamp: 0,
            source: source.into(),
            version: 0,
        }
    }

    /// Creates a `Store` event carrying the stored payload.
    #[must_use]
    pub fn store(
        key: impl Into<String>,
        partition_id: impl Into<String>,
        data: Value,
        source: impl Into<String>,
    ) -> Self {
        Self::new(EventKind::Store, key, partition_id, source).with_data(data)
    }

    /// Creates an `Update` event carrying the new payload.
    #[must_use]
    pub fn update(
        key: impl Into<String>,
        partition_id: impl Into<String>,
        data: Value,
        source: impl Into<String>,
    ) -> Self {
        Self::new(EventKind::Update, key, partition_id, source).with_data(data)
    }

    /// Creates a `Remove` event.
    #[must_use]
    pub fn remove(
        key: impl Into<String>,
        partition_id: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::new(EventKind::Remove, key, partition_id, source)
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Adds a metadata annotation.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
