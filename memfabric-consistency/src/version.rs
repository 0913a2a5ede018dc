//! Per-key version history.
//!
//! Every accepted write can be recorded as a numbered version carrying a
//! checksum, an author and a parent link. History per key is bounded: when
//! it grows past `max_versions_per_key`, the oldest intermediate versions
//! are dropped while the first and the current version are kept.

use crate::diff::VersionDiff;
use crate::error::{ConsistencyError, ConsistencyResult};
use memfabric_types::{Millis, Value, now_millis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

const THIRTY_DAYS_MS: Millis = 30 * 24 * 60 * 60 * 1000;

/// Configuration for a [`VersionController`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionConfig {
    pub max_versions_per_key: usize,
    /// Versions older than this are dropped by `cleanup_expired` (ms).
    pub retention_period_ms: Millis,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            max_versions_per_key: 50,
            retention_period_ms: THIRTY_DAYS_MS,
        }
    }
}

/// Metadata for one recorded version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: u64,
    pub timestamp: Millis,
    /// xxh3 of the payload's JSON encoding.
    pub checksum: u64,
    pub author: String,
    pub parent_version: Option<u64>,
    pub note: Option<String>,
    pub size_bytes: u64,
}

/// A recorded version and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub info: VersionInfo,
    pub value: Value,
}

/// Aggregate history figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VersionStats {
    pub keys: usize,
    pub total_versions: usize,
    pub total_bytes: u64,
    pub pruned: u64,
}

#[derive(Debug, Default)]
struct History {
    versions: VecDeque<VersionRecord>,
    next_version: u64,
}

impl History {
    fn current(&self) -> Option<&VersionRecord> {
        self.versions.back()
    }

    fn find(&self, version: u64) -> Option<&VersionRecord> {
        self.versions.iter().find(|r| r.info.version == version)
    }
}

/// Tracks version histories for many keys.
#[derive(Debug, Default)]
pub struct VersionController {
    config: VersionConfig,
    histories: BTreeMap<String, History>,
    pruned: u64,
}

impl VersionController {
    #[must_use]
    pub fn new(config: VersionConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn config(&self) -> &VersionConfig {
        &self.config
    }

    /// Records `value` as the next version of `key` and returns its number.
    ///
    /// Version numbers start at 1 and never repeat for a key, even after
    /// pruning.
    pub fn create_version(
        &mut self,
        key: &str,
        value: &Value,
        author: &str,
        note: Option<&str>,
    ) -> ConsistencyResult<u64> {
        let bytes = serde_json::to_vec(value)?;
        let history = self.histories.entry(key.to_string()).or_default();
        history.next_version += 1;
        let version = history.next_version;
        let info = VersionInfo {
            version,
            timestamp: now_millis(),
            checksum: xxh3_64(&bytes),
            author: author.to_string(),
            parent_version: history.current().map(|r| r.info.version),
            note: note.map(str::to_string),
            size_bytes: bytes.len() as u64,
        };
        history.versions.push_back(VersionRecord {
            info,
            value: value.clone(),
        });

        let max = self.config.max_versions_per_key.max(1);
        let mut dropped = 0u64;
        while history.versions.len() > max {
            // Keep the first version as long as there is room for it.
            let victim = if max >= 2 { 1 } else { 0 };
            history.versions.remove(victim);
            dropped += 1;
        }
        self.pruned += dropped;
        debug!("{key}: version {version} recorded ({dropped} pruned)");
        Ok(version)
    }

    pub fn get_version(&self, key: &str, version: u64) -> ConsistencyResult<&VersionRecord> {
        self.history(key)?
            .find(version)
            .ok_or_else(|| ConsistencyError::UnknownVersion {
                key: key.to_string(),
                version,
            })
    }

    /// Retained versions of `key`, oldest first. Empty if none.
    #[must_use]
    pub fn list_versions(&self, key: &str) -> Vec<VersionInfo> {
        self.histories
            .get(key)
            .map(|h| h.versions.iter().map(|r| r.info.clone()).collect())
            .unwrap_or_default()
    }

    /// The newest version of `key`.
    #[must_use]
    pub fn current_version(&self, key: &str) -> Option<&VersionRecord> {
        self.histories.get(key).and_then(History::current)
    }

    /// Structural diff from version `from` to version `to`.
    pub fn get_diff(&self, key: &str, from: u64, to: u64) -> ConsistencyResult<VersionDiff> {
        let old = self.get_version(key, from)?;
        let new = self.get_version(key, to)?;
        Ok(VersionDiff::between(from, &old.value, to, &new.value))
    }

    /// Records the payload of version `target` as a new version. Returns the
    /// new version's number and payload.
    pub fn rollback(
        &mut self,
        key: &str,
        target: u64,
        author: &str,
    ) -> ConsistencyResult<(u64, Value)> {
        let value = self.get_version(key, target)?.value.clone();
        let note = format!("rollback to v{target}");
        let version = self.create_version(key, &value, author, Some(&note))?;
        info!("{key}: rolled back to v{target} as v{version}");
        Ok((version, value))
    }

    /// Thins history to every `keep_every_nth` version, always keeping the
    /// first and the current. Returns how many were removed.
    pub fn compact_versions(&mut self, key: &str, keep_every_nth: u64) -> ConsistencyResult<usize> {
        let n = keep_every_nth.max(1);
        let history = self
            .histories
            .get_mut(key)
            .ok_or_else(|| ConsistencyError::UnknownKey(key.to_string()))?;
        let (first, last) = match (history.versions.front(), history.versions.back()) {
            (Some(f), Some(l)) => (f.info.version, l.info.version),
            _ => return Ok(0),
        };
        let before = history.versions.len();
        history.versions.retain(|r| {
            let v = r.info.version;
            v == first || v == last || v % n == 0
        });
        let removed = before - history.versions.len();
        self.pruned += removed as u64;
        debug!("{key}: compacted {removed} versions");
        Ok(removed)
    }

    /// Keys with recorded history, in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.histories.keys().map(String::as_str)
    }

    /// Forgets all history for `key`. Returns `false` if there was none.
    pub fn delete_history(&mut self, key: &str) -> bool {
        self.histories.remove(key).is_some()
    }

    /// Drops versions older than the retention period, never the current
    /// one of any key. Returns how many were removed.
    pub fn cleanup_expired(&mut self, now: Millis) -> usize {
        let cutoff = now.saturating_sub(self.config.retention_period_ms);
        let mut removed = 0;
        for history in self.histories.values_mut() {
            let Some(current) = history.current().map(|r| r.info.version) else {
                continue;
            };
            let before = history.versions.len();
            history
                .versions
                .retain(|r| r.info.version == current || r.info.timestamp >= cutoff);
            removed += before - history.versions.len();
        }
        self.pruned += removed as u64;
        if removed > 0 {
            info!("removed {removed} expired versions");
        }
        removed
    }

    #[must_use]
    pub fn stats(&self) -> VersionStats {
        let mut stats = VersionStats {
            keys: self.histories.len(),
            pruned: self.pruned,
            ..Default::default()
        };
        for history in self.histories.values() {
            stats.total_versions += history.versions.len();
            stats.total_bytes += history.versions.iter().map(|r| r.info.size_bytes).sum::<u64>();
        }
        stats
    }

    fn history(&self, key: &str) -> ConsistencyResult<&History> {
        self.histories
            .get(key)
            .ok_or_else(|| ConsistencyError::UnknownKey(key.to_string()))
    }
}
