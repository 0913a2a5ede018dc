//! Conflict classification and resolution.
//!
//! Two competing versions of one key are compared along five axes (the
//! [`ConflictFlags`]), which determine a [`Severity`]. A [`Strategy`] then
//! picks or builds the surviving value. `Strategy::Auto` chooses one from
//! the flags:
//!
//! | condition                              | strategy              |
//! |----------------------------------------|-----------------------|
//! | severity high                          | `ManualReview`        |
//! | only the timestamp flag                | `LastWriteWins`       |
//! | data differs and both sides mergeable  | `SemanticMerge`       |
//! | version flag                           | `HigherVersionWins`   |
//! | otherwise                              | `LastWriteWins`       |
//!
//! Manual review keeps the current value and queues the conflict until
//! [`ConflictResolver::resolve_review`] is called.

use crate::error::{ConsistencyError, ConsistencyResult};
use crate::merge::semantic_merge;
use crate::vector_clock::{CausalOrder, VersionVector};
use memfabric_types::{Millis, Value, now_millis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::{debug, info};

/// Configuration for a [`ConflictResolver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Timestamps further apart than this raise the timestamp flag (ms).
    pub timestamp_tolerance_ms: Millis,
    /// Relative size difference above which the size flag is raised.
    pub size_tolerance: f64,
    /// Number of resolutions kept in history.
    pub history_limit: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timestamp_tolerance_ms: 1000,
            size_tolerance: 0.10,
            history_limit: 1000,
        }
    }
}

/// One side of a conflict: a value plus the metadata used to judge it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub timestamp: Millis,
    pub size_bytes: u64,
    pub partition_id: String,
    pub access_count: u64,
    /// Who wrote this side.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<VersionVector>,
}

impl VersionedValue {
    /// A first version in the default partition, sized by its JSON encoding.
    #[must_use]
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        let size_bytes = serde_json::to_vec(&value).map_or(0, |b| b.len() as u64);
        Self {
            key: key.into(),
            value,
            version: 1,
            timestamp: 0,
            size_bytes,
            partition_id: "default".to_string(),
            access_count: 0,
            source: String::new(),
            vector: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Millis) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    #[must_use]
    pub fn with_partition(mut self, partition_id: impl Into<String>) -> Self {
        self.partition_id = partition_id.into();
        self
    }

    #[must_use]
    pub fn with_access_count(mut self, access_count: u64) -> Self {
        self.access_count = access_count;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    #[must_use]
    pub fn with_vector(mut self, vector: VersionVector) -> Self {
        self.vector = Some(vector);
        self
    }

    /// Last-write-wins ordering key: timestamp, then version, then source.
    fn recency(&self) -> (Millis, u64, &str) {
        (self.timestamp, self.version, &self.source)
    }
}

/// Which aspects of two versions disagree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictFlags {
    pub version: bool,
    pub timestamp: bool,
    pub data: bool,
    pub size: bool,
    pub partition: bool,
}

impl ConflictFlags {
    /// Compares two versions.
    #[must_use]
    pub fn classify(
        current: &VersionedValue,
        incoming: &VersionedValue,
        config: &ResolverConfig,
    ) -> Self {
        let larger = current.size_bytes.max(incoming.size_bytes);
        let delta = current.size_bytes.abs_diff(incoming.size_bytes);
        Self {
            version: current.version != incoming.version,
            timestamp: current.timestamp.abs_diff(incoming.timestamp)
                > config.timestamp_tolerance_ms,
            data: current.value != incoming.value,
            size: larger > 0 && delta as f64 / larger as f64 > config.size_tolerance,
            partition: current.partition_id != incoming.partition_id,
        }
    }

    /// Number of raised flags.
    #[must_use]
    pub fn count(&self) -> usize {
        [self.version, self.timestamp, self.data, self.size, self.partition]
            .into_iter()
            .filter(|f| *f)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// True when `timestamp` is the only raised flag.
    #[must_use]
    pub fn timestamp_only(&self) -> bool {
        self.timestamp && self.count() == 1
    }

    #[must_use]
    pub fn severity(&self) -> Severity {
        if self.count() >= 3 || self.partition {
            Severity::High
        } else if self.data && self.version {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// How serious a conflict is. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

/// How to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Pick one of the others from the conflict flags.
    #[default]
    Auto,
    LastWriteWins,
    HigherVersionWins,
    /// Causal order from version vectors; concurrent sides are merged.
    VersionVector,
    SemanticMerge,
    /// Keep current and queue for a human decision.
    ManualReview,
    /// Keep the side with more bytes.
    LargerWins,
    /// Keep the side with more reads.
    MostAccessed,
    KeepCurrent,
}

/// Which side survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Current,
    Incoming,
    Merged,
}

/// Outcome of [`ConflictResolver::resolve_conflict`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub resolved: VersionedValue,
    /// The strategy actually applied (never `Auto`).
    pub strategy: Strategy,
    pub severity: Severity,
    pub flags: ConflictFlags,
    pub winner: Winner,
    pub requires_manual_review: bool,
    /// Set when the conflict was queued for review.
    pub review_id: Option<u64>,
}

impl Resolution {
    /// Fails with [`ConsistencyError::ManualReviewRequired`] if the conflict
    /// was escalated instead of resolved.
    pub fn ensure_resolved(&self) -> ConsistencyResult<()> {
        if self.requires_manual_review {
            return Err(ConsistencyError::ManualReviewRequired {
                key: self.resolved.key.clone(),
                severity: self.severity,
            });
        }
        Ok(())
    }
}

/// A conflict waiting for a human decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewItem {
    pub id: u64,
    pub key: String,
    pub current: VersionedValue,
    pub incoming: VersionedValue,
    pub flags: ConflictFlags,
    pub severity: Severity,
    pub created_at: Millis,
}

/// A reviewer's choice for a queued conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewDecision {
    KeepCurrent,
    TakeIncoming,
    Merge,
    Replace(Value),
}

/// A past resolution, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionRecord {
    pub key: String,
    pub strategy: Strategy,
    pub severity: Severity,
    pub flags: ConflictFlags,
    pub resolved_at: Millis,
}

/// Resolution counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolverStats {
    pub total: u64,
    pub by_strategy: BTreeMap<Strategy, u64>,
    pub by_severity: BTreeMap<Severity, u64>,
    pub pending_reviews: usize,
}

/// Classifies and resolves conflicts, keeping a review queue and history.
#[derive(Debug, Default)]
pub struct ConflictResolver {
    config: ResolverConfig,
    reviews: Vec<ReviewItem>,
    next_review_id: u64,
    history: VecDeque<ResolutionRecord>,
    stats: ResolverStats,
}

impl ConflictResolver {
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// The strategy `Auto` would choose for these flags.
    #[must_use]
    pub fn select_strategy(
        flags: &ConflictFlags,
        current: &VersionedValue,
        incoming: &VersionedValue,
    ) -> Strategy {
        if flags.severity() == Severity::High {
            Strategy::ManualReview
        } else if flags.timestamp_only() {
            Strategy::LastWriteWins
        } else if flags.data && current.value.is_mergeable_with(&incoming.value) {
            Strategy::SemanticMerge
        } else if flags.version {
            Strategy::HigherVersionWins
        } else {
            Strategy::LastWriteWins
        }
    }

    /// Settles a conflict between `current` and `incoming`.
    pub fn resolve_conflict(
        &mut self,
        current: &VersionedValue,
        incoming: &VersionedValue,
        strategy: Strategy,
    ) -> Resolution {
        let flags = ConflictFlags::classify(current, incoming, &self.config);
        let severity = flags.severity();
        let strategy = match strategy {
            Strategy::Auto => Self::select_strategy(&flags, current, incoming),
            explicit => explicit,
        };

        let (resolved, winner, applied) = match strategy {
            Strategy::ManualReview => (current.clone(), Winner::Current, Strategy::ManualReview),
            // `Auto` has already been replaced above.
            Strategy::KeepCurrent | Strategy::Auto => {
                (current.clone(), Winner::Current, Strategy::KeepCurrent)
            }
            Strategy::LastWriteWins => {
                let (v, w) = last_write_wins(current, incoming);
                (v, w, strategy)
            }
            Strategy::HigherVersionWins => {
                let (v, w) = pick(current, incoming, incoming.version > current.version);
                (v, w, strategy)
            }
            Strategy::LargerWins => {
                let (v, w) = pick(current, incoming, incoming.size_bytes > current.size_bytes);
                (v, w, strategy)
            }
            Strategy::MostAccessed => {
                let (v, w) = pick(current, incoming, incoming.access_count > current.access_count);
                (v, w, strategy)
            }
            Strategy::SemanticMerge => {
                let (v, w) = merge_or_newest(current, incoming);
                (v, w, strategy)
            }
            Strategy::VersionVector => {
                let (v, w) = by_causality(current, incoming);
                (v, w, strategy)
            }
        };

        let review_id = (applied == Strategy::ManualReview).then(|| {
            self.next_review_id += 1;
            let id = self.next_review_id;
            info!("conflict on {} escalated for review (#{id}, {severity})", current.key);
            self.reviews.push(ReviewItem {
                id,
                key: current.key.clone(),
                current: current.clone(),
                incoming: incoming.clone(),
                flags,
                severity,
                created_at: now_millis(),
            });
            id
        });

        self.record(&current.key, applied, severity, flags);
        debug!(
            "resolved {} with {applied:?} ({severity}, {} flags) -> {winner:?}",
            current.key,
            flags.count()
        );

        Resolution {
            resolved,
            strategy: applied,
            severity,
            flags,
            winner,
            requires_manual_review: review_id.is_some(),
            review_id,
        }
    }

    /// Conflicts awaiting a decision, oldest first.
    #[must_use]
    pub fn pending_reviews(&self) -> &[ReviewItem] {
        &self.reviews
    }

    /// Settles a queued conflict and removes it from the queue.
    pub fn resolve_review(
        &mut self,
        id: u64,
        decision: ReviewDecision,
    ) -> ConsistencyResult<VersionedValue> {
        let index = self
            .reviews
            .iter()
            .position(|r| r.id == id)
            .ok_or(ConsistencyError::ReviewNotFound(id))?;
        let item = self.reviews.remove(index);
        let resolved = match decision {
            ReviewDecision::KeepCurrent => item.current,
            ReviewDecision::TakeIncoming => item.incoming,
            ReviewDecision::Merge => merge_or_newest(&item.current, &item.incoming).0,
            ReviewDecision::Replace(value) => {
                let mut replaced = successor(&item.current, &item.incoming);
                replaced.value = value;
                replaced
            }
        };
        info!("review #{id} for {} settled", item.key);
        Ok(resolved)
    }

    /// Recent resolutions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ResolutionRecord> {
        self.history.iter()
    }

    #[must_use]
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            pending_reviews: self.reviews.len(),
            ..self.stats.clone()
        }
    }

    fn record(&mut self, key: &str, strategy: Strategy, severity: Severity, flags: ConflictFlags) {
        self.stats.total += 1;
        *self.stats.by_strategy.entry(strategy).or_default() += 1;
        *self.stats.by_severity.entry(severity).or_default() += 1;
        self.history.push_back(ResolutionRecord {
            key: key.to_string(),
            strategy,
            severity,
            flags,
            resolved_at: now_millis(),
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }
}

fn pick(
    current: &VersionedValue,
    incoming: &VersionedValue,
    take_incoming: bool,
) -> (VersionedValue, Winner) {
    if take_incoming {
        (incoming.clone(), Winner::Incoming)
    } else {
        (current.clone(), Winner::Current)
    }
}

fn last_write_wins(
    current: &VersionedValue,
    incoming: &VersionedValue,
) -> (VersionedValue, Winner) {
    pick(current, incoming, incoming.recency() > current.recency())
}

/// Metadata for a value derived from both sides.
fn successor(current: &VersionedValue, incoming: &VersionedValue) -> VersionedValue {
    let newest = if incoming.recency() > current.recency() {
        incoming
    } else {
        current
    };
    let vector = match (&current.vector, &incoming.vector) {
        (Some(a), Some(b)) => Some(a.merged(b)),
        (a, b) => a.clone().or_else(|| b.clone()),
    };
    VersionedValue {
        key: current.key.clone(),
        value: newest.value.clone(),
        version: current.version.max(incoming.version) + 1,
        timestamp: current.timestamp.max(incoming.timestamp),
        size_bytes: current.size_bytes.max(incoming.size_bytes),
        partition_id: newest.partition_id.clone(),
        access_count: current.access_count.max(incoming.access_count),
        source: newest.source.clone(),
        vector,
    }
}

fn merge_or_newest(
    current: &VersionedValue,
    incoming: &VersionedValue,
) -> (VersionedValue, Winner) {
    match semantic_merge(&current.value, &incoming.value) {
        Some(value) => {
            let mut merged = successor(current, incoming);
            merged.size_bytes =
                serde_json::to_vec(&value).map_or(merged.size_bytes, |b| b.len() as u64);
            merged.value = value;
            (merged, Winner::Merged)
        }
        None => last_write_wins(current, incoming),
    }
}

fn by_causality(current: &VersionedValue, incoming: &VersionedValue) -> (VersionedValue, Winner) {
    let (Some(ours), Some(theirs)) = (&current.vector, &incoming.vector) else {
        return pick(current, incoming, incoming.version > current.version);
    };
    match ours.compare(theirs) {
        CausalOrder::After | CausalOrder::Equal => (current.clone(), Winner::Current),
        CausalOrder::Before => (incoming.clone(), Winner::Incoming),
        CausalOrder::Concurrent => merge_or_newest(current, incoming),
    }
}
