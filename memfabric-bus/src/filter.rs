//! Event filters.
//!
//! A filter is a conjunction: every configured criterion must pass. An
//! unset criterion passes everything, so `EventFilter::default()` matches
//! all events.

use crate::error::BusResult;
use memfabric_types::{BusEvent, EventKind, Millis};
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Extra match condition evaluated after the built-in criteria.
pub type EventPredicate = Arc<dyn Fn(&BusEvent) -> bool + Send + Sync>;

/// Selects which events a subscription receives.
#[derive(Clone, Default)]
pub struct EventFilter {
    partitions: Option<HashSet<String>>,
    kinds: Option<HashSet<EventKind>>,
    key_patterns: Vec<Regex>,
    sources: Option<HashSet<String>>,
    excluded_sources: HashSet<String>,
    max_age_ms: Option<Millis>,
    predicate: Option<EventPredicate>,
}

impl EventFilter {
    /// A filter that matches every event.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Only events in one of these partitions.
    #[must_use]
    pub fn partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partitions = Some(partitions.into_iter().map(Into::into).collect());
        self
    }

    /// Only events of one of these kinds.
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Adds a regular-expression key pattern. A key matches if any pattern does.
    pub fn key_pattern(mut self, pattern: &str) -> BusResult<Self> {
        self.key_patterns.push(Regex::new(pattern)?);
        Ok(self)
    }

    /// Adds a glob key pattern where `*` matches any run of characters.
    pub fn key_glob(self, glob: &str) -> BusResult<Self> {
        let body = glob
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        self.key_pattern(&format!("^{body}$"))
    }

    /// Only events from one of these sources.
    #[must_use]
    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    /// Drops events from this source. Used to keep a principal from
    /// hearing its own writes.
    #[must_use]
    pub fn exclude_source(mut self, source: impl Into<String>) -> Self {
        self.excluded_sources.insert(source.into());
        self
    }

    /// Only events no older than `max_age_ms` at match time.
    #[must_use]
    pub fn max_age(mut self, max_age_ms: Millis) -> Self {
        self.max_age_ms = Some(max_age_ms);
        self
    }

    /// Adds a custom predicate.
    #[must_use]
    pub fn predicate(
        mut self,
        predicate: impl Fn(&BusEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// True if `event` passes every criterion at time `now`.
    #[must_use]
    pub fn matches(&self, event: &BusEvent, now: Millis) -> bool {
        if let Some(partitions) = &self.partitions {
            if !partitions.contains(&event.partition_id) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if !self.key_patterns.is_empty()
            && !self.key_patterns.iter().any(|p| p.is_match(&event.key))
        {
            return false;
        }
        if let Some(sources) = &self.sources {
            if !sources.contains(&event.source) {
                return false;
            }
        }
        if self.excluded_sources.contains(&event.source) {
            return false;
        }
        if let Some(max_age) = self.max_age_ms {
            if now.saturating_sub(event.timestamp) > max_age {
                return false;
            }
        }
        self.predicate.as_ref().is_none_or(|p| p(event))
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFilter")
            .field("partitions", &self.partitions)
            .field("kinds", &self.kinds)
            .field(
                "key_patterns",
                &self.key_patterns.iter().map(Regex::as_str).collect::<Vec<_>>(),
            )
            .field("sources", &self.sources)
            .field("excluded_sources", &self.excluded_sources)
            .field("max_age_ms", &self.max_age_ms)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}
