//! Fabric-wide metrics.

use crate::coordinator::Coordinator;
use crate::principal::PrincipalHealth;
use memfabric_bus::BusStats;
use memfabric_consistency::ResolverStats;
use memfabric_types::Millis;
use serde::Serialize;

/// Aggregate view over every registered principal and the shared fabric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorMetrics {
    pub principals: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub memory_used: u64,
    pub memory_limit: u64,
    /// `memory_used / memory_limit`, 0 with no capacity.
    pub utilization: f64,
    /// See [`system_health`].
    pub system_health: f64,
    pub total_operations: u64,
    /// Mean of the principals' read-cache hit rates.
    pub cache_hit_rate: f64,
    pub events_received: u64,
    pub sync_runs: u64,
    pub entries_synced: u64,
    pub conflicts_resolved: u64,
    pub pending_reviews: usize,
    pub last_sync_at: Option<Millis>,
    pub bus: BusStats,
    pub resolver: ResolverStats,
}

/// Health score in `[0, 1]`: the mean of free capacity and the share of
/// healthy principals. An empty fabric scores 1.
#[must_use]
pub fn system_health(memory_used: u64, memory_limit: u64, healthy: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    let free = if memory_limit == 0 {
        0.0
    } else {
        1.0 - (memory_used as f64 / memory_limit as f64).min(1.0)
    };
    let healthy = healthy as f64 / total as f64;
    (free + healthy) / 2.0
}

impl Coordinator {
    pub async fn metrics(&self) -> CoordinatorMetrics {
        let statuses = self.principal_statuses().await;
        let principals = statuses.len();
        let healthy = statuses
            .iter()
            .filter(|s| s.health == PrincipalHealth::Healthy)
            .count();
        let memory_used: u64 = statuses.iter().map(|s| s.memory_used).sum();
        let memory_limit: u64 = statuses.iter().map(|s| s.memory_limit).sum();
        let cache_hit_rate = if principals == 0 {
            0.0
        } else {
            statuses.iter().map(|s| s.cache_hit_rate).sum::<f64>() / principals as f64
        };

        let totals = self.totals.lock().await.clone();
        let resolver = self.resolver.lock().await.stats();
        CoordinatorMetrics {
            principals,
            healthy,
            degraded: principals - healthy,
            memory_used,
            memory_limit,
            utilization: if memory_limit == 0 {
                0.0
            } else {
                memory_used as f64 / memory_limit as f64
            },
            system_health: system_health(memory_used, memory_limit, healthy, principals),
            total_operations: statuses.iter().map(|s| s.operations).sum(),
            cache_hit_rate,
            events_received: statuses.iter().map(|s| s.events_received).sum(),
            sync_runs: totals.runs,
            entries_synced: totals.entries_synced,
            conflicts_resolved: totals.conflicts_resolved,
            pending_reviews: resolver.pending_reviews,
            last_sync_at: totals.last_sync_at,
            bus: self.bus().stats().await,
            resolver,
        }
    }

    /// The most recent sync report, if any run completed.
    pub async fn last_sync_report(&self) -> Option<crate::SyncReport> {
        self.totals.lock().await.last_report.clone()
    }
}
