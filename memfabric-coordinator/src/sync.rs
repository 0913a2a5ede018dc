//! Cross-principal synchronization, memory transfer and load balancing.
//!
//! A sync run considers every sharing principal. For each candidate key:
//!
//! 1. Collect the principals holding it, with their version vectors.
//! 2. If they all agree, fold the vectors together and move on.
//! 3. If one holder's vector dominates every other holder, its value wins
//!    without a conflict.
//! 4. Otherwise the writes were concurrent: the resolver settles them
//!    (or escalates to manual review, in which case nothing is written).
//! 5. The settled value is written to every holder that disagrees and to
//!    every non-holder interested in the key's partition.
//!
//! Failures on one key are counted and do not stop the run. Keys with a
//! failed write are marked dirty again on every principal holding them, so
//! the next incremental run retries them.

use crate::coordinator::{Coordinator, CoordinatorSignal};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::principal::{Origin, Principal};
use memfabric_consistency::{VersionVector, VersionedValue};
use memfabric_store::EntryInfo;
use memfabric_types::{BusEvent, InFlight, PrincipalId, now_millis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Which keys a sync run examines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Every live key of every sharing principal.
    Full,
    /// Only keys written locally since the previous run.
    Incremental,
}

/// Outcome of [`Coordinator::synchronize_all`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub keys_examined: usize,
    /// Writes performed to bring principals up to date.
    pub entries_synced: usize,
    /// Keys whose concurrent writes were settled by the resolver.
    pub conflicts_resolved: usize,
    /// Keys left for manual review.
    pub pending_review: Vec<String>,
    pub failures: usize,
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            keys_examined: 0,
            entries_synced: 0,
            conflicts_resolved: 0,
            pending_review: Vec::new(),
            failures: 0,
            duration_ms: 0,
        }
    }
}

/// A request to move entries between principals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: PrincipalId,
    pub to: PrincipalId,
    /// Keys to move; `None` moves everything the source holds.
    pub keys: Option<Vec<String>>,
    /// Keep the source copy after a successful write to the target.
    #[serde(default)]
    pub preserve_original: bool,
}

impl TransferRequest {
    #[must_use]
    pub fn new(from: PrincipalId, to: PrincipalId) -> Self {
        Self {
            from,
            to,
            keys: None,
            preserve_original: false,
        }
    }

    #[must_use]
    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn preserve_original(mut self, preserve: bool) -> Self {
        self.preserve_original = preserve;
        self
    }
}

/// Outcome of [`Coordinator::transfer_memory`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub transferred: usize,
    pub failed: usize,
    /// Keys the source did not hold.
    pub missing: usize,
    pub bytes_moved: u64,
}

/// One source-to-target move made by [`Coordinator::load_balance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceMove {
    pub from: PrincipalId,
    pub to: PrincipalId,
    pub entries: usize,
    pub bytes: u64,
}

/// Outcome of [`Coordinator::load_balance`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadBalanceReport {
    pub moves: Vec<BalanceMove>,
    pub entries_moved: usize,
    pub bytes_moved: u64,
}

struct Holder {
    principal: Arc<Principal>,
    side: VersionedValue,
    info: EntryInfo,
}

impl Holder {
    fn vector(&self) -> VersionVector {
        self.side.vector.clone().unwrap_or_default()
    }
}

/// Index of the holder whose history covers every other holder's, if any.
/// Holders with a different value must be strictly behind it.
fn dominating(holders: &[Holder]) -> Option<usize> {
    holders.iter().position(|h| {
        let ours = h.vector();
        holders.iter().all(|o| {
            let theirs = o.vector();
            if o.side.value == h.side.value {
                ours.dominates(&theirs)
            } else {
                ours.strictly_dominates(&theirs)
            }
        })
    })
}

impl Coordinator {
    /// Reconciles shared keys across all sharing principals.
    ///
    /// Fails with [`CoordinatorError::Busy`] while another run is in flight.
    pub async fn synchronize_all(&self, mode: SyncMode) -> CoordinatorResult<SyncReport> {
        self.ensure_open()?;
        let _guard =
            InFlight::acquire(&self.sync_in_flight).ok_or(CoordinatorError::Busy("sync"))?;
        let started = Instant::now();
        let mut report = SyncReport::new(mode);

        let principals = self.all_principals().await;
        let mut keys = BTreeSet::new();
        for principal in &principals {
            let dirty = principal.take_dirty().await;
            if !principal.config.enable_sharing {
                continue;
            }
            match mode {
                SyncMode::Full => keys.extend(principal.store.keys().await),
                SyncMode::Incremental => keys.extend(dirty),
            }
        }
        let participants: Vec<Arc<Principal>> = principals
            .into_iter()
            .filter(|p| p.config.enable_sharing)
            .collect();

        let mut retry = Vec::new();
        for key in &keys {
            report.keys_examined += 1;
            match self.sync_key(&participants, key, &mut report).await {
                Ok(0) => {}
                Ok(failed) => {
                    report.failures += failed;
                    retry.push(key.clone());
                }
                Err(e) => {
                    warn!("sync of {key} failed: {e}");
                    report.failures += 1;
                    retry.push(key.clone());
                }
            }
        }
        for principal in &participants {
            let mut held = Vec::new();
            for key in &retry {
                if principal.store.contains(key).await {
                    held.push(key.clone());
                }
            }
            principal.mark_dirty(held).await;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut totals = self.totals.lock().await;
            totals.runs += 1;
            totals.entries_synced += report.entries_synced as u64;
            totals.conflicts_resolved += report.conflicts_resolved as u64;
            totals.last_sync_at = Some(now_millis());
            totals.last_report = Some(report.clone());
        }
        info!(
            "{mode:?} sync: {} keys, {} synced, {} conflicts, {} for review, {} failures",
            report.keys_examined,
            report.entries_synced,
            report.conflicts_resolved,
            report.pending_review.len(),
            report.failures
        );
        self.emit(CoordinatorSignal::SyncCompleted {
            mode,
            entries_synced: report.entries_synced,
            conflicts_resolved: report.conflicts_resolved,
            failures: report.failures,
        });
        Ok(report)
    }

    /// Reconciles one key. Returns the number of writes that failed.
    async fn sync_key(
        &self,
        participants: &[Arc<Principal>],
        key: &str,
        report: &mut SyncReport,
    ) -> CoordinatorResult<usize> {
        let mut holders = Vec::new();
        for principal in participants {
            if let Some((side, info)) = principal.versioned(key).await? {
                holders.push(Holder {
                    principal: Arc::clone(principal),
                    side,
                    info,
                });
            }
        }
        let Some(first) = holders.first() else {
            return Ok(0);
        };

        let merged = holders
            .iter()
            .fold(VersionVector::new(), |acc, h| acc.merged(&h.vector()));
        let agreed = holders.iter().all(|h| h.side.value == first.side.value);

        let (mut settled, ttl) = if agreed {
            (first.side.clone(), first.info.ttl)
        } else if let Some(i) = dominating(&holders) {
            debug!("{key}: {} is causally newest", holders[i].principal.id());
            (holders[i].side.clone(), holders[i].info.ttl)
        } else {
            let mut resolver = self.resolver.lock().await;
            let mut settled = first.side.clone();
            for holder in &holders[1..] {
                let resolution =
                    resolver.resolve_conflict(&settled, &holder.side, self.config.default_strategy);
                if resolution.requires_manual_review {
                    report.pending_review.push(key.to_string());
                    self.emit(CoordinatorSignal::ConflictEscalated {
                        key: key.to_string(),
                        review_id: resolution.review_id,
                    });
                    return Ok(0);
                }
                settled = resolution.resolved;
            }
            report.conflicts_resolved += 1;
            (settled, first.info.ttl)
        };
        settled.vector = Some(merged.clone());

        let mut failed = 0;
        for holder in &holders {
            let _op = holder.principal.lock().await;
            if holder.side.value == settled.value {
                holder.principal.adopt_vector(key, &merged).await;
                continue;
            }
            if self.write_settled(&holder.principal, &settled, ttl).await {
                report.entries_synced += 1;
            } else {
                failed += 1;
            }
        }

        for principal in participants {
            if holders.iter().any(|h| Arc::ptr_eq(&h.principal, principal))
                || !principal.config.is_interested_in(&settled.partition_id)
            {
                continue;
            }
            let _op = principal.lock().await;
            if self.write_settled(principal, &settled, ttl).await {
                report.entries_synced += 1;
            } else {
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn write_settled(
        &self,
        principal: &Principal,
        settled: &VersionedValue,
        ttl: Option<u64>,
    ) -> bool {
        let origin = Origin::Remote {
            author: "sync",
            vector: settled.vector.as_ref(),
        };
        match principal
            .put(
                &settled.key,
                &settled.value,
                Some(&settled.partition_id),
                ttl,
                origin,
            )
            .await
        {
            Ok(written) => written,
            Err(e) => {
                warn!("sync write of {} to {} failed: {e}", settled.key, principal.id());
                false
            }
        }
    }

    /// Moves entries between principals. The source copy is removed only
    /// after the target write succeeded, unless `preserve_original` is set;
    /// removals are published like [`remove`](Self::remove).
    /// Unknown principals yield an empty report.
    pub async fn transfer_memory(
        &self,
        request: TransferRequest,
    ) -> CoordinatorResult<TransferReport> {
        self.ensure_open()?;
        let mut report = TransferReport::default();
        if request.from == request.to {
            return Ok(report);
        }
        let (Some(source), Some(target)) = (
            self.principal(&request.from).await,
            self.principal(&request.to).await,
        ) else {
            debug!(
                "transfer between unknown principals {} -> {}",
                request.from, request.to
            );
            return Ok(report);
        };

        // Lock both ends in id order.
        let (_first, _second) = if request.from < request.to {
            let a = source.lock().await;
            (a, target.lock().await)
        } else {
            let b = target.lock().await;
            (b, source.lock().await)
        };
        source.counters.record_operation();
        target.counters.record_operation();

        let keys = match request.keys {
            Some(keys) => keys,
            None => source.store.keys().await,
        };
        for key in &keys {
            let Some((value, info)) = source.peek(key).await? else {
                report.missing += 1;
                continue;
            };
            let vector = source.vector(key).await;
            let origin = Origin::Remote {
                author: request.from.as_str(),
                vector: vector.as_ref(),
            };
            match target
                .put(key, &value, Some(&info.partition_id), info.ttl, origin)
                .await
            {
                Ok(true) => {
                    report.transferred += 1;
                    report.bytes_moved += info.size_bytes;
                    if !request.preserve_original && source.delete(key).await? {
                        self.publish(
                            &source,
                            BusEvent::remove(key, info.partition_id, request.from.as_str()),
                        )
                        .await;
                    }
                }
                Ok(false) => report.failed += 1,
                Err(e) => {
                    debug!("transfer of {key} to {} failed: {e}", request.to);
                    report.failed += 1;
                }
            }
        }
        info!(
            "transferred {}/{} entries {} -> {} ({} bytes)",
            report.transferred,
            keys.len(),
            request.from,
            request.to,
            report.bytes_moved
        );
        Ok(report)
    }

    /// Moves least recently used entries from sharing principals above the
    /// high utilization threshold to sharing principals below the low one.
    pub async fn load_balance(&self) -> CoordinatorResult<LoadBalanceReport> {
        self.ensure_open()?;
        let mut report = LoadBalanceReport::default();
        let high = self.config.high_utilization;
        let low = self.config.low_utilization;

        let statuses: Vec<_> = self
            .principal_statuses()
            .await
            .into_iter()
            .filter(|s| s.sharing && s.memory_limit > 0)
            .collect();
        let mut overloaded: Vec<_> = statuses.iter().filter(|s| s.utilization > high).collect();
        overloaded.sort_by(|a, b| b.utilization.total_cmp(&a.utilization));
        // (id, used, limit) of candidate receivers
        let mut receivers: Vec<(PrincipalId, u64, u64)> = statuses
            .iter()
            .filter(|s| s.utilization < low)
            .map(|s| (s.principal_id.clone(), s.memory_used, s.memory_limit))
            .collect();

        for source in overloaded {
            receivers
                .sort_by_key(|(_, used, limit)| std::cmp::Reverse(limit.saturating_sub(*used)));
            let Some((target_id, target_used, target_limit)) = receivers.first_mut() else {
                break;
            };
            let Some(principal) = self.principal(&source.principal_id).await else {
                continue;
            };

            let excess = source
                .memory_used
                .saturating_sub((high * source.memory_limit as f64) as u64);
            let room = ((high * *target_limit as f64) as u64).saturating_sub(*target_used);
            let mut planned = 0u64;
            let mut keys = Vec::new();
            for info in principal.store.entries_by_recency().await {
                if planned >= excess {
                    break;
                }
                if planned + info.size_bytes > room {
                    continue;
                }
                planned += info.size_bytes;
                keys.push(info.id);
            }
            if keys.is_empty() {
                continue;
            }

            let moved = self
                .transfer_memory(
                    TransferRequest::new(source.principal_id.clone(), target_id.clone()).keys(keys),
                )
                .await?;
            *target_used += moved.bytes_moved;
            report.entries_moved += moved.transferred;
            report.bytes_moved += moved.bytes_moved;
            report.moves.push(BalanceMove {
                from: source.principal_id.clone(),
                to: target_id.clone(),
                entries: moved.transferred,
                bytes: moved.bytes_moved,
            });
        }
        if !report.moves.is_empty() {
            info!(
                "load balance moved {} entries ({} bytes)",
                report.entries_moved, report.bytes_moved
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoordinatorConfig;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn overlapping_runs_are_refused() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        coordinator.sync_in_flight.store(true, Ordering::SeqCst);
        assert!(matches!(
            coordinator.synchronize_all(SyncMode::Full).await,
            Err(CoordinatorError::Busy("sync"))
        ));

        coordinator.sync_in_flight.store(false, Ordering::SeqCst);
        let report = coordinator.synchronize_all(SyncMode::Full).await.unwrap();
        assert_eq!(report.keys_examined, 0);
        assert!(!coordinator.sync_in_flight.load(Ordering::SeqCst));
    }
}
