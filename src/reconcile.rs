// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Range reconciliation: drift between the primary and the registry.
//!
//! Catches anything the replication coordinator missed (lost events,
//! selective sync changes, deletes while a site was down).
//!
//! # Algorithm
//!
//! For one half-open range `[low, high)` of a resource type's ID space:
//!
//! 1. `existing`  = IDs in range that exist on the primary (one ranged lookup)
//! 2. `tracked`   = IDs in range with a registry entry for the site (one ranged lookup)
//! 3. `in_scope`  = `existing` filtered by the site's selective sync mode
//! 4. `untracked` = `in_scope - tracked`  → create pending entries
//! 5. `unused`    = `tracked - in_scope`  → delete entries
//!
//! Each pass is O(range width). Nothing is written until both sets are known,
//! so a pass can be dropped at any await point. Passes are idempotent: a
//! resource created or deleted between the two lookups is misclassified for
//! at most one pass.
//!
//! # Cycles
//!
//! [`Reconciler::run_cycle`] walks a resource type's ID space in
//! `batch_width` ranges, at most `max_ranges_per_cycle` per call, resuming
//! where the previous cycle stopped. A failing range is logged and skipped;
//! it never aborts the cycle.

use crate::config::ReconcileConfig;
use crate::error::{RegistryError, Result};
use crate::metrics;
use crate::resilience::RangePacer;
use crate::resource::Replicable;
use crate::selective_sync::{ScopeFilter, SiteConfig};
use crate::store::RegistryTable;
use crate::types::{IdRange, ResourceId, ResourceType, SiteId};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

/// Drift found in one range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDifferences {
    /// In scope on the primary, no registry entry.
    pub untracked: BTreeSet<ResourceId>,
    /// Registry entry whose resource is gone or out of scope.
    pub unused_tracked: BTreeSet<ResourceId>,
}

impl RegistryDifferences {
    pub fn is_empty(&self) -> bool {
        self.untracked.is_empty() && self.unused_tracked.is_empty()
    }
}

/// Set differences between in-scope and tracked IDs.
pub fn diff_ids(in_scope: &BTreeSet<ResourceId>, tracked: &BTreeSet<ResourceId>) -> RegistryDifferences {
    RegistryDifferences {
        untracked: in_scope.difference(tracked).copied().collect(),
        unused_tracked: tracked.difference(in_scope).copied().collect(),
    }
}

/// Compute the drift in `range` for `site`.
pub async fn find_registry_differences(
    resource: &dyn Replicable,
    table: &RegistryTable,
    range: IdRange,
    site: &SiteConfig,
) -> Result<RegistryDifferences> {
    let filter = ScopeFilter::new(site);
    find_differences(resource, table, range, &site.site_id, &filter).await
}

/// [`find_registry_differences`] with a filter materialized by the caller.
pub async fn find_differences(
    resource: &dyn Replicable,
    table: &RegistryTable,
    range: IdRange,
    site_id: &SiteId,
    filter: &ScopeFilter,
) -> Result<RegistryDifferences> {
    let resource_type = resource.resource_type();

    let mut existing = resource
        .existing_ids_in_range(range)
        .await
        .map_err(|e| RegistryError::resource(resource_type, e.0))?;
    existing.retain(|id| range.contains(*id));

    let in_scope = if filter.is_selective() && !existing.is_empty() {
        let scopes = resource
            .owning_scopes(&existing)
            .await
            .map_err(|e| RegistryError::resource(resource_type, e.0))?;
        filter.filter_ids(&existing, &scopes)
    } else {
        existing
    };

    let tracked = table.tracked_ids_in_range(site_id, range).await?;

    Ok(diff_ids(&in_scope, &tracked))
}

/// Rows written when applying differences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedDifferences {
    pub created: u64,
    pub deleted: u64,
}

/// Create pending entries for untracked IDs and delete unused ones.
///
/// Both steps are idempotent; an ID reported twice is harmless.
pub async fn apply_differences(
    table: &RegistryTable,
    site_id: &SiteId,
    differences: &RegistryDifferences,
) -> Result<AppliedDifferences> {
    let created = table
        .create_pending_many(site_id, &differences.untracked)
        .await?;
    let deleted = table
        .delete_many(site_id, &differences.unused_tracked)
        .await?;
    if created > 0 || deleted > 0 {
        metrics::record_entries_applied(table.resource_type().as_str(), created, deleted);
    }
    Ok(AppliedDifferences { created, deleted })
}

/// Statistics from a reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Ranges that completed
    pub ranges_processed: usize,
    /// Ranges that failed and were skipped
    pub range_errors: usize,
    pub untracked_found: usize,
    pub unused_found: usize,
    pub entries_created: u64,
    pub entries_deleted: u64,
    /// The cycle reached the end of the ID space (next cycle starts over)
    pub completed_pass: bool,
}

impl ReconcileStats {
    fn absorb(&mut self, differences: &RegistryDifferences, applied: AppliedDifferences) {
        self.ranges_processed += 1;
        self.untracked_found += differences.untracked.len();
        self.unused_found += differences.unused_tracked.len();
        self.entries_created += applied.created;
        self.entries_deleted += applied.deleted;
    }
}

/// Runs range passes with pacing, concurrency limits and resumable cursors.
pub struct Reconciler {
    config: ReconcileConfig,
    pacer: RangePacer,
    /// Next range start per resource type
    cursors: Mutex<HashMap<ResourceType, ResourceId>>,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            pacer: RangePacer::new(&config),
            config,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Where the next cycle for `resource_type` starts, if mid-pass.
    pub async fn cursor(&self, resource_type: &ResourceType) -> Option<ResourceId> {
        self.cursors.lock().await.get(resource_type).copied()
    }

    /// One paced range pass. Read-only.
    #[instrument(skip_all, fields(resource_type = %table.resource_type(), range = %range))]
    pub async fn reconcile_range(
        &self,
        resource: &dyn Replicable,
        table: &RegistryTable,
        range: IdRange,
        site_id: &SiteId,
        filter: &ScopeFilter,
    ) -> Result<RegistryDifferences> {
        let _slot = self.pacer.admit().await?;

        let start = Instant::now();
        let differences = find_differences(resource, table, range, site_id, filter).await?;
        metrics::record_range_reconciled(
            table.resource_type().as_str(),
            differences.untracked.len(),
            differences.unused_tracked.len(),
            start.elapsed(),
        );
        if !differences.is_empty() {
            debug!(
                untracked = differences.untracked.len(),
                unused = differences.unused_tracked.len(),
                "Range has drift"
            );
        }
        Ok(differences)
    }

    /// One paced range pass followed by applying its differences.
    pub async fn reconcile_and_apply(
        &self,
        resource: &dyn Replicable,
        table: &RegistryTable,
        range: IdRange,
        site_id: &SiteId,
        filter: &ScopeFilter,
    ) -> Result<(RegistryDifferences, AppliedDifferences)> {
        let differences = self
            .reconcile_range(resource, table, range, site_id, filter)
            .await?;
        let applied = apply_differences(table, site_id, &differences).await?;
        Ok((differences, applied))
    }

    /// Reconcile the next `max_ranges_per_cycle` ranges of one resource type.
    ///
    /// Fails only if the ID space cannot be determined. Per-range failures
    /// are counted in [`ReconcileStats::range_errors`].
    #[instrument(skip_all, fields(resource_type = %table.resource_type()))]
    pub async fn run_cycle(
        &self,
        resource: &dyn Replicable,
        table: &RegistryTable,
        site: &SiteConfig,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ReconcileStats> {
        let resource_type = table.resource_type().clone();
        let Some(space) = id_space(resource, table, &site.site_id).await? else {
            self.cursors.lock().await.remove(&resource_type);
            return Ok(ReconcileStats {
                completed_pass: true,
                ..Default::default()
            });
        };

        let start = self
            .cursor(&resource_type)
            .await
            .filter(|c| space.contains(*c))
            .unwrap_or(space.low());
        let remaining = IdRange::new(start, space.high())
            .map_err(|e| RegistryError::Internal(e.to_string()))?;
        let ranges = remaining
            .batches(self.config.batch_width)
            .take(self.config.max_ranges_per_cycle.max(1));

        let filter = ScopeFilter::new(site);
        let (stats, next) = self
            .process_ranges(resource, table, &site.site_id, &filter, ranges, shutdown)
            .await;

        let mut cursors = self.cursors.lock().await;
        let completed_pass = match next {
            Some(next) if next < space.high() => {
                cursors.insert(resource_type, next);
                false
            }
            _ => {
                cursors.remove(&resource_type);
                true
            }
        };
        Ok(ReconcileStats {
            completed_pass,
            ..stats
        })
    }

    /// Reconcile the whole ID space of one resource type, ignoring the
    /// per-cycle budget and the cursor.
    #[instrument(skip_all, fields(resource_type = %table.resource_type()))]
    pub async fn reconcile_all(
        &self,
        resource: &dyn Replicable,
        table: &RegistryTable,
        site: &SiteConfig,
    ) -> Result<ReconcileStats> {
        let Some(space) = id_space(resource, table, &site.site_id).await? else {
            return Ok(ReconcileStats {
                completed_pass: true,
                ..Default::default()
            });
        };
        let filter = ScopeFilter::new(site);
        let (_never_shutdown_tx, shutdown) = watch::channel(false);
        let (stats, _) = self
            .process_ranges(
                resource,
                table,
                &site.site_id,
                &filter,
                space.batches(self.config.batch_width),
                &shutdown,
            )
            .await;

        info!(
            ranges = stats.ranges_processed,
            errors = stats.range_errors,
            created = stats.entries_created,
            deleted = stats.entries_deleted,
            "Full reconciliation complete"
        );
        Ok(ReconcileStats {
            completed_pass: true,
            ..stats
        })
    }

    /// Process `ranges` concurrently, pulling them lazily from the iterator.
    /// Returns stats and the resume point: the first range skipped for
    /// shutdown, else the end of the last range.
    async fn process_ranges(
        &self,
        resource: &dyn Replicable,
        table: &RegistryTable,
        site_id: &SiteId,
        filter: &ScopeFilter,
        ranges: impl Iterator<Item = IdRange>,
        shutdown: &watch::Receiver<bool>,
    ) -> (ReconcileStats, Option<ResourceId>) {
        let concurrency = self.config.max_concurrent_ranges.max(1);
        let mut results = std::pin::pin!(stream::iter(ranges)
            .map(|range| async move {
                if *shutdown.borrow() {
                    return (range, None);
                }
                let result = self
                    .reconcile_and_apply(resource, table, range, site_id, filter)
                    .await;
                (range, Some(result))
            })
            .buffer_unordered(concurrency));

        let mut stats = ReconcileStats::default();
        let mut first_skipped: Option<ResourceId> = None;
        let mut furthest: Option<ResourceId> = None;
        while let Some((range, result)) = results.next().await {
            furthest = Some(furthest.map_or(range.high(), |h| h.max(range.high())));
            match result {
                Some(Ok((differences, applied))) => stats.absorb(&differences, applied),
                Some(Err(e)) => {
                    stats.range_errors += 1;
                    metrics::record_range_error(table.resource_type().as_str());
                    warn!(
                        resource_type = %table.resource_type(),
                        range = %range,
                        error = %e,
                        "Range reconciliation failed, skipping"
                    );
                }
                None => {
                    first_skipped = Some(first_skipped.map_or(range.low(), |s| s.min(range.low())));
                }
            }
        }

        (stats, first_skipped.or(furthest))
    }
}

/// Union of the primary's and the registry's ID bounds, as a range.
async fn id_space(
    resource: &dyn Replicable,
    table: &RegistryTable,
    site_id: &SiteId,
) -> Result<Option<IdRange>> {
    let primary = resource
        .id_bounds()
        .await
        .map_err(|e| RegistryError::resource(resource.resource_type(), e.0))?;
    let tracked = table.id_bounds(site_id).await?;
    let bounds = match (primary, tracked) {
        (Some((pmin, pmax)), Some((tmin, tmax))) => Some((pmin.min(tmin), pmax.max(tmax))),
        (primary, tracked) => primary.or(tracked),
    };
    bounds
        .map(|(min, max)| {
            IdRange::covering(min, max).map_err(|e| RegistryError::Internal(e.to_string()))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryBackoffConfig, StoreConfig};
    use crate::resource::StaticResource;
    use crate::selective_sync::ScopeDescriptor;
    use crate::store::RegistryStore;

    fn ids(values: &[ResourceId]) -> BTreeSet<ResourceId> {
        values.iter().copied().collect()
    }

    async fn fixture() -> (RegistryStore, RegistryTable, StaticResource) {
        let rt = ResourceType::new("package_file").unwrap();
        let store = RegistryStore::open(&StoreConfig::in_memory(), RetryBackoffConfig::default())
            .await
            .unwrap();
        let table = store.table(&rt).await.unwrap();
        (store, table, StaticResource::new(rt))
    }

    #[test]
    fn test_diff_ids() {
        let diff = diff_ids(&ids(&[100, 101, 103, 107]), &ids(&[101, 105]));
        assert_eq!(diff.untracked, ids(&[100, 103, 107]));
        assert_eq!(diff.unused_tracked, ids(&[105]));
        assert!(diff_ids(&ids(&[1]), &ids(&[1])).is_empty());
    }

    #[tokio::test]
    async fn test_find_differences_all_mode() {
        let (_store, table, resource) = fixture().await;
        let site = SiteConfig::all("secondary-1");
        for id in [100, 101, 103, 107] {
            resource.insert(id, ScopeDescriptor::new(vec![1], "default")).await;
        }
        table.create_pending_many(&site.site_id, &ids(&[101, 105])).await.unwrap();

        let range = IdRange::new(100, 110).unwrap();
        let diff = find_registry_differences(&resource, &table, range, &site)
            .await
            .unwrap();
        assert_eq!(diff.untracked, ids(&[100, 103, 107]));
        assert_eq!(diff.unused_tracked, ids(&[105]));
    }

    #[tokio::test]
    async fn test_find_differences_ignores_outside_range() {
        let (_store, table, resource) = fixture().await;
        let site = SiteConfig::all("secondary-1");
        resource.insert(5, ScopeDescriptor::default()).await;
        resource.insert(15, ScopeDescriptor::default()).await;
        table.create_pending_many(&site.site_id, &ids(&[16])).await.unwrap();

        let diff = find_registry_differences(&resource, &table, IdRange::new(0, 10).unwrap(), &site)
            .await
            .unwrap();
        assert_eq!(diff.untracked, ids(&[5]));
        assert!(diff.unused_tracked.is_empty());
    }

    #[tokio::test]
    async fn test_apply_differences_is_idempotent() {
        let (_store, table, _resource) = fixture().await;
        let site_id = SiteId::new("secondary-1");
        table.create_pending_many(&site_id, &ids(&[9])).await.unwrap();
        let diff = RegistryDifferences {
            untracked: ids(&[1, 2]),
            unused_tracked: ids(&[9]),
        };
        let first = apply_differences(&table, &site_id, &diff).await.unwrap();
        assert_eq!(first, AppliedDifferences { created: 2, deleted: 1 });
        let second = apply_differences(&table, &site_id, &diff).await.unwrap();
        assert_eq!(second, AppliedDifferences::default());
    }

    #[tokio::test]
    async fn test_run_cycle_resumes_from_cursor() {
        let (_store, table, resource) = fixture().await;
        let site = SiteConfig::all("secondary-1");
        for id in 0..50 {
            resource.insert(id, ScopeDescriptor::default()).await;
        }
        let reconciler = Reconciler::new(ReconcileConfig {
            batch_width: 10,
            max_ranges_per_cycle: 2,
            ..Default::default()
        });
        let (_tx, shutdown) = watch::channel(false);

        let stats = reconciler.run_cycle(&resource, &table, &site, &shutdown).await.unwrap();
        assert_eq!(stats.ranges_processed, 2);
        assert_eq!(stats.entries_created, 20);
        assert!(!stats.completed_pass);
        assert_eq!(reconciler.cursor(resource.resource_type()).await, Some(20));

        reconciler.run_cycle(&resource, &table, &site, &shutdown).await.unwrap();
        let stats = reconciler.run_cycle(&resource, &table, &site, &shutdown).await.unwrap();
        assert_eq!(stats.ranges_processed, 1);
        assert!(stats.completed_pass);
        assert_eq!(reconciler.cursor(resource.resource_type()).await, None);
        assert_eq!(table.status(&site.site_id).await.unwrap().total, 50);
    }

    #[tokio::test]
    async fn test_run_cycle_isolates_range_errors() {
        let (_store, table, resource) = fixture().await;
        let site = SiteConfig::all("secondary-1");
        for id in 0..30 {
            resource.insert(id, ScopeDescriptor::default()).await;
        }
        resource.poison(15).await;
        let reconciler = Reconciler::new(ReconcileConfig {
            batch_width: 10,
            ..Default::default()
        });
        let (_tx, shutdown) = watch::channel(false);

        let stats = reconciler.run_cycle(&resource, &table, &site, &shutdown).await.unwrap();
        assert_eq!(stats.ranges_processed, 2);
        assert_eq!(stats.range_errors, 1);
        assert_eq!(stats.entries_created, 20);
        assert!(stats.completed_pass);
    }

    #[tokio::test]
    async fn test_run_cycle_stops_on_shutdown() {
        let (_store, table, resource) = fixture().await;
        let site = SiteConfig::all("secondary-1");
        for id in 0..30 {
            resource.insert(id, ScopeDescriptor::default()).await;
        }
        let reconciler = Reconciler::new(ReconcileConfig {
            batch_width: 10,
            ..Default::default()
        });
        let (tx, shutdown) = watch::channel(false);
        tx.send(true).unwrap();

        let stats = reconciler.run_cycle(&resource, &table, &site, &shutdown).await.unwrap();
        assert_eq!(stats.ranges_processed, 0);
        assert!(!stats.completed_pass);
        // Nothing was written
        assert_eq!(table.status(&site.site_id).await.unwrap().total, 0);
        assert_eq!(reconciler.cursor(resource.resource_type()).await, Some(0));
    }

    #[tokio::test]
    async fn test_reconcile_all_removes_orphans_beyond_primary() {
        let (_store, table, resource) = fixture().await;
        let site = SiteConfig::all("secondary-1");
        resource.insert(1, ScopeDescriptor::default()).await;
        // Registry knows about IDs far past the primary's max
        table.create_pending_many(&site.site_id, &ids(&[500, 25_000])).await.unwrap();

        let reconciler = Reconciler::new(ReconcileConfig::default());
        let stats = reconciler.reconcile_all(&resource, &table, &site).await.unwrap();
        assert_eq!(stats.entries_created, 1);
        assert_eq!(stats.entries_deleted, 2);
        assert_eq!(stats.ranges_processed, 3);
        assert!(stats.completed_pass);
    }

    #[tokio::test]
    async fn test_ranges_are_pulled_as_slots_free() {
        let (_store, table, resource) = fixture().await;
        let site = SiteConfig::all("secondary-1");
        let reconciler = Reconciler::new(ReconcileConfig {
            max_concurrent_ranges: 1,
            ..Default::default()
        });
        let (shutdown_tx, shutdown) = watch::channel(false);
        let pulled = std::sync::atomic::AtomicUsize::new(0);

        // Shutdown is raised when the fifth range is pulled. Had the ranges
        // been collected up front, nothing would have been reconciled.
        let ranges = IdRange::new(0, 1_000).unwrap().batches(10).inspect(|_| {
            if pulled.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 4 {
                shutdown_tx.send_replace(true);
            }
        });
        let filter = ScopeFilter::new(&site);
        let (stats, next) = reconciler
            .process_ranges(&resource, &table, &site.site_id, &filter, ranges, &shutdown)
            .await;

        assert_eq!(stats.ranges_processed, 4);
        assert_eq!(next, Some(40));
    }

    #[tokio::test]
    async fn test_empty_space_completes() {
        let (_store, table, resource) = fixture().await;
        let reconciler = Reconciler::new(ReconcileConfig::default());
        let stats = reconciler
            .reconcile_all(&resource, &table, &SiteConfig::all("s"))
            .await
            .unwrap();
        assert_eq!(stats.ranges_processed, 0);
        assert!(stats.completed_pass);
    }
}
