// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic background tasks: range reconciliation and the timeout reaper.
//!
//! Both tasks tick on an interval until shutdown is signaled, and both
//! isolate failures per resource type: one broken type never stops the
//! others.
//!
//! # Backoff on Failure
//!
//! When a reconciliation cycle fails for a resource type (its ID space could
//! not be read), that type is skipped with exponential backoff. Backoff
//! resets on the next successful cycle.

use super::types::RegisteredResource;
use crate::config::{ReaperConfig, ReconcileConfig, VerificationConfig};
use crate::metrics;
use crate::reaper::{self, ReapStats};
use crate::reconcile::{ReconcileStats, Reconciler};
use crate::selective_sync::SiteConfig;
use crate::store::now_millis;
use crate::types::{ResourceType, SiteId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, instrument, warn, Instrument};

/// Registered resource types, shared between the engine and its tasks.
pub type ResourceMap = Arc<RwLock<HashMap<ResourceType, RegisteredResource>>>;

const MIN_TICK: Duration = Duration::from_millis(10);

/// Sorted snapshot so a pass never holds the registration lock across I/O.
async fn snapshot(resources: &ResourceMap) -> Vec<RegisteredResource> {
    let mut registered: Vec<_> = resources.read().await.values().cloned().collect();
    registered.sort_by(|a, b| a.resource_type().cmp(b.resource_type()));
    registered
}

/// Wait for the next tick. Returns `false` once shutdown is signaled.
async fn next_tick(timer: &mut tokio::time::Interval, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    loop {
        tokio::select! {
            biased;

            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    return false;
                }
            }

            _ = timer.tick() => return true,
        }
    }
}

fn interval_timer(period: Duration) -> tokio::time::Interval {
    let mut timer = tokio::time::interval(period.max(MIN_TICK));
    // Skip missed ticks instead of bursting to catch up
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    timer
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reconciliation
// ═══════════════════════════════════════════════════════════════════════════════

/// Run the reconciliation task until shutdown is signaled.
///
/// Each tick runs one budgeted, resumable cycle per registered resource type.
pub async fn run_reconciliation(
    reconciler: Arc<Reconciler>,
    resources: ResourceMap,
    site: SiteConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("reconcile", site = %site.site_id);

    async move {
        // Mark initial shutdown value as seen so changed() only fires on actual changes
        let _ = shutdown_rx.borrow_and_update();

        let config = reconciler.config().clone();
        info!(
            interval_secs = config.interval_sec,
            batch_width = config.batch_width,
            max_ranges_per_cycle = config.max_ranges_per_cycle,
            sync_mode = site.sync_mode.label(),
            "Starting reconciliation task"
        );

        let mut timer = interval_timer(config.interval());

        // Per-type backoff state: (consecutive_failures, backoff_until)
        let mut backoff: HashMap<ResourceType, (u32, Instant)> = HashMap::new();

        while next_tick(&mut timer, &mut shutdown_rx).await {
            let registered = snapshot(&resources).await;
            let results = run_reconcile_pass(
                &reconciler,
                &registered,
                &site,
                &backoff,
                &shutdown_rx,
            )
            .await;
            update_backoff(&mut backoff, &config, results);
        }

        info!("Reconciliation task stopped");
    }
    .instrument(span)
    .await
}

/// One cycle for every registered type not in backoff.
///
/// Returns `(resource_type, success)` for every type that ran.
async fn run_reconcile_pass(
    reconciler: &Reconciler,
    registered: &[RegisteredResource],
    site: &SiteConfig,
    backoff: &HashMap<ResourceType, (u32, Instant)>,
    shutdown_rx: &watch::Receiver<bool>,
) -> Vec<(ResourceType, bool)> {
    let now = Instant::now();
    let runnable: Vec<&RegisteredResource> = registered
        .iter()
        .filter(|r| match backoff.get(r.resource_type()) {
            Some((failures, until)) if now < *until => {
                debug!(
                    resource_type = %r.resource_type(),
                    consecutive_failures = failures,
                    "Skipping reconciliation, in backoff"
                );
                metrics::record_reconcile_skipped(r.resource_type().as_str(), "backoff");
                false
            }
            _ => true,
        })
        .collect();

    futures::future::join_all(runnable.into_iter().map(|r| async move {
        let rt = r.resource_type().clone();
        let start = Instant::now();
        match reconciler
            .run_cycle(r.resource.as_ref(), &r.table, site, shutdown_rx)
            .await
        {
            Ok(stats) => {
                log_cycle(&rt, &stats, start.elapsed());
                (rt, true)
            }
            Err(e) => {
                warn!(resource_type = %rt, error = %e, "Reconciliation cycle failed");
                (rt, false)
            }
        }
    }))
    .await
}

fn log_cycle(resource_type: &ResourceType, stats: &ReconcileStats, duration: Duration) {
    metrics::record_reconcile_cycle(
        resource_type.as_str(),
        stats.ranges_processed,
        stats.range_errors,
        duration,
    );
    if stats.entries_created > 0 || stats.entries_deleted > 0 {
        info!(
            resource_type = %resource_type,
            ranges = stats.ranges_processed,
            range_errors = stats.range_errors,
            created = stats.entries_created,
            deleted = stats.entries_deleted,
            completed_pass = stats.completed_pass,
            duration_ms = duration.as_millis(),
            "Reconciliation cycle complete with changes"
        );
    } else {
        debug!(
            resource_type = %resource_type,
            ranges = stats.ranges_processed,
            range_errors = stats.range_errors,
            completed_pass = stats.completed_pass,
            "Reconciliation cycle complete, no drift"
        );
    }
}

fn update_backoff(
    backoff: &mut HashMap<ResourceType, (u32, Instant)>,
    config: &ReconcileConfig,
    results: Vec<(ResourceType, bool)>,
) {
    for (resource_type, success) in results {
        if success {
            backoff.remove(&resource_type);
        } else {
            let failures = backoff.get(&resource_type).map(|(f, _)| *f).unwrap_or(0) + 1;
            let until = Instant::now() + config.backoff_for_failures(failures);
            backoff.insert(resource_type, (failures, until));
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reaper
// ═══════════════════════════════════════════════════════════════════════════════

/// Totals from one reaper pass over all registered types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperPassStats {
    pub reaped: ReapStats,
    pub reverification_queued: u64,
    /// Resource types whose sweep failed
    pub errors: usize,
}

/// Run the timeout reaper until shutdown is signaled.
pub async fn run_reaper(
    resources: ResourceMap,
    reaper_config: ReaperConfig,
    verification: VerificationConfig,
    site_id: SiteId,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = tracing::info_span!("reaper", site = %site_id);

    async move {
        let _ = shutdown_rx.borrow_and_update();

        info!(
            interval_secs = reaper_config.interval_sec,
            sync_timeout = %reaper_config.sync_timeout,
            verification_timeout = %reaper_config.verification_timeout,
            "Starting timeout reaper task"
        );

        let mut timer = interval_timer(reaper_config.interval());

        while next_tick(&mut timer, &mut shutdown_rx).await {
            let registered = snapshot(&resources).await;
            let stats =
                reap_pass(&registered, &reaper_config, &verification, &site_id, now_millis()).await;
            if stats.reaped.total() > 0 || stats.reverification_queued > 0 {
                info!(
                    sync_timeouts = stats.reaped.sync_timeouts,
                    verification_timeouts = stats.reaped.verification_timeouts,
                    reverification_queued = stats.reverification_queued,
                    errors = stats.errors,
                    "Reaper pass complete"
                );
            }
        }

        info!("Timeout reaper task stopped");
    }
    .instrument(span)
    .await
}

/// Sweep timeouts, queue reverification and refresh status gauges for every type.
#[instrument(skip_all, fields(types = registered.len()))]
pub async fn reap_pass(
    registered: &[RegisteredResource],
    reaper_config: &ReaperConfig,
    verification: &VerificationConfig,
    site_id: &SiteId,
    now: DateTime<Utc>,
) -> ReaperPassStats {
    let mut stats = ReaperPassStats::default();

    for r in registered {
        let rt = r.resource_type();
        let outcome = async {
            let reaped = reaper::reap_timeouts(
                &r.table,
                reaper_config.sync_timeout_duration(),
                reaper_config.verification_timeout_duration(),
                now,
            )
            .await?;
            let queued = reaper::queue_reverification(&r.table, site_id, verification, now).await?;
            let status = r.table.status(site_id).await?;
            metrics::set_registry_status(rt.as_str(), &status);
            Ok::<_, crate::error::RegistryError>((reaped, queued))
        }
        .await;

        match outcome {
            Ok((reaped, queued)) => {
                stats.reaped.sync_timeouts += reaped.sync_timeouts;
                stats.reaped.verification_timeouts += reaped.verification_timeouts;
                stats.reverification_queued += queued;
            }
            Err(e) => {
                stats.errors += 1;
                metrics::record_reaper_error(rt.as_str());
                warn!(resource_type = %rt, error = %e, "Reaper sweep failed");
            }
        }
    }

    stats
}
