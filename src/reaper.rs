//! Timeout reaper: bounds how long an entry can stay `started`.
//!
//! A worker that crashes mid-transfer leaves its entry `started` forever and
//! blocks every retry. Each sweep fails such entries with reason `timeout`
//! using one bulk UPDATE per axis, which also schedules their `retry_at`.
//!
//! The same periodic task returns long-verified entries to `pending` so
//! checksums are re-checked on a schedule.

use crate::config::VerificationConfig;
use crate::error::Result;
use crate::metrics;
use crate::store::RegistryTable;
use crate::types::SiteId;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, instrument};

/// Statistics from one sweep of one resource type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub sync_timeouts: u64,
    pub verification_timeouts: u64,
}

impl ReapStats {
    pub fn total(&self) -> u64 {
        self.sync_timeouts + self.verification_timeouts
    }
}

/// Fail every sync and verification of this type started before `now - deadline`.
#[instrument(skip_all, fields(resource_type = %table.resource_type()))]
pub async fn reap_timeouts(
    table: &RegistryTable,
    sync_deadline: Duration,
    verification_deadline: Duration,
    now: DateTime<Utc>,
) -> Result<ReapStats> {
    let sync_timeouts = table.fail_sync_timeouts(now, sync_deadline).await?;
    let verification_timeouts = table
        .fail_verification_timeouts(now, verification_deadline)
        .await?;

    let rt = table.resource_type().as_str();
    metrics::record_timeouts_reaped(rt, "sync", sync_timeouts);
    metrics::record_timeouts_reaped(rt, "verification", verification_timeouts);

    let stats = ReapStats {
        sync_timeouts,
        verification_timeouts,
    };
    debug!(
        sync_timeouts,
        verification_timeouts, "Timeout sweep complete"
    );
    Ok(stats)
}

/// Return one batch of entries verified longer than `reverify_after` ago to `pending`.
pub async fn queue_reverification(
    table: &RegistryTable,
    site_id: &SiteId,
    config: &VerificationConfig,
    now: DateTime<Utc>,
) -> Result<u64> {
    if !config.enabled {
        return Ok(0);
    }
    let age = chrono::Duration::from_std(config.reverify_after_duration())
        .unwrap_or_else(|_| chrono::Duration::days(90));
    table
        .reverify_batch(site_id, now - age, config.reverification_batch_size)
        .await
}
