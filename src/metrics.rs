//! Registry metrics, emitted through the `metrics` facade.
//!
//! Nothing here installs a recorder. The embedding process picks the
//! exporter; with none installed every call is a no-op.
//!
//! Names share the `registry_` prefix. Counters carry a `_total` suffix,
//! durations are histograms in seconds, and per-state entry counts are
//! gauges labelled by `resource_type` and `state`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use replica_registry::metrics;
//! use std::time::Duration;
//!
//! // After a range pass
//! metrics::record_range_reconciled("package_file", 3, 1, Duration::from_millis(12));
//! ```

use crate::store::RegistryStatus;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Transitions
// =============================================================================

/// Record a state machine transition attempt.
///
/// `outcome` is `"ok"` or an error kind such as `"race_lost"`.
pub fn record_transition(resource_type: &str, machine: &str, event: &str, outcome: &str) {
    counter!(
        "registry_transitions_total",
        "resource_type" => resource_type.to_string(),
        "machine" => machine.to_string(),
        "event" => event.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record entries moved to `started` by a batch claim.
pub fn record_batch_claimed(resource_type: &str, machine: &str, count: usize) {
    counter!(
        "registry_batch_claimed_total",
        "resource_type" => resource_type.to_string(),
        "machine" => machine.to_string()
    )
    .increment(count as u64);
}

/// Record succeeded entries returned to pending for reverification.
pub fn record_reverified(resource_type: &str, count: u64) {
    counter!("registry_reverification_queued_total", "resource_type" => resource_type.to_string())
        .increment(count);
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Record one range pass.
pub fn record_range_reconciled(resource_type: &str, untracked: usize, unused: usize, duration: Duration) {
    let rt = resource_type.to_string();
    counter!("registry_untracked_found_total", "resource_type" => rt.clone()).increment(untracked as u64);
    counter!("registry_unused_tracked_found_total", "resource_type" => rt.clone()).increment(unused as u64);
    histogram!("registry_range_duration_seconds", "resource_type" => rt).record(duration.as_secs_f64());
}

/// Record a range pass that failed and was skipped.
pub fn record_range_error(resource_type: &str) {
    counter!("registry_range_errors_total", "resource_type" => resource_type.to_string()).increment(1);
}

/// Record registry entries created or deleted while applying differences.
pub fn record_entries_applied(resource_type: &str, created: u64, deleted: u64) {
    let rt = resource_type.to_string();
    counter!("registry_entries_created_total", "resource_type" => rt.clone()).increment(created);
    counter!("registry_entries_deleted_total", "resource_type" => rt).increment(deleted);
}

/// Record completion of a reconciliation cycle for one resource type.
pub fn record_reconcile_cycle(resource_type: &str, ranges: usize, errors: usize, duration: Duration) {
    let rt = resource_type.to_string();
    counter!("registry_reconcile_cycles_total", "resource_type" => rt.clone()).increment(1);
    counter!("registry_reconcile_ranges_total", "resource_type" => rt.clone()).increment(ranges as u64);
    if errors > 0 {
        counter!("registry_reconcile_cycle_errors_total", "resource_type" => rt.clone()).increment(errors as u64);
    }
    histogram!("registry_reconcile_cycle_duration_seconds", "resource_type" => rt)
        .record(duration.as_secs_f64());
}

/// Record a skipped reconciliation cycle.
pub fn record_reconcile_skipped(resource_type: &str, reason: &str) {
    counter!(
        "registry_reconcile_skipped_total",
        "resource_type" => resource_type.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// =============================================================================
// Reaper
// =============================================================================

/// Record entries failed by a timeout sweep.
pub fn record_timeouts_reaped(resource_type: &str, machine: &str, count: u64) {
    counter!(
        "registry_timeouts_reaped_total",
        "resource_type" => resource_type.to_string(),
        "machine" => machine.to_string()
    )
    .increment(count);
}

/// Record a sweep that failed for one resource type.
pub fn record_reaper_error(resource_type: &str) {
    counter!("registry_reaper_errors_total", "resource_type" => resource_type.to_string()).increment(1);
}

// =============================================================================
// Store / engine
// =============================================================================

/// Count retries on SQLite busy/locked.
pub fn store_retries_total(operation: &str) {
    counter!("registry_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Engine lifecycle as a number: 0 created, 1 running, 2 shutting down,
/// 3 stopped.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("registry_engine_state").set(value);
}

/// Export a status report as gauges.
pub fn set_registry_status(resource_type: &str, status: &RegistryStatus) {
    let rt = resource_type.to_string();
    for (state, count) in &status.sync {
        gauge!("registry_sync_entries", "resource_type" => rt.clone(), "state" => state.as_str())
            .set(*count as f64);
    }
    for (state, count) in &status.verification {
        gauge!("registry_verification_entries", "resource_type" => rt.clone(), "state" => state.as_str())
            .set(*count as f64);
    }
    gauge!("registry_checksum_mismatch_entries", "resource_type" => rt).set(status.checksum_mismatch as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed; these check the calls don't panic.

    #[test]
    fn test_record_transition() {
        record_transition("package_file", "sync", "start", "ok");
        record_transition("package_file", "sync", "start", "race_lost");
    }

    #[test]
    fn test_record_reconciliation() {
        record_range_reconciled("package_file", 3, 1, Duration::from_millis(5));
        record_range_error("package_file");
        record_entries_applied("package_file", 3, 1);
        record_reconcile_cycle("package_file", 10, 0, Duration::from_secs(1));
        record_reconcile_cycle("package_file", 10, 2, Duration::from_secs(1));
        record_reconcile_skipped("package_file", "backoff");
    }

    #[test]
    fn test_record_reaper() {
        record_timeouts_reaped("lfs_object", "sync", 4);
        record_timeouts_reaped("lfs_object", "verification", 0);
        record_reaper_error("lfs_object");
    }

    #[test]
    fn test_engine_state_values() {
        for state in ["Created", "Running", "ShuttingDown", "Stopped", "Unknown"] {
            set_engine_state(state);
        }
    }

    #[test]
    fn test_set_registry_status() {
        set_registry_status("lfs_object", &RegistryStatus::default());
        record_batch_claimed("lfs_object", "verification", 10);
        record_reverified("lfs_object", 2);
        store_retries_total("transition");
    }
}
