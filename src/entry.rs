//! Registry entry: sync and verification bookkeeping for one (resource, site).
//!
//! Every mutation goes through a transition method here. Each method first
//! asks the state table in [`crate::state`] for the next state, then updates
//! the dependent fields, so the invariants below cannot be broken by a caller:
//!
//! - `verification_checksum` is present iff `verification_state == Succeeded`
//! - `verification_state != Pending` implies `sync_state == Synced`
//!
//! The store persists entries and guards the `start_*` transitions with a
//! compare-and-set on `lock_version`. Verification results are additionally
//! fenced by `verification_attempt`: a worker whose attempt was timed out and
//! restarted elsewhere cannot complete the newer attempt.

use crate::config::RetryBackoffConfig;
use crate::error::{RegistryError, Result};
use crate::state::{SyncEvent, SyncState, VerificationEvent, VerificationState};
use crate::types::{Checksum, ResourceId, SiteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure reason recorded by the timeout reaper.
pub const TIMEOUT_REASON: &str = "timeout";

/// Failure reason recorded when a computed checksum differs from the primary's.
pub const CHECKSUM_MISMATCH_REASON: &str = "checksum_mismatch";

/// Longest failure reason stored, in characters.
pub const MAX_FAILURE_LEN: usize = 255;

/// Why a verification attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationFailure {
    /// The secondary's checksum was computed but differs from the primary's.
    ChecksumMismatch { computed: Checksum },
    /// The attempt exceeded the verification deadline.
    Timeout,
    /// Checksum could not be computed.
    Error(String),
}

impl VerificationFailure {
    pub fn reason(&self) -> &str {
        match self {
            VerificationFailure::ChecksumMismatch { .. } => CHECKSUM_MISMATCH_REASON,
            VerificationFailure::Timeout => TIMEOUT_REASON,
            VerificationFailure::Error(message) => message,
        }
    }
}

/// A started verification: which entry, and which attempt of it.
///
/// Results must be reported with the same `attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VerificationLease {
    pub resource_id: ResourceId,
    pub attempt: i64,
}

/// Persisted state of one resource on one secondary site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub site_id: SiteId,
    pub resource_id: ResourceId,

    pub sync_state: SyncState,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub sync_retry_count: u32,
    pub sync_retry_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_failure: Option<String>,

    pub verification_state: VerificationState,
    pub verification_started_at: Option<DateTime<Utc>>,
    pub verification_checksum: Option<Checksum>,
    /// Checksum computed on the last attempt that mismatched the primary.
    pub verification_checksum_mismatched: Option<Checksum>,
    pub checksum_mismatch: bool,
    pub verification_retry_count: u32,
    pub verification_retry_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_failure: Option<String>,
    /// Incremented by every verification start.
    pub verification_attempt: i64,

    /// Bumped on every persisted transition; the compare-and-set token.
    pub lock_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegistryEntry {
    /// A freshly tracked resource: both axes pending.
    pub fn new_pending(site_id: SiteId, resource_id: ResourceId, now: DateTime<Utc>) -> Self {
        Self {
            site_id,
            resource_id,
            sync_state: SyncState::Pending,
            sync_started_at: None,
            sync_retry_count: 0,
            sync_retry_at: None,
            last_synced_at: None,
            last_sync_failure: None,
            verification_state: VerificationState::Pending,
            verification_started_at: None,
            verification_checksum: None,
            verification_checksum_mismatched: None,
            checksum_mismatch: false,
            verification_retry_count: 0,
            verification_retry_at: None,
            verified_at: None,
            verification_failure: None,
            verification_attempt: 0,
            lock_version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Sync axis
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn start_sync(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.sync_state = self.sync_state.on(SyncEvent::Start)?;
        self.sync_started_at = Some(now);
        self.touch(now);
        Ok(())
    }

    /// Mark synced. The new copy has not been verified, so verification restarts.
    pub fn succeed_sync(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.sync_state = self.sync_state.on(SyncEvent::Succeed)?;
        self.last_synced_at = Some(now);
        self.last_sync_failure = None;
        self.sync_retry_count = 0;
        self.sync_retry_at = None;
        self.clear_verification();
        self.touch(now);
        Ok(())
    }

    pub fn fail_sync(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
        backoff: &RetryBackoffConfig,
    ) -> Result<()> {
        self.sync_state = self.sync_state.on(SyncEvent::Fail)?;
        self.sync_retry_count = self.sync_retry_count.saturating_add(1);
        self.sync_retry_at = Some(retry_at(now, self.sync_retry_count, backoff));
        self.last_sync_failure = Some(truncate_reason(reason));
        self.touch(now);
        Ok(())
    }

    /// Requeue from any state. Any previous verification no longer applies.
    pub fn reset_sync(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.sync_state = self.sync_state.on(SyncEvent::Reset)?;
        self.sync_started_at = None;
        self.sync_retry_at = None;
        self.clear_verification();
        self.touch(now);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Verification axis
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn start_verification(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.sync_state != SyncState::Synced {
            return Err(RegistryError::Precondition(format!(
                "resource {} cannot start verification while sync is {}",
                self.resource_id, self.sync_state
            )));
        }
        self.verification_state = self.verification_state.on(VerificationEvent::Start)?;
        self.verification_started_at = Some(now);
        self.verification_attempt = self.verification_attempt.saturating_add(1);
        self.touch(now);
        Ok(())
    }

    /// Record a checksum that matches the primary.
    pub fn succeed_verification(&mut self, checksum: Checksum, now: DateTime<Utc>) -> Result<()> {
        self.verification_state = self.verification_state.on(VerificationEvent::Succeed)?;
        self.verification_checksum = Some(checksum);
        self.verification_checksum_mismatched = None;
        self.checksum_mismatch = false;
        self.verification_failure = None;
        self.verification_retry_count = 0;
        self.verification_retry_at = None;
        self.verified_at = Some(now);
        self.touch(now);
        Ok(())
    }

    pub fn fail_verification(
        &mut self,
        failure: &VerificationFailure,
        now: DateTime<Utc>,
        backoff: &RetryBackoffConfig,
    ) -> Result<()> {
        self.verification_state = self.verification_state.on(VerificationEvent::Fail)?;
        self.verification_checksum = None;
        match failure {
            VerificationFailure::ChecksumMismatch { computed } => {
                self.checksum_mismatch = true;
                self.verification_checksum_mismatched = Some(computed.clone());
            }
            _ => {
                self.checksum_mismatch = false;
                self.verification_checksum_mismatched = None;
            }
        }
        self.verification_retry_count = self.verification_retry_count.saturating_add(1);
        self.verification_retry_at = Some(retry_at(now, self.verification_retry_count, backoff));
        self.verification_failure = Some(truncate_reason(failure.reason()));
        self.touch(now);
        Ok(())
    }

    pub fn reset_verification(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.verification_state = self.verification_state.on(VerificationEvent::Reset)?;
        self.verification_started_at = None;
        self.verification_checksum = None;
        self.verification_retry_at = None;
        self.touch(now);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    /// Both structural invariants hold.
    pub fn satisfies_invariants(&self) -> bool {
        let checksum_ok = self.verification_checksum.is_some()
            == (self.verification_state == VerificationState::Succeeded);
        let precondition_ok = self.verification_state == VerificationState::Pending
            || self.sync_state == SyncState::Synced;
        checksum_ok && precondition_ok
    }

    /// The verification lease a worker holds after starting this entry.
    pub fn verification_lease(&self) -> VerificationLease {
        VerificationLease {
            resource_id: self.resource_id,
            attempt: self.verification_attempt,
        }
    }

    /// Reject a result reported for an attempt other than the one in flight.
    ///
    /// Only applies while verification is `started`; any other state is left
    /// to the transition table.
    pub fn check_verification_attempt(&self, attempt: i64) -> Result<()> {
        if self.verification_state == VerificationState::Started
            && attempt != self.verification_attempt
        {
            return Err(RegistryError::RaceLost {
                resource_id: self.resource_id,
            });
        }
        Ok(())
    }

    /// Whether a failed sync may be claimed again at `now`.
    pub fn sync_retry_due(&self, now: DateTime<Utc>) -> bool {
        match self.sync_state {
            SyncState::Pending => true,
            SyncState::Failed => self.sync_retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    fn clear_verification(&mut self) {
        self.verification_state = VerificationState::Pending;
        self.verification_started_at = None;
        self.verification_checksum = None;
        self.verification_checksum_mismatched = None;
        self.checksum_mismatch = false;
        self.verification_retry_count = 0;
        self.verification_retry_at = None;
        self.verification_failure = None;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Truncate a failure reason to [`MAX_FAILURE_LEN`] characters.
pub fn truncate_reason(reason: &str) -> String {
    reason.chars().take(MAX_FAILURE_LEN).collect()
}

fn retry_at(now: DateTime<Utc>, retry_count: u32, backoff: &RetryBackoffConfig) -> DateTime<Utc> {
    // retry_delay is clamped to a year, so neither step can overflow in practice
    chrono::Duration::from_std(backoff.retry_delay(retry_count))
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
