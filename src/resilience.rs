//! Backpressure for the registry's two contended resources.
//!
//! - [`BusyRetry`]: doubling delays between attempts when SQLite reports
//!   `SQLITE_BUSY` or `SQLITE_LOCKED`
//! - [`RangePacer`]: admission for reconciliation range passes, so a full
//!   pass over a large ID space cannot flood the primary with lookups
//!
//! ```rust,no_run
//! # async fn demo() -> replica_registry::Result<()> {
//! use replica_registry::config::ReconcileConfig;
//! use replica_registry::resilience::RangePacer;
//!
//! let pacer = RangePacer::new(&ReconcileConfig::default());
//! let slot = pacer.admit().await?;
//! // ... one range pass ...
//! drop(slot);
//! # Ok(())
//! # }
//! ```

use crate::config::ReconcileConfig;
use crate::error::{RegistryError, Result};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Retry schedule for a busy or locked database.
///
/// Attempt `n` (1-indexed) waits `first_delay * 2^(n-1)`, clamped to
/// `ceiling`. After `attempts` tries the busy error is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyRetry {
    pub attempts: u32,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for BusyRetry {
    fn default() -> Self {
        Self::store()
    }
}

impl BusyRetry {
    /// Schedule used by the registry store: 10ms, 20ms, 40ms, 80ms, then give up.
    pub fn store() -> Self {
        Self {
            attempts: 5,
            first_delay: Duration::from_millis(10),
            ceiling: Duration::from_millis(500),
        }
    }

    /// Two quick attempts; keeps lock-contention tests fast.
    pub fn testing() -> Self {
        Self {
            attempts: 2,
            first_delay: Duration::from_millis(1),
            ceiling: Duration::from_millis(5),
        }
    }

    /// Wait before retrying after failed attempt `attempt`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.first_delay
            .checked_mul(1u32 << doublings)
            .map_or(self.ceiling, |d| d.min(self.ceiling))
    }
}

/// Admission control for range passes.
///
/// A pass first waits for a token from the optional per-second quota, then
/// for one of `max_concurrent_ranges` slots. The slot is held until the
/// returned [`RangeSlot`] drops.
pub struct RangePacer {
    quota: Option<DirectLimiter>,
    slots: Arc<Semaphore>,
    width: usize,
}

impl std::fmt::Debug for RangePacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangePacer")
            .field("width", &self.width)
            .field("idle_slots", &self.idle_slots())
            .field("rate_limited", &self.is_rate_limited())
            .finish()
    }
}

/// A held range-pass slot.
#[derive(Debug)]
pub struct RangeSlot {
    _permit: OwnedSemaphorePermit,
}

impl RangePacer {
    pub fn new(config: &ReconcileConfig) -> Self {
        let quota = config.rate_limit_enabled.then(|| {
            let per_sec = NonZeroU32::new(config.rate_limit_per_sec).unwrap_or(NonZeroU32::MIN);
            let burst = NonZeroU32::new(config.rate_limit_burst).unwrap_or(NonZeroU32::MIN);
            RateLimiter::direct(Quota::per_second(per_sec).allow_burst(burst))
        });
        // Zero slots would park every pass forever
        let width = config.max_concurrent_ranges.max(1);
        Self {
            quota,
            slots: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    /// Wait until a range pass may start. Cancel-safe.
    pub async fn admit(&self) -> Result<RangeSlot> {
        if let Some(quota) = &self.quota {
            quota.until_ready().await;
        }
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| RegistryError::Internal("range pacer closed".to_string()))?;
        Ok(RangeSlot { _permit: permit })
    }

    /// Number of passes that may run at once.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Slots not currently held.
    pub fn idle_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn is_rate_limited(&self) -> bool {
        self.quota.is_some()
    }
}
