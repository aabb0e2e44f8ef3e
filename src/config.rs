//! Configuration for the registry engine.
//!
//! Configuration is passed to [`RegistryEngine::open()`](crate::RegistryEngine::open)
//! and can be constructed programmatically or deserialized with serde
//! ([`RegistryConfig::from_json`] covers the JSON case).
//!
//! # Quick Start
//!
//! ```rust
//! use replica_registry::config::{RegistryConfig, StoreConfig};
//! use replica_registry::SiteConfig;
//!
//! let config = RegistryConfig {
//!     site: SiteConfig::by_namespace("eu-west-1", [42]),
//!     store: StoreConfig::in_memory(),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! RegistryConfig
//! ├── site: SiteConfig                 # This secondary + selective sync mode
//! ├── settings: RegistrySettings
//! │   ├── reconcile: ReconcileConfig   # Range reconciliation passes
//! │   ├── reaper: ReaperConfig         # Stuck "started" sweeps
//! │   ├── retry: RetryBackoffConfig    # retry_at scheduling after failures
//! │   └── verification: VerificationConfig
//! └── store: StoreConfig               # SQLite registry tables
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "site": {
//!     "site_id": "eu-west-1",
//!     "sync_mode": { "mode": "by_shard", "shards": ["default"] }
//!   },
//!   "settings": {
//!     "reconcile": { "interval_sec": 60, "batch_width": 10000 },
//!     "reaper": { "sync_timeout": "8h" }
//!   },
//!   "store": { "sqlite_path": "/var/lib/app/registry.db" }
//! }
//! ```

use crate::selective_sync::SiteConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `RegistryEngine::open()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// The secondary site this engine tracks, with its selective sync mode.
    pub site: SiteConfig,

    /// Tunables for reconciliation, sweeps, retries and verification.
    #[serde(default)]
    pub settings: RegistrySettings,

    /// Registry persistence settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            site: SiteConfig::all("local.dev.site.default"),
            settings: RegistrySettings::default(),
            store: StoreConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(site_id: &str) -> Self {
        Self {
            site: SiteConfig::all(site_id),
            settings: RegistrySettings::default(),
            store: StoreConfig::in_memory(),
        }
    }

    /// Parse a JSON config document. Missing sections take their defaults.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| crate::error::RegistryError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> crate::error::Result<()> {
        self.settings.retry.validate()
    }
}

/// General settings for the registry logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistrySettings {
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub retry: RetryBackoffConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

/// Parse a humantime duration string, falling back to `default` when invalid.
fn parse_duration_or(value: &str, default: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(default)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconcileConfig: range reconciliation passes
// ═══════════════════════════════════════════════════════════════════════════════

/// Range reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Whether periodic reconciliation runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to run a reconciliation cycle (in seconds).
    #[serde(default = "default_reconcile_interval_sec")]
    pub interval_sec: u64,

    /// Width of each ID range processed in one pass.
    #[serde(default = "default_batch_width")]
    pub batch_width: u64,

    /// Maximum ranges per resource type per cycle.
    /// The next cycle resumes where this one stopped.
    #[serde(default = "default_max_ranges_per_cycle")]
    pub max_ranges_per_cycle: usize,

    /// Maximum ranges reconciled concurrently.
    #[serde(default = "default_max_concurrent_ranges")]
    pub max_concurrent_ranges: usize,

    /// Enable rate limiting of range passes (protects the primary database).
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Sustained range passes per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst of range passes allowed above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Base backoff in seconds when a resource type's cycle fails.
    /// Actual backoff = min(base * 2^consecutive_failures, max).
    #[serde(default = "default_backoff_base_sec")]
    pub backoff_base_sec: u64,

    /// Maximum backoff in seconds.
    #[serde(default = "default_backoff_max_sec")]
    pub backoff_max_sec: u64,
}

fn default_reconcile_interval_sec() -> u64 {
    60
}

fn default_batch_width() -> u64 {
    10_000
}

fn default_max_ranges_per_cycle() -> usize {
    100
}

fn default_max_concurrent_ranges() -> usize {
    4
}

fn default_rate_limit_per_sec() -> u32 {
    20
}

fn default_rate_limit_burst() -> u32 {
    5
}

fn default_backoff_base_sec() -> u64 {
    5
}

fn default_backoff_max_sec() -> u64 {
    300 // 5 minutes
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 60,
            batch_width: 10_000,
            max_ranges_per_cycle: 100,
            max_concurrent_ranges: 4,
            rate_limit_enabled: false,
            rate_limit_per_sec: 20,
            rate_limit_burst: 5,
            backoff_base_sec: 5,
            backoff_max_sec: 300,
        }
    }
}

impl ReconcileConfig {
    /// Get the interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    /// Calculate backoff duration for a given number of consecutive failures.
    pub fn backoff_for_failures(&self, consecutive_failures: u32) -> Duration {
        let backoff_secs = self
            .backoff_base_sec
            .saturating_mul(2u64.saturating_pow(consecutive_failures));
        Duration::from_secs(backoff_secs.min(self.backoff_max_sec))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReaperConfig: timeout sweeps
// ═══════════════════════════════════════════════════════════════════════════════

/// Timeout reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often to sweep (in seconds).
    #[serde(default = "default_reaper_interval_sec")]
    pub interval_sec: u64,

    /// Sync attempts started longer ago than this are failed (e.g. "8h").
    #[serde(default = "default_timeout")]
    pub sync_timeout: String,

    /// Verification attempts started longer ago than this are failed.
    #[serde(default = "default_timeout")]
    pub verification_timeout: String,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8 * 60 * 60);

fn default_reaper_interval_sec() -> u64 {
    60
}

fn default_timeout() -> String {
    "8h".to_string()
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 60,
            sync_timeout: "8h".to_string(),
            verification_timeout: "8h".to_string(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec)
    }

    /// Parsed sync timeout (8h if the string is invalid).
    pub fn sync_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.sync_timeout, DEFAULT_TIMEOUT)
    }

    /// Parsed verification timeout (8h if the string is invalid).
    pub fn verification_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.verification_timeout, DEFAULT_TIMEOUT)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetryBackoffConfig: retry_at scheduling
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff used to schedule `retry_at` after a failed sync or verification.
///
/// The engine only records when an entry becomes eligible again; it never
/// retries on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBackoffConfig {
    /// Delay after the first failure (seconds).
    #[serde(default = "default_retry_base_sec")]
    pub base_sec: u64,

    /// Ceiling for the delay (seconds).
    #[serde(default = "default_retry_max_sec")]
    pub max_sec: u64,
}

/// Exponent cap so `base * 2^n` stays in range (mirrored in the store's bulk SQL).
pub(crate) const RETRY_EXPONENT_CAP: u32 = 20;

/// Largest accepted `base_sec` or `max_sec`: one year.
///
/// Keeps `now + delay` representable and the bulk SQL's
/// `base_ms * 2^RETRY_EXPONENT_CAP` inside an SQLite INTEGER.
pub const MAX_RETRY_DELAY_SEC: u64 = 365 * 24 * 3600;

fn default_retry_base_sec() -> u64 {
    60
}

fn default_retry_max_sec() -> u64 {
    3600 // 1 hour
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            base_sec: 60,
            max_sec: 3600,
        }
    }
}

impl RetryBackoffConfig {
    /// Delay before an entry with `retry_count` failures is eligible again.
    ///
    /// `base * 2^(retry_count - 1)`, capped at `max_sec`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(RETRY_EXPONENT_CAP);
        let secs = self.effective_base_sec().saturating_mul(1u64 << exponent);
        Duration::from_secs(secs.min(self.effective_max_sec()))
    }

    /// `base_sec`, clamped to [`MAX_RETRY_DELAY_SEC`].
    pub fn effective_base_sec(&self) -> u64 {
        self.base_sec.min(MAX_RETRY_DELAY_SEC)
    }

    /// `max_sec`, clamped to [`MAX_RETRY_DELAY_SEC`].
    pub fn effective_max_sec(&self) -> u64 {
        self.max_sec.min(MAX_RETRY_DELAY_SEC)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        for (name, value) in [("base_sec", self.base_sec), ("max_sec", self.max_sec)] {
            if value > MAX_RETRY_DELAY_SEC {
                return Err(crate::error::RegistryError::Config(format!(
                    "retry.{} = {} exceeds the {}s limit",
                    name, value, MAX_RETRY_DELAY_SEC
                )));
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VerificationConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Checksum verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Succeeded entries verified longer ago than this go back to pending.
    #[serde(default = "default_reverify_after")]
    pub reverify_after: String,

    /// Entries claimed per verification batch.
    #[serde(default = "default_verification_batch_size")]
    pub batch_size: usize,

    /// Entries returned to pending per reverification batch.
    #[serde(default = "default_reverification_batch_size")]
    pub reverification_batch_size: usize,
}

const DEFAULT_REVERIFY_AFTER: Duration = Duration::from_secs(90 * 24 * 60 * 60);

fn default_reverify_after() -> String {
    "90days".to_string()
}

fn default_verification_batch_size() -> usize {
    10
}

fn default_reverification_batch_size() -> usize {
    1000
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reverify_after: "90days".to_string(),
            batch_size: 10,
            reverification_batch_size: 1000,
        }
    }
}

impl VerificationConfig {
    /// Parsed reverification interval (90 days if the string is invalid).
    pub fn reverify_after_duration(&self) -> Duration {
        parse_duration_or(&self.reverify_after, DEFAULT_REVERIFY_AFTER)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: registry persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Registry store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database holding the registry tables.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// Connection pool size. Forced to 1 for in-memory databases.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replica_registry.db".to_string(),
            wal_mode: true,
            max_connections: 4,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            max_connections: 1,
        }
    }

    /// Config for a database file at `path`.
    pub fn at_path(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
