// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry persistence in SQLite.
//!
//! One table per resource type (`{resource_type}_registry`), keyed by
//! `(site_id, resource_id)`. All tables live in one database file.
//!
//! # Compare-and-Set
//!
//! Every single-entry transition is load → apply → conditional write:
//!
//! ```text
//! SELECT ... WHERE site_id = ? AND resource_id = ?            (lock_version = n)
//! apply transition in memory (RegistryEntry::start_sync etc.)
//! UPDATE ... SET ..., lock_version = n + 1 WHERE ... AND lock_version = n
//!            0 rows → RaceLost
//! ```
//!
//! Two workers starting the same entry always yield one winner. The loser
//! either sees `lock_version` moved or loads the entry already `started`;
//! both surface as [`RegistryError::RaceLost`].
//!
//! # Bulk Operations
//!
//! Timeout sweeps, batch claims and reverification are single conditional
//! `UPDATE` statements so they stay cheap at scale. They bump `lock_version`
//! too, so an in-flight single-entry transition racing a sweep loses cleanly.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff per
//! [`BusyRetry::store()`]. Other errors are returned immediately.

use crate::config::{RetryBackoffConfig, StoreConfig, RETRY_EXPONENT_CAP};
use crate::entry::{RegistryEntry, VerificationFailure, VerificationLease, TIMEOUT_REASON};
use crate::error::{RegistryError, Result};
use crate::resilience::BusyRetry;
use crate::state::{SyncEvent, SyncState, VerificationEvent, VerificationState};
use crate::types::{Checksum, IdRange, ResourceId, ResourceType, SiteId};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite};
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

const COLUMNS: &str = "site_id, resource_id, \
     sync_state, sync_started_at, sync_retry_count, sync_retry_at, last_synced_at, last_sync_failure, \
     verification_state, verification_started_at, verification_checksum, verification_checksum_mismatched, \
     checksum_mismatch, verification_retry_count, verification_retry_at, verified_at, verification_failure, \
     verification_attempt, lock_version, created_at, updated_at";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    retry: &BusyRetry,
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < retry.attempts => {
                let delay = retry.delay_before(attempts);
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = retry.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Time helpers (timestamps are stored as epoch millis)
// ═══════════════════════════════════════════════════════════════════════════════

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| RegistryError::Internal(format!("timestamp out of range: {}", ms)))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

/// Current time at the store's millisecond precision.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    from_millis(now.timestamp_millis()).unwrap_or(now)
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn count_from_i64(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

// ═══════════════════════════════════════════════════════════════════════════════
// RegistryStore
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to the registry database. Hands out per-type [`RegistryTable`]s.
pub struct RegistryStore {
    pool: SqlitePool,
    path: String,
    wal_mode: bool,
    retry: BusyRetry,
    backoff: RetryBackoffConfig,
    /// Resource types whose table has been created in this process.
    created: Arc<Mutex<HashSet<ResourceType>>>,
}

impl RegistryStore {
    /// Open (creating if missing) the registry database.
    pub async fn open(config: &StoreConfig, backoff: RetryBackoffConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Opening registry store");

        let (options, pool_options) = if config.is_in_memory() {
            // Each in-memory connection is its own database: pin one connection forever.
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| RegistryError::Config(format!("Invalid SQLite path: {}", e)))?;
            let pool_options = SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool_options)
        } else {
            let journal = if config.wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            };
            let options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", config.sqlite_path))
                    .map_err(|e| RegistryError::Config(format!("Invalid SQLite path: {}", e)))?
                    .journal_mode(journal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(Duration::from_secs(5))
                    .create_if_missing(true);
            let pool_options = SqlitePoolOptions::new().max_connections(config.max_connections.max(1));
            (options, pool_options)
        };

        let pool = pool_options.connect_with(options).await?;

        Ok(Self {
            pool,
            path: config.sqlite_path.clone(),
            wal_mode: config.wal_mode && !config.is_in_memory(),
            retry: BusyRetry::store(),
            backoff,
            created: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Registry table for `resource_type`, created on first use.
    pub async fn table(&self, resource_type: &ResourceType) -> Result<RegistryTable> {
        let mut created = self.created.lock().await;
        let table = RegistryTable {
            pool: self.pool.clone(),
            resource_type: resource_type.clone(),
            name: resource_type.table_name(),
            retry: self.retry.clone(),
            backoff: self.backoff.clone(),
        };
        if !created.contains(resource_type) {
            table.create_schema().await?;
            created.insert(resource_type.clone());
            debug!(resource_type = %resource_type, table = %table.name, "Registry table ready");
        }
        Ok(table)
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        if !self.wal_mode {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry(&self.retry, "checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Registry store closed");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RegistryTable
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-state counts for one site's registry of one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStatus {
    pub total: u64,
    pub sync: Vec<(SyncState, u64)>,
    pub verification: Vec<(VerificationState, u64)>,
    pub checksum_mismatch: u64,
}

impl RegistryStatus {
    pub fn sync_count(&self, state: SyncState) -> u64 {
        self.sync
            .iter()
            .find(|(s, _)| *s == state)
            .map_or(0, |(_, n)| *n)
    }

    pub fn verification_count(&self, state: VerificationState) -> u64 {
        self.verification
            .iter()
            .find(|(s, _)| *s == state)
            .map_or(0, |(_, n)| *n)
    }
}

/// Read/write handle for one resource type's registry table.
///
/// Cheap to clone (wraps the shared pool).
#[derive(Clone)]
pub struct RegistryTable {
    pool: SqlitePool,
    resource_type: ResourceType,
    name: String,
    retry: BusyRetry,
    backoff: RetryBackoffConfig,
}

impl std::fmt::Debug for RegistryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryTable")
            .field("resource_type", &self.resource_type)
            .field("name", &self.name)
            .finish()
    }
}

impl RegistryTable {
    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    /// Backoff used to schedule `retry_at` after failures.
    pub fn backoff(&self) -> &RetryBackoffConfig {
        &self.backoff
    }

    async fn create_schema(&self) -> Result<()> {
        let t = &self.name;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t} (
                    site_id TEXT NOT NULL,
                    resource_id INTEGER NOT NULL,
                    sync_state INTEGER NOT NULL DEFAULT 0,
                    sync_started_at INTEGER,
                    sync_retry_count INTEGER NOT NULL DEFAULT 0,
                    sync_retry_at INTEGER,
                    last_synced_at INTEGER,
                    last_sync_failure TEXT,
                    verification_state INTEGER NOT NULL DEFAULT 0,
                    verification_started_at INTEGER,
                    verification_checksum TEXT,
                    verification_checksum_mismatched TEXT,
                    checksum_mismatch INTEGER NOT NULL DEFAULT 0,
                    verification_retry_count INTEGER NOT NULL DEFAULT 0,
                    verification_retry_at INTEGER,
                    verified_at INTEGER,
                    verification_failure TEXT,
                    verification_attempt INTEGER NOT NULL DEFAULT 0,
                    lock_version INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (site_id, resource_id),
                    CHECK ((verification_state = 2) = (verification_checksum IS NOT NULL)),
                    CHECK (verification_state = 0 OR sync_state = 2)
                )
                "#
            ),
            format!("CREATE INDEX IF NOT EXISTS idx_{t}_sync ON {t} (sync_state, sync_started_at)"),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{t}_verification ON {t} (verification_state, verification_started_at)"
            ),
        ];
        for sql in &statements {
            let pool = &self.pool;
            execute_with_retry(&self.retry, "create_schema", || async {
                sqlx::query(sql).execute(pool).await
            })
            .await?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn get(&self, site: &SiteId, resource_id: ResourceId) -> Result<Option<RegistryEntry>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE site_id = ? AND resource_id = ?",
            self.name
        );
        let pool = &self.pool;
        let row = execute_with_retry(&self.retry, "get", || async {
            sqlx::query(&sql)
                .bind(site.as_str())
                .bind(resource_id)
                .fetch_optional(pool)
                .await
        })
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Like [`get`](Self::get) but a missing entry is [`RegistryError::NotFound`].
    pub async fn fetch(&self, site: &SiteId, resource_id: ResourceId) -> Result<RegistryEntry> {
        self.get(site, resource_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound {
                resource_type: self.resource_type.clone(),
                resource_id,
            })
    }

    /// IDs in `range` with an entry for `site`. One ranged index scan.
    pub async fn tracked_ids_in_range(
        &self,
        site: &SiteId,
        range: IdRange,
    ) -> Result<BTreeSet<ResourceId>> {
        if range.is_empty() {
            return Ok(BTreeSet::new());
        }
        let sql = format!(
            "SELECT resource_id FROM {} WHERE site_id = ? AND resource_id >= ? AND resource_id < ?",
            self.name
        );
        let pool = &self.pool;
        let ids: Vec<i64> = execute_with_retry(&self.retry, "tracked_ids_in_range", || async {
            sqlx::query_scalar(&sql)
                .bind(site.as_str())
                .bind(range.low())
                .bind(range.high())
                .fetch_all(pool)
                .await
        })
        .await?;
        Ok(ids.into_iter().collect())
    }

    /// Smallest and largest tracked ID for `site`, if any.
    pub async fn id_bounds(&self, site: &SiteId) -> Result<Option<(ResourceId, ResourceId)>> {
        let sql = format!(
            "SELECT MIN(resource_id), MAX(resource_id) FROM {} WHERE site_id = ?",
            self.name
        );
        let pool = &self.pool;
        let (min, max): (Option<i64>, Option<i64>) =
            execute_with_retry(&self.retry, "id_bounds", || async {
                sqlx::query_as(&sql).bind(site.as_str()).fetch_one(pool).await
            })
            .await?;
        Ok(min.zip(max))
    }

    /// Counts per sync and verification state for `site`.
    pub async fn status(&self, site: &SiteId) -> Result<RegistryStatus> {
        let sync_sql = format!(
            "SELECT sync_state, COUNT(*) FROM {} WHERE site_id = ? GROUP BY sync_state",
            self.name
        );
        let verification_sql = format!(
            "SELECT verification_state, COUNT(*) FROM {} WHERE site_id = ? GROUP BY verification_state",
            self.name
        );
        let mismatch_sql = format!(
            "SELECT COUNT(*) FROM {} WHERE site_id = ? AND checksum_mismatch = 1",
            self.name
        );
        let pool = &self.pool;

        let sync_rows: Vec<(i64, i64)> = execute_with_retry(&self.retry, "status", || async {
            sqlx::query_as(&sync_sql).bind(site.as_str()).fetch_all(pool).await
        })
        .await?;
        let verification_rows: Vec<(i64, i64)> = execute_with_retry(&self.retry, "status", || async {
            sqlx::query_as(&verification_sql)
                .bind(site.as_str())
                .fetch_all(pool)
                .await
        })
        .await?;
        let mismatched: i64 = execute_with_retry(&self.retry, "status", || async {
            sqlx::query_scalar(&mismatch_sql)
                .bind(site.as_str())
                .fetch_one(pool)
                .await
        })
        .await?;

        let count_of = |rows: &[(i64, i64)], code: i64| {
            rows.iter()
                .find(|(s, _)| *s == code)
                .map_or(0, |(_, n)| (*n).max(0) as u64)
        };
        let sync: Vec<(SyncState, u64)> = SyncState::ALL
            .iter()
            .map(|s| (*s, count_of(&sync_rows, s.as_i64())))
            .collect();
        let verification = VerificationState::ALL
            .iter()
            .map(|s| (*s, count_of(&verification_rows, s.as_i64())))
            .collect();

        Ok(RegistryStatus {
            total: sync.iter().map(|(_, n)| n).sum(),
            sync,
            verification,
            checksum_mismatch: mismatched.max(0) as u64,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Create / delete
    // ═══════════════════════════════════════════════════════════════════════════

    /// Create a pending entry, or return the existing one unchanged.
    #[instrument(skip(self), fields(resource_type = %self.resource_type))]
    pub async fn create_pending(&self, site: &SiteId, resource_id: ResourceId) -> Result<RegistryEntry> {
        let sql = format!(
            "INSERT INTO {} (site_id, resource_id, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(site_id, resource_id) DO NOTHING",
            self.name
        );
        let now = to_millis(now_millis());
        let pool = &self.pool;
        let result = execute_with_retry(&self.retry, "create_pending", || async {
            sqlx::query(&sql)
                .bind(site.as_str())
                .bind(resource_id)
                .bind(now)
                .bind(now)
                .execute(pool)
                .await
        })
        .await?;
        if result.rows_affected() > 0 {
            debug!(resource_id, "Created pending registry entry");
        }
        self.fetch(site, resource_id).await
    }

    /// Create pending entries for all of `ids` in one transaction.
    /// Returns how many were newly created.
    pub async fn create_pending_many(&self, site: &SiteId, ids: &BTreeSet<ResourceId>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO {} (site_id, resource_id, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(site_id, resource_id) DO NOTHING",
            self.name
        );
        let now = to_millis(now_millis());
        let pool = &self.pool;
        let inserted = execute_with_retry(&self.retry, "create_pending_many", || async {
            let mut tx = pool.begin().await?;
            let mut inserted = 0;
            for id in ids {
                let result = sqlx::query(&sql)
                    .bind(site.as_str())
                    .bind(*id)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                inserted += result.rows_affected();
            }
            tx.commit().await?;
            Ok(inserted)
        })
        .await?;
        Ok(inserted)
    }

    /// Delete one entry. Deleting a missing entry is not an error.
    pub async fn delete(&self, site: &SiteId, resource_id: ResourceId) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE site_id = ? AND resource_id = ?",
            self.name
        );
        let pool = &self.pool;
        let result = execute_with_retry(&self.retry, "delete", || async {
            sqlx::query(&sql)
                .bind(site.as_str())
                .bind(resource_id)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete all of `ids` in one transaction. Returns how many existed.
    pub async fn delete_many(&self, site: &SiteId, ids: &BTreeSet<ResourceId>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE site_id = ? AND resource_id = ?",
            self.name
        );
        let pool = &self.pool;
        let deleted = execute_with_retry(&self.retry, "delete_many", || async {
            let mut tx = pool.begin().await?;
            let mut deleted = 0;
            for id in ids {
                let result = sqlx::query(&sql)
                    .bind(site.as_str())
                    .bind(*id)
                    .execute(&mut *tx)
                    .await?;
                deleted += result.rows_affected();
            }
            tx.commit().await?;
            Ok(deleted)
        })
        .await?;
        Ok(deleted)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Single-entry transitions (compare-and-set)
    // ═══════════════════════════════════════════════════════════════════════════

    /// Claim the entry for syncing. A concurrent claim yields `RaceLost`.
    pub async fn start_sync(&self, site: &SiteId, resource_id: ResourceId) -> Result<RegistryEntry> {
        self.transition(site, resource_id, "sync", SyncEvent::Start.as_str(), |e, now, _| {
            if e.sync_state == SyncState::Started {
                return Err(RegistryError::RaceLost { resource_id });
            }
            e.start_sync(now)
        })
        .await
    }

    pub async fn succeed_sync(&self, site: &SiteId, resource_id: ResourceId) -> Result<RegistryEntry> {
        self.transition(site, resource_id, "sync", SyncEvent::Succeed.as_str(), |e, now, _| {
            e.succeed_sync(now)
        })
        .await
    }

    pub async fn fail_sync(
        &self,
        site: &SiteId,
        resource_id: ResourceId,
        reason: &str,
    ) -> Result<RegistryEntry> {
        self.transition(site, resource_id, "sync", SyncEvent::Fail.as_str(), |e, now, backoff| {
            e.fail_sync(reason, now, backoff)
        })
        .await
    }

    pub async fn reset_sync(&self, site: &SiteId, resource_id: ResourceId) -> Result<RegistryEntry> {
        self.transition(site, resource_id, "sync", SyncEvent::Reset.as_str(), |e, now, _| {
            e.reset_sync(now)
        })
        .await
    }

    /// Claim the entry for verification. Requires `sync_state = synced`.
    pub async fn start_verification(
        &self,
        site: &SiteId,
        resource_id: ResourceId,
    ) -> Result<RegistryEntry> {
        self.transition(
            site,
            resource_id,
            "verification",
            VerificationEvent::Start.as_str(),
            |e, now, _| {
                if e.verification_state == VerificationState::Started {
                    return Err(RegistryError::RaceLost { resource_id });
                }
                e.start_verification(now)
            },
        )
        .await
    }

    /// Record a matching checksum for verification attempt `attempt`.
    ///
    /// A result for an attempt that has since been timed out and restarted
    /// yields `RaceLost` and leaves the newer attempt in flight.
    pub async fn succeed_verification(
        &self,
        site: &SiteId,
        resource_id: ResourceId,
        attempt: i64,
        checksum: Checksum,
    ) -> Result<RegistryEntry> {
        self.transition(
            site,
            resource_id,
            "verification",
            VerificationEvent::Succeed.as_str(),
            |e, now, _| {
                e.check_verification_attempt(attempt)?;
                e.succeed_verification(checksum, now)
            },
        )
        .await
    }

    /// Record a failed verification attempt. Fenced like
    /// [`succeed_verification`](Self::succeed_verification).
    pub async fn fail_verification(
        &self,
        site: &SiteId,
        resource_id: ResourceId,
        attempt: i64,
        failure: &VerificationFailure,
    ) -> Result<RegistryEntry> {
        self.transition(
            site,
            resource_id,
            "verification",
            VerificationEvent::Fail.as_str(),
            |e, now, backoff| {
                e.check_verification_attempt(attempt)?;
                e.fail_verification(failure, now, backoff)
            },
        )
        .await
    }

    pub async fn reset_verification(
        &self,
        site: &SiteId,
        resource_id: ResourceId,
    ) -> Result<RegistryEntry> {
        self.transition(
            site,
            resource_id,
            "verification",
            VerificationEvent::Reset.as_str(),
            |e, now, _| e.reset_verification(now),
        )
        .await
    }

    async fn transition<F>(
        &self,
        site: &SiteId,
        resource_id: ResourceId,
        machine: &'static str,
        event: &'static str,
        apply: F,
    ) -> Result<RegistryEntry>
    where
        F: FnOnce(&mut RegistryEntry, DateTime<Utc>, &RetryBackoffConfig) -> Result<()>,
    {
        let result = self.try_transition(site, resource_id, apply).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        crate::metrics::record_transition(self.resource_type.as_str(), machine, event, outcome);
        match &result {
            Err(e) if e.is_expected() => {
                debug!(resource_type = %self.resource_type, resource_id, machine, event, "Transition lost race");
            }
            Err(e) => {
                debug!(resource_type = %self.resource_type, resource_id, machine, event, error = %e, "Transition rejected");
            }
            Ok(_) => {}
        }
        result
    }

    async fn try_transition<F>(
        &self,
        site: &SiteId,
        resource_id: ResourceId,
        apply: F,
    ) -> Result<RegistryEntry>
    where
        F: FnOnce(&mut RegistryEntry, DateTime<Utc>, &RetryBackoffConfig) -> Result<()>,
    {
        let current = self.fetch(site, resource_id).await?;
        let mut next = current.clone();
        apply(&mut next, now_millis(), &self.backoff)?;
        next.lock_version = current.lock_version + 1;

        if self.write_entry(&next, current.lock_version).await? == 0 {
            return Err(RegistryError::RaceLost { resource_id });
        }
        Ok(next)
    }

    /// Conditional write of every mutable column. Returns rows affected (0 or 1).
    async fn write_entry(&self, entry: &RegistryEntry, expected_version: i64) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET \
             sync_state = ?, sync_started_at = ?, sync_retry_count = ?, sync_retry_at = ?, \
             last_synced_at = ?, last_sync_failure = ?, \
             verification_state = ?, verification_started_at = ?, verification_checksum = ?, \
             verification_checksum_mismatched = ?, checksum_mismatch = ?, verification_retry_count = ?, \
             verification_retry_at = ?, verified_at = ?, verification_failure = ?, \
             verification_attempt = ?, lock_version = ?, updated_at = ? \
             WHERE site_id = ? AND resource_id = ? AND lock_version = ?",
            self.name
        );
        let pool = &self.pool;
        let result = execute_with_retry(&self.retry, "write_entry", || async {
            bind_entry(sqlx::query(&sql), entry)
                .bind(entry.site_id.as_str())
                .bind(entry.resource_id)
                .bind(expected_version)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Bulk operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Fail every sync started before `now - timeout` with reason `timeout`.
    ///
    /// One conditional UPDATE across all sites. Returns entries failed.
    #[instrument(skip(self), fields(resource_type = %self.resource_type))]
    pub async fn fail_sync_timeouts(&self, now: DateTime<Utc>, timeout: Duration) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET \
             sync_state = ?, \
             sync_retry_count = sync_retry_count + 1, \
             sync_retry_at = ? + MIN(?, ? * (1 << MIN(sync_retry_count, {cap}))), \
             last_sync_failure = ?, \
             lock_version = lock_version + 1, \
             updated_at = ? \
             WHERE sync_state = ? AND sync_started_at < ?",
            self.name,
            cap = RETRY_EXPONENT_CAP
        );
        let rows = self
            .sweep(
                &sql,
                "fail_sync_timeouts",
                now,
                timeout,
                SyncState::Failed.as_i64(),
                SyncState::Started.as_i64(),
            )
            .await?;
        if rows > 0 {
            info!(rows, "Failed timed-out syncs");
        }
        Ok(rows)
    }

    /// Fail every verification started before `now - timeout` with reason `timeout`.
    #[instrument(skip(self), fields(resource_type = %self.resource_type))]
    pub async fn fail_verification_timeouts(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<u64> {
        let sql = format!(
            "UPDATE {} SET \
             verification_state = ?, \
             verification_retry_count = verification_retry_count + 1, \
             verification_retry_at = ? + MIN(?, ? * (1 << MIN(verification_retry_count, {cap}))), \
             verification_failure = ?, \
             verification_checksum = NULL, \
             verification_checksum_mismatched = NULL, \
             checksum_mismatch = 0, \
             lock_version = lock_version + 1, \
             updated_at = ? \
             WHERE verification_state = ? AND verification_started_at < ?",
            self.name,
            cap = RETRY_EXPONENT_CAP
        );
        let rows = self
            .sweep(
                &sql,
                "fail_verification_timeouts",
                now,
                timeout,
                VerificationState::Failed.as_i64(),
                VerificationState::Started.as_i64(),
            )
            .await?;
        if rows > 0 {
            info!(rows, "Failed timed-out verifications");
        }
        Ok(rows)
    }

    async fn sweep(
        &self,
        sql: &str,
        operation: &str,
        now: DateTime<Utc>,
        timeout: Duration,
        failed: i64,
        started: i64,
    ) -> Result<u64> {
        let now_ms = to_millis(now);
        let cutoff = now_ms.saturating_sub(duration_millis(timeout));
        // Clamped so base_ms << RETRY_EXPONENT_CAP stays an INTEGER in SQLite
        let base_ms = i64::try_from(self.backoff.effective_base_sec() * 1000).unwrap_or(i64::MAX);
        let max_ms = i64::try_from(self.backoff.effective_max_sec() * 1000).unwrap_or(i64::MAX);
        let pool = &self.pool;
        let result = execute_with_retry(&self.retry, operation, || async {
            sqlx::query(sql)
                .bind(failed)
                .bind(now_ms)
                .bind(max_ms)
                .bind(base_ms)
                .bind(TIMEOUT_REASON)
                .bind(now_ms)
                .bind(started)
                .bind(cutoff)
                .execute(pool)
                .await
        })
        .await?;
        Ok(result.rows_affected())
    }

    /// Move up to `limit` syncable entries to `started` and return their IDs.
    ///
    /// Syncable: `pending`, or `failed` with `sync_retry_at` due. Pending first.
    pub async fn claim_sync_batch(
        &self,
        site: &SiteId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResourceId>> {
        let t = &self.name;
        let sql = format!(
            "UPDATE {t} SET sync_state = 1, sync_started_at = ?1, \
             lock_version = lock_version + 1, updated_at = ?1 \
             WHERE site_id = ?2 AND resource_id IN ( \
                 SELECT resource_id FROM {t} WHERE site_id = ?2 \
                 AND (sync_state = 0 OR (sync_state = 3 AND (sync_retry_at IS NULL OR sync_retry_at <= ?1))) \
                 ORDER BY sync_state, resource_id LIMIT ?3) \
             RETURNING resource_id"
        );
        let ids = self.claim(&sql, "claim_sync_batch", site, limit, now).await?;
        crate::metrics::record_batch_claimed(self.resource_type.as_str(), "sync", ids.len());
        Ok(ids)
    }

    /// Move up to `limit` verifiable entries to `started` and return a lease
    /// per entry, ordered by resource ID.
    ///
    /// Verifiable: synced, and verification `pending` or `failed` with retry due.
    pub async fn claim_verification_batch(
        &self,
        site: &SiteId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<VerificationLease>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let t = &self.name;
        let sql = format!(
            "UPDATE {t} SET verification_state = 1, verification_started_at = ?1, \
             verification_attempt = verification_attempt + 1, \
             lock_version = lock_version + 1, updated_at = ?1 \
             WHERE site_id = ?2 AND resource_id IN ( \
                 SELECT resource_id FROM {t} WHERE site_id = ?2 AND sync_state = 2 \
                 AND (verification_state = 0 OR (verification_state = 3 \
                      AND (verification_retry_at IS NULL OR verification_retry_at <= ?1))) \
                 ORDER BY verification_state, resource_id LIMIT ?3) \
             RETURNING resource_id, verification_attempt"
        );
        let now_ms = to_millis(now);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let pool = &self.pool;
        let rows: Vec<(i64, i64)> =
            execute_with_retry(&self.retry, "claim_verification_batch", || async {
                sqlx::query_as(&sql)
                    .bind(now_ms)
                    .bind(site.as_str())
                    .bind(limit)
                    .fetch_all(pool)
                    .await
            })
            .await?;
        let mut leases: Vec<VerificationLease> = rows
            .into_iter()
            .map(|(resource_id, attempt)| VerificationLease {
                resource_id,
                attempt,
            })
            .collect();
        leases.sort_unstable();
        crate::metrics::record_batch_claimed(self.resource_type.as_str(), "verification", leases.len());
        Ok(leases)
    }

    async fn claim(
        &self,
        sql: &str,
        operation: &str,
        site: &SiteId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResourceId>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_ms = to_millis(now);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let pool = &self.pool;
        let mut ids: Vec<i64> = execute_with_retry(&self.retry, operation, || async {
            sqlx::query_scalar(sql)
                .bind(now_ms)
                .bind(site.as_str())
                .bind(limit)
                .fetch_all(pool)
                .await
        })
        .await?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Return up to `limit` entries verified before `older_than` to `pending`.
    pub async fn reverify_batch(
        &self,
        site: &SiteId,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64> {
        if limit == 0 {
            return Ok(0);
        }
        let t = &self.name;
        let sql = format!(
            "UPDATE {t} SET verification_state = 0, verification_checksum = NULL, \
             verification_started_at = NULL, verification_retry_at = NULL, \
             lock_version = lock_version + 1, updated_at = ?1 \
             WHERE site_id = ?2 AND verification_state = 2 AND resource_id IN ( \
                 SELECT resource_id FROM {t} WHERE site_id = ?2 AND verification_state = 2 \
                 AND verified_at < ?3 ORDER BY verified_at LIMIT ?4)"
        );
        let now_ms = to_millis(now_millis());
        let cutoff = to_millis(older_than);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let pool = &self.pool;
        let result = execute_with_retry(&self.retry, "reverify_batch", || async {
            sqlx::query(&sql)
                .bind(now_ms)
                .bind(site.as_str())
                .bind(cutoff)
                .bind(limit)
                .execute(pool)
                .await
        })
        .await?;
        let rows = result.rows_affected();
        if rows > 0 {
            crate::metrics::record_reverified(self.resource_type.as_str(), rows);
            debug!(resource_type = %self.resource_type, rows, "Queued entries for reverification");
        }
        Ok(rows)
    }
}

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_entry<'q>(query: SqliteQuery<'q>, e: &'q RegistryEntry) -> SqliteQuery<'q> {
    query
        .bind(e.sync_state.as_i64())
        .bind(e.sync_started_at.map(to_millis))
        .bind(i64::from(e.sync_retry_count))
        .bind(e.sync_retry_at.map(to_millis))
        .bind(e.last_synced_at.map(to_millis))
        .bind(e.last_sync_failure.as_deref())
        .bind(e.verification_state.as_i64())
        .bind(e.verification_started_at.map(to_millis))
        .bind(e.verification_checksum.as_ref().map(Checksum::as_str))
        .bind(e.verification_checksum_mismatched.as_ref().map(Checksum::as_str))
        .bind(e.checksum_mismatch)
        .bind(i64::from(e.verification_retry_count))
        .bind(e.verification_retry_at.map(to_millis))
        .bind(e.verified_at.map(to_millis))
        .bind(e.verification_failure.as_deref())
        .bind(e.verification_attempt)
        .bind(e.lock_version)
        .bind(to_millis(e.updated_at))
}

fn entry_from_row(row: &SqliteRow) -> Result<RegistryEntry> {
    let sync_code: i64 = row.try_get("sync_state")?;
    let verification_code: i64 = row.try_get("verification_state")?;
    let sync_state = SyncState::from_i64(sync_code)
        .ok_or_else(|| RegistryError::Internal(format!("unknown sync_state {}", sync_code)))?;
    let verification_state = VerificationState::from_i64(verification_code).ok_or_else(|| {
        RegistryError::Internal(format!("unknown verification_state {}", verification_code))
    })?;

    let checksum = |col: &str| -> Result<Option<Checksum>> {
        let value: Option<String> = row.try_get(col)?;
        value
            .map(|hex| {
                Checksum::from_hex(&hex)
                    .map_err(|e| RegistryError::Internal(format!("{}: {}", col, e)))
            })
            .transpose()
    };

    Ok(RegistryEntry {
        site_id: SiteId::new(row.try_get::<String, _>("site_id")?),
        resource_id: row.try_get("resource_id")?,
        sync_state,
        sync_started_at: opt_from_millis(row.try_get("sync_started_at")?)?,
        sync_retry_count: count_from_i64(row.try_get("sync_retry_count")?),
        sync_retry_at: opt_from_millis(row.try_get("sync_retry_at")?)?,
        last_synced_at: opt_from_millis(row.try_get("last_synced_at")?)?,
        last_sync_failure: row.try_get("last_sync_failure")?,
        verification_state,
        verification_started_at: opt_from_millis(row.try_get("verification_started_at")?)?,
        verification_checksum: checksum("verification_checksum")?,
        verification_checksum_mismatched: checksum("verification_checksum_mismatched")?,
        checksum_mismatch: row.try_get("checksum_mismatch")?,
        verification_retry_count: count_from_i64(row.try_get("verification_retry_count")?),
        verification_retry_at: opt_from_millis(row.try_get("verification_retry_at")?)?,
        verified_at: opt_from_millis(row.try_get("verified_at")?)?,
        verification_failure: row.try_get("verification_failure")?,
        verification_attempt: row.try_get("verification_attempt")?,
        lock_version: row.try_get("lock_version")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn site() -> SiteId {
        SiteId::new("secondary-1")
    }

    fn lfs() -> ResourceType {
        ResourceType::new("lfs_object").unwrap()
    }

    async fn memory_table() -> (RegistryStore, RegistryTable) {
        let store = RegistryStore::open(&StoreConfig::in_memory(), RetryBackoffConfig::default())
            .await
            .unwrap();
        let table = store.table(&lfs()).await.unwrap();
        (store, table)
    }

    async fn synced(table: &RegistryTable, id: ResourceId) {
        table.create_pending(&site(), id).await.unwrap();
        table.start_sync(&site(), id).await.unwrap();
        table.succeed_sync(&site(), id).await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry(&BusyRetry::testing(), "test_op", || {
                attempt_count += 1;
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> =
            execute_with_retry(&BusyRetry::testing(), "test_op", || {
                attempt_count += 1;
                async { Err(sqlx::Error::RowNotFound) }
            })
            .await;

        assert!(result.is_err());
        // Non-busy errors should not retry
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_create_pending_is_idempotent() {
        let (_store, table) = memory_table().await;
        let first = table.create_pending(&site(), 7).await.unwrap();
        assert_eq!(first.sync_state, SyncState::Pending);

        table.start_sync(&site(), 7).await.unwrap();
        let again = table.create_pending(&site(), 7).await.unwrap();
        // Existing entry returned untouched
        assert_eq!(again.sync_state, SyncState::Started);
        assert_eq!(table.status(&site()).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_entries_are_per_site() {
        let (_store, table) = memory_table().await;
        let other = SiteId::new("secondary-2");
        table.create_pending(&site(), 1).await.unwrap();
        table.create_pending(&other, 1).await.unwrap();
        table.start_sync(&site(), 1).await.unwrap();

        let mine = table.fetch(&site(), 1).await.unwrap();
        let theirs = table.fetch(&other, 1).await.unwrap();
        assert_eq!(mine.sync_state, SyncState::Started);
        assert_eq!(theirs.sync_state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_transition_roundtrips_through_store() {
        let (_store, table) = memory_table().await;
        synced(&table, 5).await;
        let checksum = Checksum::compute(b"payload");
        let started = table.start_verification(&site(), 5).await.unwrap();
        assert_eq!(started.verification_attempt, 1);
        let returned = table
            .succeed_verification(&site(), 5, started.verification_attempt, checksum.clone())
            .await
            .unwrap();

        let stored = table.fetch(&site(), 5).await.unwrap();
        assert_eq!(stored, returned);
        assert_eq!(stored.verification_checksum, Some(checksum));
        assert_eq!(stored.lock_version, 4);
        assert!(stored.satisfies_invariants());
    }

    #[tokio::test]
    async fn test_missing_entry_is_not_found() {
        let (_store, table) = memory_table().await;
        let err = table.start_sync(&site(), 99).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { resource_id: 99, .. }));
    }

    #[tokio::test]
    async fn test_start_on_started_is_race_lost() {
        let (_store, table) = memory_table().await;
        table.create_pending(&site(), 1).await.unwrap();
        table.start_sync(&site(), 1).await.unwrap();
        let err = table.start_sync(&site(), 1).await.unwrap_err();
        assert!(err.is_expected());
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_entry_unchanged() {
        let (_store, table) = memory_table().await;
        let before = table.create_pending(&site(), 1).await.unwrap();
        let err = table.succeed_sync(&site(), 1).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
        assert_eq!(table.fetch(&site(), 1).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_verification_precondition_through_store() {
        let (_store, table) = memory_table().await;
        table.create_pending(&site(), 1).await.unwrap();
        let err = table.start_verification(&site(), 1).await.unwrap_err();
        assert!(matches!(err, RegistryError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_stale_version_write_is_race_lost() {
        let (_store, table) = memory_table().await;
        let entry = table.create_pending(&site(), 1).await.unwrap();
        table.start_sync(&site(), 1).await.unwrap();

        let mut stale = entry.clone();
        stale.start_sync(now_millis()).unwrap();
        stale.lock_version = entry.lock_version + 1;
        assert_eq!(table.write_entry(&stale, entry.lock_version).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tracked_ids_in_range_is_half_open() {
        let (_store, table) = memory_table().await;
        let ids: BTreeSet<_> = [99, 100, 105, 109, 110].into_iter().collect();
        assert_eq!(table.create_pending_many(&site(), &ids).await.unwrap(), 5);
        assert_eq!(table.create_pending_many(&site(), &ids).await.unwrap(), 0);

        let tracked = table
            .tracked_ids_in_range(&site(), IdRange::new(100, 110).unwrap())
            .await
            .unwrap();
        assert_eq!(tracked, [100, 105, 109].into_iter().collect());
        assert_eq!(table.id_bounds(&site()).await.unwrap(), Some((99, 110)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_store, table) = memory_table().await;
        table.create_pending(&site(), 3).await.unwrap();
        assert!(table.delete(&site(), 3).await.unwrap());
        assert!(!table.delete(&site(), 3).await.unwrap());

        let ids: BTreeSet<_> = [3, 4].into_iter().collect();
        table.create_pending(&site(), 4).await.unwrap();
        assert_eq!(table.delete_many(&site(), &ids).await.unwrap(), 1);
        assert_eq!(table.delete_many(&site(), &ids).await.unwrap(), 0);
        assert_eq!(table.id_bounds(&site()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sync_timeout_sweep() {
        let (_store, table) = memory_table().await;
        for id in [1, 2, 3] {
            table.create_pending(&site(), id).await.unwrap();
        }
        table.start_sync(&site(), 1).await.unwrap();
        table.start_sync(&site(), 2).await.unwrap();
        table.succeed_sync(&site(), 2).await.unwrap();

        let eight_hours = Duration::from_secs(8 * 3600);
        // Not yet past the deadline
        assert_eq!(table.fail_sync_timeouts(now_millis(), eight_hours).await.unwrap(), 0);

        let later = now_millis() + chrono::Duration::hours(10);
        assert_eq!(table.fail_sync_timeouts(later, eight_hours).await.unwrap(), 1);

        let reaped = table.fetch(&site(), 1).await.unwrap();
        assert_eq!(reaped.sync_state, SyncState::Failed);
        assert_eq!(reaped.last_sync_failure.as_deref(), Some(TIMEOUT_REASON));
        assert_eq!(reaped.sync_retry_count, 1);
        assert_eq!(reaped.sync_retry_at, Some(later + chrono::Duration::seconds(60)));
        assert_eq!(table.fetch(&site(), 2).await.unwrap().sync_state, SyncState::Synced);
        assert_eq!(table.fetch(&site(), 3).await.unwrap().sync_state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_verification_timeout_sweep() {
        let (_store, table) = memory_table().await;
        synced(&table, 1).await;
        table.start_verification(&site(), 1).await.unwrap();

        let later = now_millis() + chrono::Duration::hours(9);
        let rows = table
            .fail_verification_timeouts(later, Duration::from_secs(8 * 3600))
            .await
            .unwrap();
        assert_eq!(rows, 1);
        let entry = table.fetch(&site(), 1).await.unwrap();
        assert_eq!(entry.verification_state, VerificationState::Failed);
        assert_eq!(entry.verification_failure.as_deref(), Some(TIMEOUT_REASON));
        assert!(entry.satisfies_invariants());
    }

    #[tokio::test]
    async fn test_claim_sync_batch_respects_retry_at() {
        let (_store, table) = memory_table().await;
        for id in 1..=4 {
            table.create_pending(&site(), id).await.unwrap();
        }
        table.start_sync(&site(), 4).await.unwrap();
        table.fail_sync(&site(), 4, "boom").await.unwrap();

        let now = now_millis();
        let claimed = table.claim_sync_batch(&site(), 2, now).await.unwrap();
        assert_eq!(claimed, vec![1, 2]);
        let claimed = table.claim_sync_batch(&site(), 10, now).await.unwrap();
        // 4 is failed but its retry is not due yet
        assert_eq!(claimed, vec![3]);

        let later = now + chrono::Duration::minutes(5);
        assert_eq!(table.claim_sync_batch(&site(), 10, later).await.unwrap(), vec![4]);
        assert_eq!(table.fetch(&site(), 4).await.unwrap().sync_state, SyncState::Started);
    }

    #[tokio::test]
    async fn test_claim_verification_batch_only_synced() {
        let (_store, table) = memory_table().await;
        table.create_pending(&site(), 1).await.unwrap();
        synced(&table, 2).await;
        let claimed = table
            .claim_verification_batch(&site(), 10, now_millis())
            .await
            .unwrap();
        assert_eq!(
            claimed,
            vec![VerificationLease {
                resource_id: 2,
                attempt: 1
            }]
        );
        let entry = table.fetch(&site(), 2).await.unwrap();
        assert_eq!(entry.verification_state, VerificationState::Started);
        assert_eq!(entry.verification_lease(), claimed[0]);
        assert!(entry.satisfies_invariants());
    }

    #[tokio::test]
    async fn test_stale_attempt_cannot_complete_restarted_verification() {
        let (_store, table) = memory_table().await;
        synced(&table, 3).await;
        let first = table
            .start_verification(&site(), 3)
            .await
            .unwrap()
            .verification_lease();

        // The reaper times the first attempt out and a batch claim restarts it
        let later = now_millis() + chrono::Duration::hours(1);
        table
            .fail_verification_timeouts(later, Duration::from_secs(60))
            .await
            .unwrap();
        let claimed = table.claim_verification_batch(&site(), 10, later).await;
        // Retry is not due yet at `later`; claim past the backoff instead
        assert!(claimed.unwrap().is_empty());
        let second = table
            .claim_verification_batch(&site(), 10, later + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempt, first.attempt + 1);

        let stale = table
            .succeed_verification(&site(), 3, first.attempt, Checksum::compute(b"old"))
            .await;
        assert!(matches!(stale, Err(RegistryError::RaceLost { resource_id: 3 })));
        let stale_failure = table
            .fail_verification(&site(), 3, first.attempt, &VerificationFailure::Timeout)
            .await;
        assert!(matches!(stale_failure, Err(RegistryError::RaceLost { .. })));

        let entry = table.fetch(&site(), 3).await.unwrap();
        assert_eq!(entry.verification_state, VerificationState::Started);
        assert_eq!(entry.verification_checksum, None);

        let done = table
            .succeed_verification(&site(), 3, second[0].attempt, Checksum::compute(b"new"))
            .await
            .unwrap();
        assert_eq!(done.verification_state, VerificationState::Succeeded);
    }

    #[tokio::test]
    async fn test_reverify_batch() {
        let (_store, table) = memory_table().await;
        synced(&table, 1).await;
        let started = table.start_verification(&site(), 1).await.unwrap();
        table
            .succeed_verification(&site(), 1, started.verification_attempt, Checksum::compute(b"x"))
            .await
            .unwrap();

        let past = now_millis() - chrono::Duration::days(1);
        assert_eq!(table.reverify_batch(&site(), past, 10).await.unwrap(), 0);

        let future = now_millis() + chrono::Duration::days(1);
        assert_eq!(table.reverify_batch(&site(), future, 10).await.unwrap(), 1);
        let entry = table.fetch(&site(), 1).await.unwrap();
        assert_eq!(entry.verification_state, VerificationState::Pending);
        assert_eq!(entry.verification_checksum, None);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let (_store, table) = memory_table().await;
        for id in 1..=3 {
            table.create_pending(&site(), id).await.unwrap();
        }
        synced(&table, 10).await;
        let started = table.start_verification(&site(), 10).await.unwrap();
        table
            .fail_verification(
                &site(),
                10,
                started.verification_attempt,
                &VerificationFailure::ChecksumMismatch {
                    computed: Checksum::compute(b"bad"),
                },
            )
            .await
            .unwrap();

        let status = table.status(&site()).await.unwrap();
        assert_eq!(status.total, 4);
        assert_eq!(status.sync_count(SyncState::Pending), 3);
        assert_eq!(status.sync_count(SyncState::Synced), 1);
        assert_eq!(status.verification_count(VerificationState::Failed), 1);
        assert_eq!(status.checksum_mismatch, 1);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::at_path(dir.path().join("registry.db"));

        {
            let store = RegistryStore::open(&config, RetryBackoffConfig::default())
                .await
                .unwrap();
            let table = store.table(&lfs()).await.unwrap();
            table.create_pending(&site(), 42).await.unwrap();
            table.start_sync(&site(), 42).await.unwrap();
            store.close().await;
        }

        let store = RegistryStore::open(&config, RetryBackoffConfig::default())
            .await
            .unwrap();
        assert!(store.path().contains("registry.db"));
        let table = store.table(&lfs()).await.unwrap();
        let entry = table.fetch(&site(), 42).await.unwrap();
        assert_eq!(entry.sync_state, SyncState::Started);
        store.close().await;
    }
}
