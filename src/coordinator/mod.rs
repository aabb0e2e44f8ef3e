// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry engine coordinator.
//!
//! The main orchestrator that ties together:
//! - Registry persistence via [`crate::store::RegistryStore`]
//! - Resource types plugged in through [`crate::resource::Replicable`]
//! - Range reconciliation via [`crate::reconcile::Reconciler`]
//! - The timeout reaper in [`crate::reaper`]
//!
//! # Architecture
//!
//! The coordinator manages the registry lifecycle:
//! 1. Opens the registry store and creates one table per registered type
//! 2. Serves per-entry sync and verification transitions to workers
//! 3. Periodically reconciles each type's ID space against the primary
//! 4. Periodically fails timed-out attempts and queues reverification
//! 5. Handles graceful shutdown, letting in-flight passes finish
//!
//! Every per-entry operation takes the site explicitly. The background
//! tasks work on behalf of the site in [`RegistryConfig::site`].

mod tasks;
mod types;

pub use tasks::{reap_pass, ReaperPassStats, ResourceMap};
pub use types::{EngineState, HealthCheck, RegisteredResource};

use crate::config::RegistryConfig;
use crate::entry::{RegistryEntry, VerificationFailure, VerificationLease};
use crate::error::{RegistryError, Result};
use crate::metrics;
use crate::reaper::{self, ReapStats};
use crate::reconcile::{AppliedDifferences, ReconcileStats, Reconciler, RegistryDifferences};
use crate::resource::Replicable;
use crate::selective_sync::{ScopeFilter, SiteConfig};
use crate::store::{now_millis, RegistryStatus, RegistryStore, RegistryTable};
use crate::types::{Checksum, IdRange, ResourceId, ResourceType, SiteId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// The main registry engine.
///
/// Owns the registry store and the set of registered resource types.
/// Workers (sync and verification jobs running elsewhere) drive entries
/// through their state machines with the per-entry methods; the engine
/// itself never transfers or checksums anything.
pub struct RegistryEngine {
    /// Configuration
    config: RegistryConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    state_rx: watch::Receiver<EngineState>,

    /// Registry persistence
    store: Arc<RegistryStore>,

    /// Registered resource types and their tables
    resources: ResourceMap,

    /// Range reconciler (shared with the background task)
    reconciler: Arc<Reconciler>,

    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver
    shutdown_rx: watch::Receiver<bool>,

    /// Background task handles
    task_handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl RegistryEngine {
    /// Open the registry store and create an engine in `Created` state.
    ///
    /// Per-entry operations work immediately. Call [`start()`](Self::start)
    /// to begin periodic reconciliation and timeout sweeps.
    pub async fn open(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let store = RegistryStore::open(&config.store, config.settings.retry.clone()).await?;
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = Arc::new(Reconciler::new(config.settings.reconcile.clone()));

        info!(
            site = %config.site.site_id,
            sync_mode = config.site.sync_mode.label(),
            store = %store.path(),
            "Registry engine opened"
        );
        metrics::set_engine_state("Created");

        Ok(Self {
            config,
            state_tx,
            state_rx,
            store: Arc::new(store),
            resources: Arc::new(RwLock::new(HashMap::new())),
            reconciler,
            shutdown_tx,
            shutdown_rx,
            task_handles: RwLock::new(Vec::new()),
        })
    }

    /// Get the current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if the engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The site the background tasks work for.
    pub fn site(&self) -> &SiteConfig {
        &self.config.site
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            EngineState::ShuttingDown | EngineState::Stopped => Err(RegistryError::Shutdown),
            _ => Ok(()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Registration
    // ═══════════════════════════════════════════════════════════════════════════

    /// Register a resource type, creating its registry table if missing.
    ///
    /// Types can be registered before or after `start()`; the background
    /// tasks pick them up on their next tick.
    pub async fn register(&self, resource: Arc<dyn Replicable>) -> Result<RegistryTable> {
        self.ensure_open()?;
        let resource_type = resource.resource_type().clone();
        let mut resources = self.resources.write().await;
        if resources.contains_key(&resource_type) {
            return Err(RegistryError::Config(format!(
                "Resource type {} is already registered",
                resource_type
            )));
        }
        let table = self.store.table(&resource_type).await?;
        resources.insert(
            resource_type.clone(),
            RegisteredResource {
                resource,
                table: table.clone(),
            },
        );
        info!(resource_type = %resource_type, "Registered resource type");
        Ok(table)
    }

    /// Registered resource types, sorted.
    pub async fn resource_types(&self) -> Vec<ResourceType> {
        let mut types: Vec<_> = self.resources.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    async fn registered(&self, resource_type: &ResourceType) -> Result<RegisteredResource> {
        self.ensure_open()?;
        self.resources
            .read()
            .await
            .get(resource_type)
            .cloned()
            .ok_or_else(|| {
                RegistryError::Config(format!("Resource type {} is not registered", resource_type))
            })
    }

    /// The registry table for a registered resource type.
    pub async fn table(&self, resource_type: &ResourceType) -> Result<RegistryTable> {
        Ok(self.registered(resource_type).await?.table)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Per-entry operations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Track a resource for a site. Idempotent: returns the existing entry if any.
    pub async fn create_pending_entry(
        &self,
        resource_type: &ResourceType,
        resource_id: ResourceId,
        site: &SiteId,
    ) -> Result<RegistryEntry> {
        self.table(resource_type)
            .await?
            .create_pending(site, resource_id)
            .await
    }

    pub async fn get_entry(
        &self,
        resource_type: &ResourceType,
        resource_id: ResourceId,
        site: &SiteId,
    ) -> Result<Option<RegistryEntry>> {
        self.table(resource_type).await?.get(site, resource_id).await
    }

    /// Stop tracking a resource. Returns whether an entry existed.
    pub async fn delete_entry(
        &self,
        resource_type: &ResourceType,
        resource_id: ResourceId,
        site: &SiteId,
    ) -> Result<bool> {
        self.table(resource_type).await?.delete(site, resource_id).await
    }

    /// Claim an entry for syncing. Exactly one of several concurrent callers wins;
    /// the rest get [`RegistryError::RaceLost`].
    pub async fn start_sync(
        &self,
        resource_type: &ResourceType,
        resource_id: ResourceId,
        site: &SiteId,
    ) -> Result<RegistryEntry> {
        self.table(resource_type)
            .await?
            .start_sync(site, resource_id)
            .await
    }

    pub async fn succeed_sync(
        &self,
        resource_type: &ResourceType,
        resource_id: ResourceId,
        site: &SiteId,
    ) -> Result<RegistryEntry> {
        self.table(resource_type)
            .await?
            .succeed_sync(site, resource_id)
            .await
    }

    pub async fn fail_sync(
        &self,
        resource_type: &ResourceType,
        resource_id: ResourceId,
        site: &SiteId,
        reason: &str,
    ) -> Result<RegistryEntry> {
        self.table(resource_type)
            .await?
            .fail_sync(site, resource_id, reason)
            .await
    }

    /// Requeue a sync, e.g. after the primary copy changed.
    pub async fn reset_sync(
        &self,
        resource_type: &ResourceType,
        resource_id: ResourceId,
        site: &SiteId,
    ) -> Result<RegistryEntry> {
        self.table(resource_type)
            .await?
            .reset_sync(site, resource_id)
            .await
    }

    /// Start verifying one entry. The returned entry's
    /// [`verification_lease`](RegistryEntry::verification_lease) must be
    /// presented when reporting the result.
    pub async fn start_verification(
        &self,
        resource_type: &ResourceType,
        resource_id: ResourceId,
        site: &SiteId,
    ) -> Result<RegistryEntry> {
        self.table(resource_type)
            .await?
            .start_verification(site, resource_id)
            .await
    }

    /// Report a verified checksum. `RaceLost` if `lease` is no longer the
    /// attempt in flight.
    pub async fn succeed_verification(
        &self,
        resource_type: &ResourceType,
        lease: VerificationLease,
        site: &SiteId,
        checksum: Checksum,
    ) -> Result<RegistryEntry> {
        self.table(resource_type)
            .await?
            .succeed_verification(site, lease.resource_id, lease.attempt, checksum)
            .await
    }

    pub async fn fail_verification(
        &self,
        resource_type: &ResourceType,
        lease: VerificationLease,
        site: &SiteId,
        failure: &VerificationFailure,
    ) -> Result<RegistryEntry> {
        self.table(resource_type)
            .await?
            .fail_verification(site, lease.resource_id, lease.attempt, failure)
            .await
    }

    pub async fn reset_verification(
        &self,
        resource_type: &ResourceType,
        resource_id: ResourceId,
        site: &SiteId,
    ) -> Result<RegistryEntry> {
        self.table(resource_type)
            .await?
            .reset_verification(site, resource_id)
            .await
    }

    /// Finish a started verification by comparing `computed` with the primary.
    ///
    /// Matching checksums succeed the verification. A mismatch, or a primary
    /// without a checksum, fails it. Either way the result only lands if
    /// `lease` is still the attempt in flight.
    pub async fn record_checksum(
        &self,
        resource_type: &ResourceType,
        lease: VerificationLease,
        site: &SiteId,
        computed: Checksum,
    ) -> Result<RegistryEntry> {
        let VerificationLease {
            resource_id,
            attempt,
        } = lease;
        let registered = self.registered(resource_type).await?;
        let primary = registered
            .resource
            .primary_checksum(resource_id)
            .await
            .map_err(|e| RegistryError::resource(resource_type, e.0))?;

        match primary {
            Some(expected) if expected == computed => {
                registered
                    .table
                    .succeed_verification(site, resource_id, attempt, computed)
                    .await
            }
            Some(expected) => {
                debug!(
                    resource_type = %resource_type,
                    resource_id,
                    expected = %expected.fingerprint(),
                    computed = %computed.fingerprint(),
                    "Checksum mismatch"
                );
                registered
                    .table
                    .fail_verification(
                        site,
                        resource_id,
                        attempt,
                        &VerificationFailure::ChecksumMismatch { computed },
                    )
                    .await
            }
            None => {
                registered
                    .table
                    .fail_verification(
                        site,
                        resource_id,
                        attempt,
                        &VerificationFailure::Error("primary checksum unavailable".to_string()),
                    )
                    .await
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Batches and status
    // ═══════════════════════════════════════════════════════════════════════════

    /// Claim up to `limit` entries that need syncing.
    pub async fn claim_sync_batch(
        &self,
        resource_type: &ResourceType,
        site: &SiteId,
        limit: usize,
    ) -> Result<Vec<ResourceId>> {
        self.table(resource_type)
            .await?
            .claim_sync_batch(site, limit, now_millis())
            .await
    }

    /// Claim up to `limit` synced entries that need verifying.
    pub async fn claim_verification_batch(
        &self,
        resource_type: &ResourceType,
        site: &SiteId,
        limit: usize,
    ) -> Result<Vec<VerificationLease>> {
        self.table(resource_type)
            .await?
            .claim_verification_batch(site, limit, now_millis())
            .await
    }

    /// Entry counts by state. Also refreshes the status gauges.
    pub async fn status(&self, resource_type: &ResourceType, site: &SiteId) -> Result<RegistryStatus> {
        let status = self.table(resource_type).await?.status(site).await?;
        metrics::set_registry_status(resource_type.as_str(), &status);
        Ok(status)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reconciliation and sweeps
    // ═══════════════════════════════════════════════════════════════════════════

    /// Drift between the primary and the registry in `range`. Read-only.
    pub async fn reconcile(
        &self,
        resource_type: &ResourceType,
        range: IdRange,
        site: &SiteConfig,
    ) -> Result<RegistryDifferences> {
        let registered = self.registered(resource_type).await?;
        let filter = ScopeFilter::new(site);
        self.reconciler
            .reconcile_range(
                registered.resource.as_ref(),
                &registered.table,
                range,
                &site.site_id,
                &filter,
            )
            .await
    }

    /// Compute the drift in `range` and create/delete entries to remove it.
    pub async fn reconcile_and_apply(
        &self,
        resource_type: &ResourceType,
        range: IdRange,
        site: &SiteConfig,
    ) -> Result<(RegistryDifferences, AppliedDifferences)> {
        let registered = self.registered(resource_type).await?;
        let filter = ScopeFilter::new(site);
        self.reconciler
            .reconcile_and_apply(
                registered.resource.as_ref(),
                &registered.table,
                range,
                &site.site_id,
                &filter,
            )
            .await
    }

    /// Reconcile a type's whole ID space for `site` in one call.
    pub async fn reconcile_all(
        &self,
        resource_type: &ResourceType,
        site: &SiteConfig,
    ) -> Result<ReconcileStats> {
        let registered = self.registered(resource_type).await?;
        self.reconciler
            .reconcile_all(registered.resource.as_ref(), &registered.table, site)
            .await
    }

    /// Fail every sync and verification of this type started more than `deadline` ago.
    pub async fn reap_timeouts(
        &self,
        resource_type: &ResourceType,
        deadline: Duration,
    ) -> Result<ReapStats> {
        self.reap_timeouts_at(resource_type, deadline, now_millis())
            .await
    }

    /// [`reap_timeouts`](Self::reap_timeouts) as of an explicit `now`.
    pub async fn reap_timeouts_at(
        &self,
        resource_type: &ResourceType,
        deadline: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReapStats> {
        let table = self.table(resource_type).await?;
        reaper::reap_timeouts(&table, deadline, deadline, now).await
    }

    /// Queue one batch of long-verified entries for reverification.
    pub async fn queue_reverification(
        &self,
        resource_type: &ResourceType,
        site: &SiteId,
    ) -> Result<u64> {
        let table = self.table(resource_type).await?;
        reaper::queue_reverification(&table, site, &self.config.settings.verification, now_millis())
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Start the background tasks.
    ///
    /// Spawns the reconciliation task and the timeout reaper (each only if
    /// enabled in config).
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(RegistryError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            site = %self.config.site.site_id,
            resource_types = self.resources.read().await.len(),
            "Starting registry engine"
        );

        let settings = &self.config.settings;
        let mut handles = self.task_handles.write().await;

        if settings.reconcile.enabled {
            let handle = tokio::spawn(tasks::run_reconciliation(
                Arc::clone(&self.reconciler),
                Arc::clone(&self.resources),
                self.config.site.clone(),
                self.shutdown_rx.clone(),
            ));
            handles.push(handle);
        } else {
            debug!("Reconciliation disabled");
        }

        if settings.reaper.enabled {
            let handle = tokio::spawn(tasks::run_reaper(
                Arc::clone(&self.resources),
                settings.reaper.clone(),
                settings.verification.clone(),
                self.config.site.site_id.clone(),
                self.shutdown_rx.clone(),
            ));
            handles.push(handle);
        } else {
            debug!("Timeout reaper disabled");
        }

        let task_count = handles.len();
        drop(handles);

        let _ = self.state_tx.send(EngineState::Running);
        metrics::set_engine_state("Running");
        info!(task_count, "Registry engine running");

        Ok(())
    }

    /// Snapshot for health endpoints.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let resource_types = self.resource_types().await;
        HealthCheck {
            state,
            ready: state == EngineState::Running && !resource_types.is_empty(),
            resource_types,
            reconcile_enabled: self.config.settings.reconcile.enabled,
            reaper_enabled: self.config.settings.reaper.enabled,
        }
    }

    /// Shutdown the engine gracefully.
    ///
    /// In-flight reconciliation ranges finish; ranges not yet started are
    /// left for the next run. The store is checkpointed and closed.
    pub async fn shutdown(&mut self) {
        info!("Shutting down registry engine");
        let _ = self.state_tx.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        // Signal shutdown to all tasks
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.task_handles.write().await;
            std::mem::take(&mut *guard)
        };

        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        let drain_timeout = Duration::from_secs(10);
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        self.store.close().await;

        let _ = self.state_tx.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Registry engine stopped");
    }
}
