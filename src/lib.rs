//! # Replica Registry
//!
//! Consistency tracking for resources replicated from a primary site to
//! secondary sites.
//!
//! ## Architecture
//!
//! For every replicable resource type, each secondary site keeps a registry:
//! one entry per resource recording whether the local copy is synced and
//! whether its checksum has been verified. Workers elsewhere do the actual
//! transfers and hashing; this crate keeps the bookkeeping correct.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           replica-registry                                │
//! │                                                                           │
//! │  ┌─────────────┐   ID ranges   ┌────────────┐   create / delete          │
//! │  │ Replicable  │──────────────►│ Reconciler │──────────────────┐          │
//! │  │ (primary)   │  + scopes     └────────────┘                  ▼          │
//! │  └─────────────┘                                     ┌────────────────┐   │
//! │        ▲                                             │ RegistryTable  │   │
//! │        │ primary_checksum      start/succeed/fail    │ (SQLite, CAS)  │   │
//! │  ┌─────────────┐  ─────────────────────────────────► └────────────────┘   │
//! │  │ Workers     │                                             ▲            │
//! │  └─────────────┘                        timeouts, reverify   │            │
//! │                                          ┌────────────┐      │            │
//! │                                          │   Reaper   │──────┘            │
//! │                                          └────────────┘                   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two State Machines
//!
//! 1. **Sync**: `pending → started → synced | failed`, with `reset` back to pending
//! 2. **Verification**: same shape, only entered once sync is `synced`
//!
//! Every transition is a compare-and-set on the entry's `lock_version`, so
//! concurrent workers racing for one entry produce exactly one winner.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replica_registry::{RegistryConfig, RegistryEngine, ResourceType, StaticResource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> replica_registry::Result<()> {
//!     let config = RegistryConfig::for_testing("secondary-1");
//!     let mut engine = RegistryEngine::open(config).await?;
//!
//!     let uploads = ResourceType::new("upload").expect("valid name");
//!     engine.register(Arc::new(StaticResource::new(uploads))).await?;
//!     engine.start().await?;
//!
//!     // Engine reconciles and sweeps until shutdown
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod entry;
pub mod error;
pub mod metrics;
pub mod reaper;
pub mod reconcile;
pub mod resilience;
pub mod resource;
pub mod selective_sync;
pub mod state;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use config::{
    ReaperConfig, ReconcileConfig, RegistryConfig, RegistrySettings, RetryBackoffConfig,
    StoreConfig, VerificationConfig,
};
pub use coordinator::{EngineState, HealthCheck, RegistryEngine};
pub use entry::{RegistryEntry, VerificationFailure, VerificationLease};
pub use error::{RegistryError, Result};
pub use reaper::ReapStats;
pub use reconcile::{
    find_registry_differences, AppliedDifferences, ReconcileStats, Reconciler, RegistryDifferences,
};
pub use resource::{Replicable, StaticResource};
pub use selective_sync::{NamespaceId, ScopeDescriptor, ScopeFilter, SiteConfig, SyncMode};
pub use state::{SyncEvent, SyncState, VerificationEvent, VerificationState};
pub use store::{RegistryStatus, RegistryStore, RegistryTable};
pub use types::{Checksum, IdRange, ResourceId, ResourceType, SiteId};
