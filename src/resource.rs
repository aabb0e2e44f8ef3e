// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The capability each replicable resource type implements.
//!
//! A resource type plugs into reconciliation by answering primary-side
//! questions: which IDs exist in a range, where each resource lives (for
//! selective sync), and what its checksum is (for verification).
//!
//! # Example
//!
//! ```rust,no_run
//! use replica_registry::resource::{BoxFuture, Replicable};
//! use replica_registry::{IdRange, ResourceId, ResourceType, ScopeDescriptor};
//! use std::collections::BTreeSet;
//!
//! struct PackageFiles { resource_type: ResourceType }
//!
//! impl Replicable for PackageFiles {
//!     fn resource_type(&self) -> &ResourceType {
//!         &self.resource_type
//!     }
//!
//!     fn existing_ids_in_range(&self, _range: IdRange) -> BoxFuture<'_, BTreeSet<ResourceId>> {
//!         Box::pin(async move { Ok(BTreeSet::new()) }) // SELECT id ... WHERE id >= ? AND id < ?
//!     }
//!
//!     fn owning_scope(&self, _id: ResourceId) -> BoxFuture<'_, Option<ScopeDescriptor>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn id_bounds(&self) -> BoxFuture<'_, Option<(ResourceId, ResourceId)>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//! }
//! ```

use crate::selective_sync::ScopeDescriptor;
use crate::types::{Checksum, IdRange, ResourceId, ResourceType};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// Result type for primary-side lookups.
pub type ResourceResult<T> = std::result::Result<T, ResourceError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ResourceResult<T>> + Send + 'a>>;

/// Error from a resource type's primary-side lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceError(pub String);

impl std::fmt::Display for ResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ResourceError {}

/// Primary-side view of one replicable resource type.
pub trait Replicable: Send + Sync + 'static {
    fn resource_type(&self) -> &ResourceType;

    /// IDs in `range` that currently exist on the primary. One ranged lookup.
    fn existing_ids_in_range(&self, range: IdRange) -> BoxFuture<'_, BTreeSet<ResourceId>>;

    /// Namespace/shard placement of one resource, `None` if it is gone.
    fn owning_scope(&self, resource_id: ResourceId) -> BoxFuture<'_, Option<ScopeDescriptor>>;

    /// Smallest and largest existing ID, `None` if there are no resources.
    fn id_bounds(&self) -> BoxFuture<'_, Option<(ResourceId, ResourceId)>>;

    /// Placement of many resources. IDs that are gone are omitted.
    ///
    /// The default issues one lookup per ID; override with a batched query.
    fn owning_scopes<'a>(
        &'a self,
        ids: &'a BTreeSet<ResourceId>,
    ) -> BoxFuture<'a, HashMap<ResourceId, ScopeDescriptor>> {
        Box::pin(async move {
            let mut scopes = HashMap::with_capacity(ids.len());
            for id in ids {
                if let Some(scope) = self.owning_scope(*id).await? {
                    scopes.insert(*id, scope);
                }
            }
            Ok(scopes)
        })
    }

    /// Checksum of the primary copy, `None` if the primary has not computed one.
    fn primary_checksum(&self, _resource_id: ResourceId) -> BoxFuture<'_, Option<Checksum>> {
        Box::pin(async move { Ok(None) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StaticResource
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct StaticRecord {
    scope: ScopeDescriptor,
    checksum: Option<Checksum>,
}

/// In-memory resource type.
///
/// Useful for tests and for embedding a primary whose inventory is already
/// loaded. IDs can be "poisoned" so that lookups touching them fail, which
/// exercises per-range error isolation.
pub struct StaticResource {
    resource_type: ResourceType,
    records: RwLock<BTreeMap<ResourceId, StaticRecord>>,
    poisoned: RwLock<HashSet<ResourceId>>,
}

impl StaticResource {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            records: RwLock::new(BTreeMap::new()),
            poisoned: RwLock::new(HashSet::new()),
        }
    }

    /// Add or replace a resource.
    pub async fn insert(&self, resource_id: ResourceId, scope: ScopeDescriptor) {
        self.records.write().await.insert(
            resource_id,
            StaticRecord {
                scope,
                checksum: None,
            },
        );
    }

    /// Add or replace a resource with a known primary checksum.
    pub async fn insert_with_checksum(
        &self,
        resource_id: ResourceId,
        scope: ScopeDescriptor,
        checksum: Checksum,
    ) {
        self.records.write().await.insert(
            resource_id,
            StaticRecord {
                scope,
                checksum: Some(checksum),
            },
        );
    }

    /// Remove a resource. Returns whether it existed.
    pub async fn remove(&self, resource_id: ResourceId) -> bool {
        self.records.write().await.remove(&resource_id).is_some()
    }

    /// Move a resource to another namespace/shard.
    pub async fn set_scope(&self, resource_id: ResourceId, scope: ScopeDescriptor) -> bool {
        match self.records.write().await.get_mut(&resource_id) {
            Some(record) => {
                record.scope = scope;
                true
            }
            None => false,
        }
    }

    /// Make every lookup that touches `resource_id` fail.
    pub async fn poison(&self, resource_id: ResourceId) {
        self.poisoned.write().await.insert(resource_id);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn check_poison(&self, range: IdRange) -> ResourceResult<()> {
        let poisoned = self.poisoned.read().await;
        match poisoned.iter().find(|id| range.contains(**id)) {
            Some(id) => Err(ResourceError(format!("lookup failed for resource {}", id))),
            None => Ok(()),
        }
    }
}

impl Replicable for StaticResource {
    fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    fn existing_ids_in_range(&self, range: IdRange) -> BoxFuture<'_, BTreeSet<ResourceId>> {
        Box::pin(async move {
            self.check_poison(range).await?;
            if range.is_empty() {
                return Ok(BTreeSet::new());
            }
            let records = self.records.read().await;
            Ok(records
                .range(range.low()..range.high())
                .map(|(id, _)| *id)
                .collect())
        })
    }

    fn owning_scope(&self, resource_id: ResourceId) -> BoxFuture<'_, Option<ScopeDescriptor>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(records.get(&resource_id).map(|r| r.scope.clone()))
        })
    }

    fn owning_scopes<'a>(
        &'a self,
        ids: &'a BTreeSet<ResourceId>,
    ) -> BoxFuture<'a, HashMap<ResourceId, ScopeDescriptor>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(ids
                .iter()
                .filter_map(|id| records.get(id).map(|r| (*id, r.scope.clone())))
                .collect())
        })
    }

    fn id_bounds(&self) -> BoxFuture<'_, Option<(ResourceId, ResourceId)>> {
        Box::pin(async move {
            let records = self.records.read().await;
            let min = records.keys().next().copied();
            let max = records.keys().next_back().copied();
            Ok(min.zip(max))
        })
    }

    fn primary_checksum(&self, resource_id: ResourceId) -> BoxFuture<'_, Option<Checksum>> {
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(records.get(&resource_id).and_then(|r| r.checksum.clone()))
        })
    }
}
