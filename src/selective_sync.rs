//! Selective sync: which resources a site replicates.
//!
//! A site either replicates everything, or only resources owned by a set of
//! namespaces (including their descendants), or only resources stored on a
//! set of storage shards.
//!
//! [`in_scope`] is the plain predicate. Reconciliation calls it millions of
//! times per pass, so it goes through a [`ScopeFilter`] built once per pass
//! with the selection sets materialized as hash sets.

use crate::types::{ResourceId, SiteId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Namespace identifier on the primary.
pub type NamespaceId = i64;

/// Selective sync mode of a site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncMode {
    /// Replicate every resource.
    #[default]
    All,
    /// Replicate resources owned by these namespaces or any of their descendants.
    ByNamespace { namespaces: BTreeSet<NamespaceId> },
    /// Replicate resources stored on these shards.
    ByShard { shards: BTreeSet<String> },
}

impl SyncMode {
    pub fn is_selective(&self) -> bool {
        !matches!(self, SyncMode::All)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncMode::All => "all",
            SyncMode::ByNamespace { .. } => "namespaces",
            SyncMode::ByShard { .. } => "shards",
        }
    }
}

/// Sync configuration of one secondary site.
///
/// Passed explicitly into every filter and reconciliation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub site_id: SiteId,
    #[serde(default)]
    pub sync_mode: SyncMode,
}

impl SiteConfig {
    /// Site replicating everything.
    pub fn all(site_id: impl Into<SiteId>) -> Self {
        Self {
            site_id: site_id.into(),
            sync_mode: SyncMode::All,
        }
    }

    /// Site replicating only the given namespaces and their descendants.
    pub fn by_namespace(
        site_id: impl Into<SiteId>,
        namespaces: impl IntoIterator<Item = NamespaceId>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            sync_mode: SyncMode::ByNamespace {
                namespaces: namespaces.into_iter().collect(),
            },
        }
    }

    /// Site replicating only the given storage shards.
    pub fn by_shard<S: Into<String>>(
        site_id: impl Into<SiteId>,
        shards: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            sync_mode: SyncMode::ByShard {
                shards: shards.into_iter().map(Into::into).collect(),
            },
        }
    }
}

/// Where a resource lives on the primary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopeDescriptor {
    /// Owning namespace and its ancestors, root first, owner last.
    /// Empty for resources not owned by a namespace.
    #[serde(default)]
    pub namespace_traversal: Vec<NamespaceId>,
    /// Storage shard holding the resource.
    #[serde(default)]
    pub shard: String,
}

impl ScopeDescriptor {
    pub fn new(namespace_traversal: Vec<NamespaceId>, shard: impl Into<String>) -> Self {
        Self {
            namespace_traversal,
            shard: shard.into(),
        }
    }

    /// The owning namespace, if any.
    pub fn owner(&self) -> Option<NamespaceId> {
        self.namespace_traversal.last().copied()
    }
}

/// Decide whether a resource with `scope` is replicated to `site`.
///
/// One-off check; build a [`ScopeFilter`] once when testing many scopes.
pub fn in_scope(scope: &ScopeDescriptor, site: &SiteConfig) -> bool {
    ScopeFilter::new(site).contains(scope)
}

/// Selective sync predicate with its selection set materialized once.
#[derive(Debug, Clone)]
pub enum ScopeFilter {
    All,
    Namespaces(HashSet<NamespaceId>),
    Shards(HashSet<String>),
}

impl ScopeFilter {
    pub fn new(site: &SiteConfig) -> Self {
        match &site.sync_mode {
            SyncMode::All => ScopeFilter::All,
            SyncMode::ByNamespace { namespaces } => {
                ScopeFilter::Namespaces(namespaces.iter().copied().collect())
            }
            SyncMode::ByShard { shards } => ScopeFilter::Shards(shards.iter().cloned().collect()),
        }
    }

    /// Whether lookups of owning scopes are needed at all.
    pub fn is_selective(&self) -> bool {
        !matches!(self, ScopeFilter::All)
    }

    pub fn contains(&self, scope: &ScopeDescriptor) -> bool {
        match self {
            ScopeFilter::All => true,
            ScopeFilter::Namespaces(set) => scope.namespace_traversal.iter().any(|ns| set.contains(ns)),
            ScopeFilter::Shards(set) => set.contains(&scope.shard),
        }
    }

    /// Keep the IDs whose scope is selected.
    ///
    /// IDs missing from `scopes` are treated as out of scope: a resource whose
    /// owner cannot be resolved is not replicated.
    pub fn filter_ids(
        &self,
        ids: &BTreeSet<ResourceId>,
        scopes: &HashMap<ResourceId, ScopeDescriptor>,
    ) -> BTreeSet<ResourceId> {
        if !self.is_selective() {
            return ids.clone();
        }
        ids.iter()
            .copied()
            .filter(|id| scopes.get(id).is_some_and(|scope| self.contains(scope)))
            .collect()
    }
}
