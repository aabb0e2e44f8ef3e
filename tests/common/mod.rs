//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Engine and store constructors (in-memory and on-disk)
//! - `StaticResource` builders with namespace/shard placement
//! - Helpers that walk an entry through its state machines

#![allow(dead_code)]

use replica_registry::{
    Checksum, RegistryConfig, RegistryEngine, ResourceId, ResourceType, ScopeDescriptor, SiteId,
    StaticResource, StoreConfig,
};
use std::path::Path;
use std::sync::Arc;

pub const SITE: &str = "secondary-1";

/// Namespaces used by the selective sync scenarios.
pub const NAMESPACE_A: i64 = 10;
pub const NAMESPACE_B: i64 = 20;

pub fn resource_type(name: &str) -> ResourceType {
    ResourceType::new(name).expect("valid resource type")
}

pub fn site_id() -> SiteId {
    SiteId::new(SITE)
}

/// Scope owned by `namespace` (top-level), on the default shard.
pub fn scope(namespace: i64) -> ScopeDescriptor {
    ScopeDescriptor::new(vec![namespace], "default")
}

pub fn scope_on_shard(namespace: i64, shard: &str) -> ScopeDescriptor {
    ScopeDescriptor::new(vec![namespace], shard)
}

/// Build a resource type whose primary has `ids`, all owned by `namespace`.
pub async fn resource_with(name: &str, ids: &[ResourceId], namespace: i64) -> Arc<StaticResource> {
    let resource = Arc::new(StaticResource::new(resource_type(name)));
    for id in ids {
        resource.insert(*id, scope(namespace)).await;
    }
    resource
}

/// Enable tracing output for debugging a failing test (RUST_LOG=debug).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine backed by an in-memory store, background tasks not started.
pub async fn memory_engine() -> RegistryEngine {
    RegistryEngine::open(RegistryConfig::for_testing(SITE))
        .await
        .expect("open in-memory engine")
}

/// Engine backed by a SQLite file under `dir`.
pub async fn file_engine(dir: &Path) -> RegistryEngine {
    let mut config = RegistryConfig::for_testing(SITE);
    config.store = StoreConfig::at_path(dir.join("registry.db"));
    RegistryEngine::open(config)
        .await
        .expect("open file-backed engine")
}

/// Create, start and succeed the sync of one entry.
pub async fn synced_entry(engine: &RegistryEngine, rt: &ResourceType, id: ResourceId) {
    let site = site_id();
    engine.create_pending_entry(rt, id, &site).await.unwrap();
    engine.start_sync(rt, id, &site).await.unwrap();
    engine.succeed_sync(rt, id, &site).await.unwrap();
}

/// A synced entry whose verification succeeded with `checksum`.
pub async fn verified_entry(
    engine: &RegistryEngine,
    rt: &ResourceType,
    id: ResourceId,
    checksum: Checksum,
) {
    synced_entry(engine, rt, id).await;
    let site = site_id();
    let lease = engine
        .start_verification(rt, id, &site)
        .await
        .unwrap()
        .verification_lease();
    engine
        .succeed_verification(rt, lease, &site, checksum)
        .await
        .unwrap();
}
