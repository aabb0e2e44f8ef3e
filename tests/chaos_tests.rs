// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: racing workers, failing lookups and shutdown mid-run.
//!
//! These tests verify the system handles contention and failures without
//! panics, deadlocks, or broken registry invariants.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use replica_registry::{
    Checksum, EngineState, IdRange, RegistryConfig, RegistryEngine, RegistryError, SiteConfig,
    StoreConfig, SyncState, VerificationFailure, VerificationLease, VerificationState,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// =============================================================================
// Exclusivity
// =============================================================================

/// Test: concurrent start_sync on one entry has exactly one winner
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_start_sync_has_one_winner() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(file_engine(dir.path()).await);
    let rt = resource_type("lfs_object");
    engine
        .register(resource_with("lfs_object", &[42], NAMESPACE_A).await)
        .await
        .unwrap();
    engine.create_pending_entry(&rt, 42, &site_id()).await.unwrap();

    let workers: Vec<_> = (0..16)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let rt = rt.clone();
            tokio::spawn(async move { engine.start_sync(&rt, 42, &site_id()).await })
        })
        .collect();

    let mut winners = 0;
    let mut losers = 0;
    for worker in workers {
        match worker.await.unwrap() {
            Ok(entry) => {
                assert_eq!(entry.sync_state, SyncState::Started);
                winners += 1;
            }
            Err(RegistryError::RaceLost { resource_id }) => {
                assert_eq!(resource_id, 42);
                losers += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(losers, 15);
}

/// Test: concurrent verification starts also have exactly one winner
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_start_verification_has_one_winner() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(file_engine(dir.path()).await);
    let rt = resource_type("lfs_object");
    engine
        .register(resource_with("lfs_object", &[1], NAMESPACE_A).await)
        .await
        .unwrap();
    synced_entry(&engine, &rt, 1).await;

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let rt = rt.clone();
            tokio::spawn(async move { engine.start_verification(&rt, 1, &site_id()).await })
        })
        .collect();

    let results: Vec<_> = futures::future::join_all(workers)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| e.is_expected()));
}

/// Test: workers claiming batches concurrently never claim the same entry
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_batch_claims_are_disjoint() {
    let dir = tempdir().unwrap();
    let engine = Arc::new(file_engine(dir.path()).await);
    let rt = resource_type("upload");
    let ids: Vec<i64> = (1..=100).collect();
    engine
        .register(resource_with("upload", &ids, NAMESPACE_A).await)
        .await
        .unwrap();
    engine.reconcile_all(&rt, &SiteConfig::all(SITE)).await.unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let rt = rt.clone();
            tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = engine.claim_sync_batch(&rt, &site_id(), 7).await.unwrap();
                    if batch.is_empty() {
                        return mine;
                    }
                    mine.extend(batch);
                }
            })
        })
        .collect();

    let mut seen = BTreeSet::new();
    for worker in workers {
        for id in worker.await.unwrap() {
            assert!(seen.insert(id), "resource {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 100);

    let status = engine.status(&rt, &site_id()).await.unwrap();
    assert_eq!(status.sync_count(SyncState::Started), 100);
}

/// Test: a stale worker finishing after the reaper failed its entry loses
#[tokio::test]
async fn stale_worker_after_timeout_is_rejected() {
    let engine = memory_engine().await;
    let rt = resource_type("upload");
    engine
        .register(resource_with("upload", &[1], NAMESPACE_A).await)
        .await
        .unwrap();
    engine.create_pending_entry(&rt, 1, &site_id()).await.unwrap();
    engine.start_sync(&rt, 1, &site_id()).await.unwrap();

    engine
        .reap_timeouts_at(
            &rt,
            Duration::from_secs(60),
            chrono::Utc::now() + chrono::Duration::hours(1),
        )
        .await
        .unwrap();

    // The first worker reports success too late
    let late = engine.succeed_sync(&rt, 1, &site_id()).await;
    assert!(matches!(late, Err(RegistryError::InvalidTransition { .. })));
    let entry = engine.get_entry(&rt, 1, &site_id()).await.unwrap().unwrap();
    assert_eq!(entry.sync_state, SyncState::Failed);
    assert!(entry.satisfies_invariants());
}

/// Test: a verifier whose attempt timed out and was restarted cannot
/// complete the newer attempt
#[tokio::test]
async fn stale_verifier_after_restart_is_rejected() {
    let engine = memory_engine().await;
    let rt = resource_type("lfs_object");
    let resource = resource_with("lfs_object", &[], NAMESPACE_A).await;
    let good = Checksum::compute(b"object bytes");
    resource
        .insert_with_checksum(9, scope(NAMESPACE_A), good.clone())
        .await;
    engine.register(resource).await.unwrap();
    synced_entry(&engine, &rt, 9).await;

    let slow = engine
        .start_verification(&rt, 9, &site_id())
        .await
        .unwrap()
        .verification_lease();

    // The reaper gives up on the slow worker, another worker picks the entry up
    let stats = engine
        .reap_timeouts_at(
            &rt,
            Duration::from_secs(60),
            chrono::Utc::now() + chrono::Duration::hours(1),
        )
        .await
        .unwrap();
    assert_eq!(stats.verification_timeouts, 1);
    engine.reset_verification(&rt, 9, &site_id()).await.unwrap();
    let fresh = engine
        .claim_verification_batch(&rt, &site_id(), 10)
        .await
        .unwrap();
    assert_eq!(fresh.len(), 1);
    assert!(fresh[0].attempt > slow.attempt);

    // The slow worker finally reports a good checksum for its old attempt
    let late = engine.record_checksum(&rt, slow, &site_id(), good).await;
    assert!(matches!(late, Err(RegistryError::RaceLost { resource_id: 9 })));
    let entry = engine.get_entry(&rt, 9, &site_id()).await.unwrap().unwrap();
    assert_eq!(entry.verification_state, VerificationState::Started);
    assert_eq!(entry.verification_checksum, None);

    // The current attempt's result still lands
    let bad = VerificationFailure::Error("read failed".to_string());
    let entry = engine
        .fail_verification(&rt, fresh[0], &site_id(), &bad)
        .await
        .unwrap();
    assert_eq!(entry.verification_state, VerificationState::Failed);
    assert_eq!(entry.verification_failure.as_deref(), Some("read failed"));
    assert!(entry.satisfies_invariants());
}

// =============================================================================
// Failure Isolation
// =============================================================================

/// Test: one failing range doesn't abort the pass
#[tokio::test]
async fn failing_range_is_isolated() {
    let mut config = RegistryConfig::for_testing(SITE);
    config.settings.reconcile.batch_width = 10;
    let engine = RegistryEngine::open(config).await.unwrap();
    let rt = resource_type("upload");
    let ids: Vec<i64> = (0..30).collect();
    let resource = resource_with("upload", &ids, NAMESPACE_A).await;
    resource.poison(15).await;
    engine.register(resource).await.unwrap();

    let stats = engine.reconcile_all(&rt, &SiteConfig::all(SITE)).await.unwrap();
    assert_eq!(stats.range_errors, 1);
    assert_eq!(stats.ranges_processed, 2);
    assert_eq!(stats.entries_created, 20);

    let table = engine.table(&rt).await.unwrap();
    let broken = table
        .tracked_ids_in_range(&site_id(), IdRange::new(10, 20).unwrap())
        .await
        .unwrap();
    assert!(broken.is_empty());
}

/// Test: a failing lookup surfaces as a resource error, not a panic
#[tokio::test]
async fn failing_lookup_is_a_resource_error() {
    let engine = memory_engine().await;
    let rt = resource_type("upload");
    let resource = resource_with("upload", &[5], NAMESPACE_A).await;
    resource.poison(5).await;
    engine.register(resource).await.unwrap();

    let result = engine
        .reconcile(&rt, IdRange::new(0, 10).unwrap(), &SiteConfig::all(SITE))
        .await;
    match result {
        Err(e @ RegistryError::Resource { .. }) => assert!(e.is_retryable()),
        other => panic!("expected resource error, got {other:?}"),
    }
}

// =============================================================================
// Shutdown
// =============================================================================

/// Test: shutdown while background tasks run completes promptly
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_during_background_work() {
    let dir = tempdir().unwrap();
    let mut config = RegistryConfig::for_testing(SITE);
    config.store = StoreConfig::at_path(dir.path().join("registry.db"));
    config.settings.reconcile.interval_sec = 0;
    config.settings.reconcile.batch_width = 50;
    config.settings.reaper.interval_sec = 0;

    let mut engine = RegistryEngine::open(config).await.unwrap();
    let ids: Vec<i64> = (1..=5_000).collect();
    engine
        .register(resource_with("upload", &ids, NAMESPACE_A).await)
        .await
        .unwrap();
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(15), engine.shutdown())
        .await
        .expect("shutdown should not hang");
    assert_eq!(engine.state(), EngineState::Stopped);

    // Whatever was written is consistent: reopen and finish the pass
    let engine = file_engine(dir.path()).await;
    let rt = resource_type("upload");
    engine
        .register(resource_with("upload", &ids, NAMESPACE_A).await)
        .await
        .unwrap();
    engine.reconcile_all(&rt, &SiteConfig::all(SITE)).await.unwrap();
    assert_eq!(engine.status(&rt, &site_id()).await.unwrap().total, 5_000);
}

/// Test: operations after shutdown fail cleanly
#[tokio::test]
async fn operations_after_shutdown_fail() {
    let mut engine = memory_engine().await;
    let rt = resource_type("upload");
    engine
        .register(resource_with("upload", &[1], NAMESPACE_A).await)
        .await
        .unwrap();
    engine.shutdown().await;

    assert!(matches!(
        engine.start_sync(&rt, 1, &site_id()).await,
        Err(RegistryError::Shutdown)
    ));
    assert!(matches!(
        engine
            .succeed_verification(
                &rt,
                VerificationLease {
                    resource_id: 1,
                    attempt: 1
                },
                &site_id(),
                Checksum::compute(b"x")
            )
            .await,
        Err(RegistryError::Shutdown)
    ));
    assert!(matches!(engine.start().await, Err(RegistryError::InvalidState { .. })));
}
