// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot persistence across node restarts.
//!
//! Every test uses a file-backed store in a tempdir so a second node with
//! the same id can restore what the first one saved.

mod common;

use common::{application_form, eventually, pet_form, rex, TestCluster};
use shelter_mesh::persistence::store::{RecordRow, SnapshotWrite};
use shelter_mesh::persistence::SnapshotStore;
use shelter_mesh::{
    ApplicationStatus, MeshError, PetFilter, PetPatch, PetStatus, SnapshotConfig, SnapshotOutcome,
};
use sqlx::sqlite::SqlitePool;

#[tokio::test]
async fn snapshot_second_save_is_noop() {
    let mut cluster = TestCluster::new();
    let service = cluster.start("north").await;
    let persistence = cluster.node("north").persistence().unwrap();

    // Nothing to save yet
    assert_eq!(persistence.save_snapshot(false).await.unwrap(), SnapshotOutcome::NoChanges);

    service.add_pet(rex()).await.unwrap();
    let first = persistence.save_snapshot(false).await.unwrap();
    let SnapshotOutcome::Saved(report) = first else {
        panic!("expected a saved snapshot, got {:?}", first);
    };
    assert_eq!(report.pets_count, 1);
    assert!(!report.incremental);

    assert_eq!(persistence.save_snapshot(false).await.unwrap(), SnapshotOutcome::NoChanges);

    // Forced passes ignore checksums
    let forced = persistence.save_snapshot(true).await.unwrap();
    assert!(matches!(forced, SnapshotOutcome::Saved(ref r) if !r.incremental && r.pets_written == 1));

    cluster.shutdown().await;
}

#[tokio::test]
async fn snapshot_writes_only_changed_rows() {
    let mut cluster = TestCluster::new();
    let service = cluster.start("north").await;
    let persistence = cluster.node("north").persistence().unwrap();

    let pet = service.add_pet(rex()).await.unwrap();
    service.add_pet(pet_form("Milo", "Cat")).await.unwrap();
    service.add_pet(pet_form("Bun", "Rabbit")).await.unwrap();
    assert!(persistence.save_snapshot(false).await.unwrap().is_saved());

    service
        .update_pet(&pet.id, PetPatch { age: Some(4), ..Default::default() })
        .await
        .unwrap();
    let outcome = persistence.save_snapshot(false).await.unwrap();
    let SnapshotOutcome::Saved(report) = outcome else {
        panic!("expected a saved snapshot, got {:?}", outcome);
    };
    assert!(report.incremental);
    assert_eq!(report.pets_count, 3);
    assert_eq!(report.pets_written, 1);
    assert_eq!(report.applications_written, 0);

    let meta = persistence.recent_snapshots(1).await.unwrap();
    assert_eq!(meta.len(), 1);
    assert!(meta[0].record.incremental);
    assert_eq!(meta[0].record.pets_count, 3);
    assert_eq!(meta[0].record.node, "north");

    cluster.shutdown().await;
}

#[tokio::test]
async fn restore_round_trip() {
    let mut cluster = TestCluster::new();
    let service = cluster.start("north").await;

    let dog = service.add_pet(rex()).await.unwrap();
    service.add_pet(pet_form("Milo", "Cat")).await.unwrap();
    let first = service
        .submit_application(&dog.id, application_form("Jo"))
        .await
        .unwrap();
    service
        .submit_application(&dog.id, application_form("Sam"))
        .await
        .unwrap();
    service.approve_adoption(&dog.id, &first.id).await.unwrap();

    let pets_before = service.list_pets(PetFilter::All).await;
    let apps_before = service.get_applications(&dog.id).await;
    let stats_before = service.get_stats().await;

    // Shutdown takes the final forced snapshot
    cluster.stop("north").await;

    let restored = cluster.start("north").await;
    let summary = cluster.node("north").restored().cloned().unwrap();
    assert_eq!(summary.pets, 2);
    assert_eq!(summary.applications, 2);
    assert_eq!(summary.counters, 2);
    assert_eq!(summary.skipped, 0);

    assert_eq!(restored.list_pets(PetFilter::All).await, pets_before);
    assert_eq!(restored.get_applications(&dog.id).await, apps_before);
    let stats = restored.get_stats().await;
    assert_eq!(stats.total_adoptions, stats_before.total_adoptions);
    assert_eq!(stats.total_applications, stats_before.total_applications);

    // Restored state is already persisted
    let persistence = cluster.node("north").persistence().unwrap();
    assert_eq!(persistence.save_snapshot(false).await.unwrap(), SnapshotOutcome::NoChanges);
    assert!(persistence.validate_integrity().await.unwrap().passed());

    cluster.shutdown().await;
}

#[tokio::test]
async fn restore_from_missing_store_is_empty() {
    let mut cluster = TestCluster::new();
    let service = cluster.start("fresh").await;

    let summary = cluster.node("fresh").restored().cloned().unwrap();
    assert_eq!(summary.total(), 0);
    assert_eq!(summary.skipped, 0);
    assert!(service.list_pets(PetFilter::All).await.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn restore_skips_undecodable_rows() {
    let mut cluster = TestCluster::new();
    let service = cluster.start("north").await;
    let pet = service.add_pet(rex()).await.unwrap();
    cluster.stop("north").await;

    let config = SnapshotConfig {
        sqlite_path: cluster.db_path("north"),
        wal_mode: false,
        ..SnapshotConfig::default()
    };
    let store = SnapshotStore::open(&config).await.unwrap();
    store
        .write_snapshot(&SnapshotWrite {
            pets: vec![RecordRow {
                id: "corrupt".into(),
                data: "{\"name\": 12".into(),
                checksum: "x".into(),
                written_at: None,
            }],
            ..Default::default()
        })
        .await
        .unwrap();
    store.close().await;

    let restored = cluster.start("north").await;
    let summary = cluster.node("north").restored().cloned().unwrap();
    assert_eq!(summary.pets, 1);
    assert_eq!(summary.skipped, 1);
    assert!(restored.get_pet(&pet.id).await.is_some());
    assert!(restored.get_pet("corrupt").await.is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn integrity_flags_unsaved_changes() {
    let mut cluster = TestCluster::new();
    let service = cluster.start("north").await;
    let persistence = cluster.node("north").persistence().unwrap();

    let pet = service.add_pet(rex()).await.unwrap();
    persistence.save_snapshot(false).await.unwrap();
    let report = persistence.validate_integrity().await.unwrap();
    assert!(report.passed(), "{:?}", report);
    assert_eq!(report.collection("pets").unwrap().items, 1);

    let other = service.add_pet(pet_form("Milo", "Cat")).await.unwrap();
    service
        .update_pet(&pet.id, PetPatch { age: Some(7), ..Default::default() })
        .await
        .unwrap();

    let report = persistence.validate_integrity().await.unwrap();
    assert!(!report.passed());
    let pets = report.collection("pets").unwrap();
    let mut expected = vec![pet.id.clone(), other.id.clone()];
    expected.sort();
    assert_eq!(pets.mismatched, expected);
    assert!(pets.missing.is_empty());
    assert!(report.collection("applications").unwrap().passed());

    // Validation does not persist anything
    assert!(persistence.save_snapshot(false).await.unwrap().is_saved());
    assert!(persistence.validate_integrity().await.unwrap().passed());

    cluster.shutdown().await;
}

#[tokio::test]
async fn snapshot_meta_is_pruned() {
    let mut cluster = TestCluster::new();
    let mut config = cluster.config("north");
    config.snapshot.retain_meta = 3;
    let service = cluster.start_with(config).await;
    let persistence = cluster.node("north").persistence().unwrap();

    service.add_pet(rex()).await.unwrap();
    for _ in 0..5 {
        persistence.save_snapshot(true).await.unwrap();
    }

    let meta = persistence.recent_snapshots(10).await.unwrap();
    assert_eq!(meta.len(), 3);
    assert!(meta.windows(2).all(|w| w[0].id > w[1].id));

    cluster.shutdown().await;
}

#[tokio::test]
async fn restore_keeps_adoption_made_while_cut_off() {
    let mut cluster = TestCluster::new();
    let north = cluster.start("north").await;
    let south = cluster.start("south").await;

    let pet = north.add_pet(rex()).await.unwrap();
    let app = north
        .submit_application(&pet.id, application_form("Jo"))
        .await
        .unwrap();
    assert!(eventually(|| async { south.get_application(&app.id).await.is_some() }).await);

    // Adopt while south cannot hear about it, then restart north
    cluster.hub.sever("north", "south");
    north.approve_adoption(&pet.id, &app.id).await.unwrap();
    cluster.stop("north").await;
    assert_eq!(
        south.get_pet(&pet.id).await.unwrap().status,
        PetStatus::Available
    );

    cluster.hub.restore_link("north", "south");
    let north = cluster.start("north").await;

    assert!(
        eventually(|| async {
            let here = north.get_pet(&pet.id).await.map(|p| p.status);
            let there = south.get_pet(&pet.id).await.map(|p| p.status);
            here == Some(PetStatus::Adopted) && there == Some(PetStatus::Adopted)
        })
        .await,
        "the restored adoption should survive the stale peer copy"
    );
    for service in [&north, &south] {
        let approved = service.get_application(&app.id).await.unwrap();
        assert_eq!(approved.status, ApplicationStatus::Approved);
    }
    assert!(eventually(|| async { south.get_stats().await.total_adoptions == 1 }).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn failed_snapshot_rolls_back_and_retries() {
    let mut cluster = TestCluster::new();
    let service = cluster.start("north").await;
    let persistence = cluster.node("north").persistence().unwrap();

    let first = service.add_pet(rex()).await.unwrap();
    assert!(persistence.save_snapshot(false).await.unwrap().is_saved());

    service.add_pet(pet_form("Milo", "Cat")).await.unwrap();
    service
        .update_pet(&first.id, PetPatch { age: Some(9), ..Default::default() })
        .await
        .unwrap();

    // Make the metadata insert, the last statement of a pass, fail
    let pool = SqlitePool::connect(&format!("sqlite://{}", cluster.db_path("north")))
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER fail_meta BEFORE INSERT ON snapshot_meta \
         BEGIN SELECT RAISE(ABORT, 'boom'); END",
    )
    .execute(&pool)
    .await
    .unwrap();

    let err = persistence.save_snapshot(false).await.unwrap_err();
    assert!(matches!(err, MeshError::Store(_)), "{:?}", err);

    let (pets,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pets")
        .fetch_one(&pool)
        .await
        .unwrap();
    let (meta,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM snapshot_meta")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(pets, 1, "the new pet row must be rolled back");
    assert_eq!(meta, 1);
    assert!(!persistence.validate_integrity().await.unwrap().passed());

    sqlx::query("DROP TRIGGER fail_meta")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let outcome = persistence.save_snapshot(false).await.unwrap();
    let SnapshotOutcome::Saved(report) = outcome else {
        panic!("expected a saved snapshot, got {:?}", outcome);
    };
    assert_eq!(report.pets_written, 2);
    assert!(persistence.validate_integrity().await.unwrap().passed());

    cluster.shutdown().await;
}
