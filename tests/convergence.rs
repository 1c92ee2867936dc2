// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Convergence tests across in-process shelter clusters.
//!
//! # Test Organization
//! - `two_node_*` - basic propagation between direct peers
//! - `line_*` - multi-hop forwarding when nodes are not fully meshed
//! - `partition_*` - writes during simulated partitions and the heal
//! - `membership_*` - joins, leaves and the change bus

mod common;

use common::{application_form, eventually, pet_form, rex, TestCluster};
use shelter_mesh::{
    ApplicationStatus, ChangeEvent, PeerState, PetFilter, PetPatch, PetStatus,
};
use std::time::Duration;

// =============================================================================
// Two-node propagation
// =============================================================================

#[tokio::test]
async fn two_node_pet_propagates() {
    let mut cluster = TestCluster::new();
    let north = cluster.start("north").await;
    let south = cluster.start("south").await;

    let pet = north.add_pet(rex()).await.unwrap();
    assert!(eventually(|| async { south.get_pet(&pet.id).await.is_some() }).await);

    let remote = south.get_pet(&pet.id).await.unwrap();
    assert_eq!(remote, pet);
    assert_eq!(remote.shelter_id, "north");

    cluster.shutdown().await;
}

#[tokio::test]
async fn two_node_existing_state_reaches_late_joiner() {
    let mut cluster = TestCluster::new();
    let north = cluster.start("north").await;
    let first = north.add_pet(pet_form("Milo", "Cat")).await.unwrap();
    let second = north.add_pet(pet_form("Bun", "Rabbit")).await.unwrap();

    let south = cluster.start("south").await;
    assert!(
        eventually(|| async { south.list_pets(PetFilter::All).await.len() == 2 }).await,
        "late joiner should receive full state"
    );
    assert!(south.get_pet(&first.id).await.is_some());
    assert!(south.get_pet(&second.id).await.is_some());

    cluster.shutdown().await;
}

#[tokio::test]
async fn two_node_last_update_wins() {
    let mut cluster = TestCluster::new();
    let north = cluster.start("north").await;
    let south = cluster.start("south").await;

    let pet = north.add_pet(rex()).await.unwrap();
    assert!(eventually(|| async { south.get_pet(&pet.id).await.is_some() }).await);

    north
        .update_pet(&pet.id, PetPatch { age: Some(4), ..Default::default() })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    south
        .update_pet(&pet.id, PetPatch { age: Some(5), ..Default::default() })
        .await
        .unwrap();

    assert!(
        eventually(|| async {
            let a = north.get_pet(&pet.id).await.map(|p| p.age);
            let b = south.get_pet(&pet.id).await.map(|p| p.age);
            a == Some(5) && b == Some(5)
        })
        .await
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn two_node_counters_follow_adoption() {
    let mut cluster = TestCluster::new();
    let north = cluster.start("north").await;
    let south = cluster.start("south").await;

    let pet = north.add_pet(rex()).await.unwrap();
    let app = north
        .submit_application(&pet.id, application_form("Jo"))
        .await
        .unwrap();
    north.approve_adoption(&pet.id, &app.id).await.unwrap();

    assert!(
        eventually(|| async {
            let stats = south.get_stats().await;
            stats.total_adoptions == 1 && stats.total_applications == 1 && stats.adopted == 1
        })
        .await
    );

    cluster.shutdown().await;
}

// =============================================================================
// Multi-hop
// =============================================================================

#[tokio::test]
async fn line_write_reaches_far_end() {
    let mut cluster = TestCluster::new();
    let a = cluster.start("a").await;
    let _b = cluster.start("b").await;
    cluster.hub.sever("a", "c");
    let c = cluster.start("c").await;
    assert!(!cluster.hub.is_linked("a", "c"));

    let pet = a.add_pet(rex()).await.unwrap();
    assert!(
        eventually(|| async { c.get_pet(&pet.id).await.is_some() }).await,
        "write at a should reach c through b"
    );

    let app = c
        .submit_application(&pet.id, application_form("Sam"))
        .await
        .unwrap();
    assert!(eventually(|| async { a.get_application(&app.id).await.is_some() }).await);

    cluster.shutdown().await;
}

// =============================================================================
// Partitions
// =============================================================================

#[tokio::test]
async fn partition_writes_merge_after_heal() {
    let mut cluster = TestCluster::new();
    let north = cluster.start("north").await;
    let south = cluster.start("south").await;
    assert!(eventually(|| async { north.get_stats().await.connected_peers == 1 }).await);

    let topology = cluster.node("north").topology().unwrap();
    topology.simulate_partition(Duration::from_millis(300)).await;
    assert_eq!(topology.peer_state("south").await, PeerState::Disconnected);

    let from_north = north.add_pet(pet_form("Milo", "Cat")).await.unwrap();
    let from_south = south.add_pet(pet_form("Bun", "Rabbit")).await.unwrap();
    assert!(south.get_pet(&from_north.id).await.is_none());

    assert!(
        eventually(|| async {
            north.get_pet(&from_south.id).await.is_some()
                && south.get_pet(&from_north.id).await.is_some()
        })
        .await,
        "both sides should hold both pets after the heal"
    );
    assert_eq!(topology.peer_state("south").await, PeerState::Connected);

    cluster.shutdown().await;
}

#[tokio::test]
async fn partition_competing_approvals_settle() {
    let mut cluster = TestCluster::new();
    let north = cluster.start("north").await;
    let south = cluster.start("south").await;

    let pet = north.add_pet(rex()).await.unwrap();
    let app_n = north
        .submit_application(&pet.id, application_form("Jo"))
        .await
        .unwrap();
    let app_s = north
        .submit_application(&pet.id, application_form("Sam"))
        .await
        .unwrap();
    assert!(eventually(|| async { south.get_applications(&pet.id).await.len() == 2 }).await);

    cluster
        .node("north")
        .topology()
        .unwrap()
        .simulate_partition(Duration::from_millis(300))
        .await;

    // Both sides approve a different applicant while cut off
    north.approve_adoption(&pet.id, &app_n.id).await.unwrap();
    south.approve_adoption(&pet.id, &app_s.id).await.unwrap();

    assert!(
        eventually(|| async {
            let a = north.get_pet(&pet.id).await;
            let b = south.get_pet(&pet.id).await;
            let apps_a = north.get_applications(&pet.id).await;
            let apps_b = south.get_applications(&pet.id).await;
            a.is_some() && a == b && apps_a == apps_b
        })
        .await,
        "replicas should agree after the heal"
    );

    let final_pet = north.get_pet(&pet.id).await.unwrap();
    assert_eq!(final_pet.status, PetStatus::Adopted);
    for app in north.get_applications(&pet.id).await {
        assert_ne!(app.status, ApplicationStatus::Pending);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn partition_restart_comes_back_connected() {
    let mut cluster = TestCluster::new();
    let north = cluster.start("north").await;
    let south = cluster.start("south").await;
    assert!(eventually(|| async { north.get_stats().await.connected_peers == 1 }).await);

    // The heal timer dies with the node
    cluster
        .node("north")
        .topology()
        .unwrap()
        .simulate_partition(Duration::from_secs(60))
        .await;
    cluster.stop("north").await;

    let north = cluster.start("north").await;
    assert!(
        eventually(|| async { north.get_stats().await.connected_peers == 1 }).await,
        "a restarted node should not inherit the old isolation"
    );
    let pet = north.add_pet(rex()).await.unwrap();
    assert!(eventually(|| async { south.get_pet(&pet.id).await.is_some() }).await);

    cluster.shutdown().await;
}

// =============================================================================
// Membership
// =============================================================================

#[tokio::test]
async fn membership_leave_updates_peers() {
    let mut cluster = TestCluster::new();
    let north = cluster.start("north").await;
    let _south = cluster.start("south").await;
    assert!(eventually(|| async { north.get_stats().await.connected_peers == 1 }).await);

    let mut events = cluster.node("north").bus().subscribe();
    cluster.stop("south").await;

    assert!(eventually(|| async { north.get_stats().await.connected_peers == 0 }).await);
    let topology = cluster.node("north").topology().unwrap();
    assert_eq!(topology.peer_state("south").await, PeerState::Disconnected);

    let mut saw_cluster_change = false;
    while let Ok(event) = events.try_recv() {
        if let ChangeEvent::ClusterChange { peers } = event {
            assert!(peers.is_empty());
            saw_cluster_change = true;
        }
    }
    assert!(saw_cluster_change);

    cluster.shutdown().await;
}

#[tokio::test]
async fn membership_remote_change_publishes_sync() {
    let mut cluster = TestCluster::new();
    let north = cluster.start("north").await;
    let _south = cluster.start("south").await;
    let mut events = cluster.node("south").bus().subscribe();

    north.add_pet(rex()).await.unwrap();

    let got_sync = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ChangeEvent::Sync { collection }) if collection == "pets" => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(got_sync, "remote write should surface as a sync event");

    cluster.shutdown().await;
}
