// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Shelter Mesh
//!
//! State replication core for a network of adoption shelters. Every shelter
//! runs a node holding a full replica of every pet and application; nodes
//! exchange deltas with their neighbors and converge by last-writer-wins.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              ShelterNode                                  │
//! │                                                                           │
//! │  ┌────────────────┐   put/get   ┌──────────────────────────────────────┐  │
//! │  │ ShelterService │────────────►│ Replica actors (pets, applications,  │  │
//! │  │ (domain rules) │             │ counters): LWW map + delta outboxes  │  │
//! │  └────────────────┘             └──────────────────────────────────────┘  │
//! │         │ events                   ▲ neighbors          │ deltas          │
//! │         ▼                          │                    ▼                 │
//! │  ┌────────────────┐     ┌──────────────────┐   ┌──────────────────┐       │
//! │  │   ChangeBus    │◄────│ TopologyManager  │   │ ClusterTransport │       │
//! │  │ + HashWatcher  │     │ (membership)     │◄──│ (MeshHub)        │       │
//! │  └────────────────┘     └──────────────────┘   └──────────────────┘       │
//! │                                                                           │
//! │  ┌─────────────────────────────────────────────────────────────────────┐  │
//! │  │ PersistenceManager: periodic SQLite snapshots, restore on start     │  │
//! │  └─────────────────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shelter_mesh::{MeshHub, NodeConfig, ShelterNode, PetForm};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> shelter_mesh::Result<()> {
//!     let hub = MeshHub::new();
//!     let config = NodeConfig::for_testing("shelter-north", "data/north.db");
//!     let mut node = ShelterNode::new(config, Arc::new(hub.clone()))?;
//!     node.start().await?;
//!
//!     if let Some(service) = node.service() {
//!         let pet = service
//!             .add_pet(PetForm {
//!                 name: "Rex".into(),
//!                 species: "Dog".into(),
//!                 breed: "Labrador".into(),
//!                 age: 3,
//!                 gender: "Male".into(),
//!                 ..Default::default()
//!             })
//!             .await?;
//!         println!("added {}", pet.id);
//!     }
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod domain;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod notify;
pub mod persistence;
pub mod replica;
pub mod topology;
pub mod transport;

// Re-exports for convenience
pub use config::{
    ClusterConfig, GossipConfig, NodeConfig, NotifyConfig, ShelterConfig, SnapshotConfig,
};
pub use domain::{
    AdoptionApplication, ApplicationForm, ApplicationStatus, Pet, PetFilter, PetForm, PetPatch,
    PetStatus, ShelterService, ShelterStats, Species,
};
pub use error::{MeshError, Result, ValidationErrors};
pub use identity::ShelterIdentity;
pub use node::{NodeHealth, NodeState, ShelterNode};
pub use notify::{ChangeBus, ChangeEvent, HashWatcher};
pub use persistence::{IntegrityReport, PersistenceHandle, SnapshotOutcome, SnapshotReport};
pub use topology::{PeerState, TopologyHandle};
pub use transport::{ClusterTransport, DeltaEnvelope, MembershipEvent, MeshHub, NoOpTransport};
