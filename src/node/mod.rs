// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shelter node: wiring and lifecycle.
//!
//! A node owns one actor per concern:
//! - three replica actors (`pets`, `applications`, `counters`)
//! - the persistence actor, restored before anything replicates
//! - the topology manager, driving replica neighbor sets
//! - the hash watcher, turning remote changes into `Sync` events
//!
//! All of them share one shutdown signal. [`ShelterNode::shutdown`] takes a
//! forced final snapshot before raising it, then waits for every task.

mod types;

pub use types::{NodeHealth, NodeState};

use crate::config::NodeConfig;
use crate::domain::{AdoptionApplication, Pet, ShelterService};
use crate::error::{MeshError, Result};
use crate::identity::ShelterIdentity;
use crate::metrics;
use crate::notify::{ChangeBus, HashWatcher};
use crate::persistence::{PersistenceHandle, PersistenceManager, RestoreSummary, SnapshotStore};
use crate::replica::{
    spawn_replica, ReplicaControl, ReplicaHandle, ReplicaOptions, ReplicaValue, APPLICATIONS,
    COUNTERS, PETS,
};
use crate::topology::{TopologyHandle, TopologyManager};
use crate::transport::ClusterTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Handles that exist only while the node is running.
struct Running {
    service: Arc<ShelterService>,
    topology: TopologyHandle,
    persistence: PersistenceHandle,
    pets: ReplicaHandle<Pet>,
    applications: ReplicaHandle<AdoptionApplication>,
    restored: RestoreSummary,
}

/// One shelter's replication core.
pub struct ShelterNode {
    config: NodeConfig,
    identity: Arc<ShelterIdentity>,
    transport: Arc<dyn ClusterTransport>,
    bus: ChangeBus,
    state_tx: watch::Sender<NodeState>,
    state_rx: watch::Receiver<NodeState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    running: Option<Running>,
    tasks: Vec<JoinHandle<()>>,
}

impl ShelterNode {
    /// Build a node. Nothing is spawned until [`start`](Self::start).
    pub fn new(config: NodeConfig, transport: Arc<dyn ClusterTransport>) -> Result<Self> {
        config.validate()?;
        let identity = Arc::new(ShelterIdentity::from_config(&config.shelter));
        let bus = ChangeBus::new(config.notify.channel_capacity);
        let (state_tx, state_rx) = watch::channel(NodeState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            identity,
            transport,
            bus,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            running: None,
            tasks: Vec::new(),
        })
    }

    fn set_state(&self, state: NodeState) {
        let _ = self.state_tx.send(state);
        metrics::set_node_state(&state.to_string());
    }

    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == NodeState::Running
    }

    pub fn node_id(&self) -> &str {
        self.identity.node_id()
    }

    pub fn identity(&self) -> &Arc<ShelterIdentity> {
        &self.identity
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Domain operations. `None` until started.
    pub fn service(&self) -> Option<Arc<ShelterService>> {
        self.running.as_ref().map(|r| Arc::clone(&r.service))
    }

    pub fn topology(&self) -> Option<TopologyHandle> {
        self.running.as_ref().map(|r| r.topology.clone())
    }

    pub fn persistence(&self) -> Option<PersistenceHandle> {
        self.running.as_ref().map(|r| r.persistence.clone())
    }

    /// What startup restored from the snapshot store.
    pub fn restored(&self) -> Option<&RestoreSummary> {
        self.running.as_ref().map(|r| &r.restored)
    }

    pub async fn health(&self) -> NodeHealth {
        let state = self.state();
        match &self.running {
            Some(running) => NodeHealth {
                state,
                connected_peers: running.topology.connected_count().await,
                pets: running.pets.len().await,
                applications: running.applications.len().await,
            },
            None => NodeHealth {
                state,
                connected_peers: 0,
                pets: 0,
                applications: 0,
            },
        }
    }

    fn spawn_collection<V: ReplicaValue>(&mut self, collection: &str) -> ReplicaHandle<V> {
        let options = ReplicaOptions {
            gossip_interval: self.config.gossip.sync_interval_duration(),
            command_capacity: self.config.gossip.command_capacity,
        };
        let inbox = self.transport.attach_inbox(self.identity.node_id(), collection);
        let (handle, task) = spawn_replica::<V>(
            collection,
            self.identity.node_id(),
            Arc::clone(&self.transport),
            inbox,
            options,
            self.shutdown_rx.clone(),
        );
        debug!(collection, "Spawned replica");
        self.tasks.push(task);
        handle
    }

    /// Start the node.
    ///
    /// 1. Opens the snapshot store
    /// 2. Spawns the replicas and restores them from the store
    /// 3. Spawns persistence, joins the cluster, spawns topology
    /// 4. Spawns the hash watcher
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != NodeState::Created {
            return Err(MeshError::Internal(format!(
                "cannot start node in state {}",
                self.state()
            )));
        }

        let node_id = self.identity.node_id().to_string();
        info!(
            node_id = %node_id,
            shelter_id = %self.identity.shelter_id(),
            seed_peers = self.config.cluster.seed_peers.len(),
            "Starting shelter node"
        );
        self.set_state(NodeState::Starting);

        let store = match SnapshotStore::open(&self.config.snapshot).await {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %e, "Snapshot store failed to open");
                self.set_state(NodeState::Stopped);
                return Err(e);
            }
        };

        let pets = self.spawn_collection::<Pet>(PETS);
        let applications = self.spawn_collection::<AdoptionApplication>(APPLICATIONS);
        let counters = self.spawn_collection::<i64>(COUNTERS);

        let mut manager = PersistenceManager::new(
            node_id.clone(),
            store,
            pets.clone(),
            applications.clone(),
            counters.clone(),
        );
        let restored = manager.restore().await;
        let (persistence, task) = manager.spawn(
            self.config.snapshot.interval_duration(),
            self.config.snapshot.enabled,
            self.shutdown_rx.clone(),
        );
        self.tasks.push(task);

        let controls: Vec<Arc<dyn ReplicaControl>> = vec![
            Arc::new(pets.clone()),
            Arc::new(applications.clone()),
            Arc::new(counters.clone()),
        ];

        // Watch before joining so no membership event is missed
        let events = self.transport.watch_membership(&node_id);
        self.transport.join(&node_id);
        let (topology, task) = TopologyManager::new(
            node_id.clone(),
            Arc::clone(&self.transport),
            controls.clone(),
            self.bus.clone(),
        )
        .with_seed_peers(&self.config.cluster.seed_peers)
        .spawn(
            events,
            self.config.cluster.safety_net_interval_duration(),
            self.shutdown_rx.clone(),
        );
        self.tasks.push(task);

        let watcher = HashWatcher::new(controls, self.bus.clone());
        self.tasks.push(watcher.spawn(
            self.config.notify.poll_interval_duration(),
            self.shutdown_rx.clone(),
        ));

        let service = Arc::new(ShelterService::new(
            Arc::clone(&self.identity),
            pets.clone(),
            applications.clone(),
            counters,
            topology.clone(),
            self.bus.clone(),
        ));

        self.running = Some(Running {
            service,
            topology,
            persistence,
            pets,
            applications,
            restored,
        });

        self.set_state(NodeState::Running);
        info!(node_id = %node_id, tasks = self.tasks.len(), "Shelter node running");
        Ok(())
    }

    /// Stop the node gracefully.
    ///
    /// 1. Takes a forced snapshot
    /// 2. Leaves the cluster
    /// 3. Signals every task and waits for it, up to a timeout each
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), NodeState::Stopped | NodeState::ShuttingDown) {
            return;
        }
        info!(node_id = %self.identity.node_id(), "Shutting down shelter node");
        self.set_state(NodeState::ShuttingDown);

        if let Some(running) = &self.running {
            match running.persistence.save_snapshot(true).await {
                Ok(outcome) => debug!(saved = outcome.is_saved(), "Final snapshot complete"),
                Err(e) => warn!(error = %e, "Final snapshot failed"),
            }
            self.transport.leave(self.identity.node_id());
        }

        let _ = self.shutdown_tx.send(true);

        let tasks = std::mem::take(&mut self.tasks);
        let task_count = tasks.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }
        for (i, task) in tasks.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        metrics::set_connected_peers(0);
        self.running = None;
        self.set_state(NodeState::Stopped);
        info!(node_id = %self.identity.node_id(), "Shelter node stopped");
    }
}
