// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Membership and neighbor topology.
//!
//! Tracks which peers are reachable and keeps every replica's neighbor set
//! in line with it. Membership changes arrive as [`MembershipEvent`]s from
//! the transport; a periodic safety-net pass reconciles against
//! [`ClusterTransport::reachable_peers`] in case events were missed or
//! arrived out of order.
//!
//! # Peer Lifecycle
//!
//! ```text
//! Unknown ──NodeUp──→ Connected ──NodeDown──→ Disconnected
//!                         ↑                        │
//!                         └────────NodeUp──────────┘
//! ```
//!
//! A peer reaching `Connected` triggers a full resync of every replica
//! towards it. Leaving needs no cleanup: the replica just stops gossiping
//! to that peer.
//!
//! # Partition Simulation
//!
//! [`TopologyHandle::simulate_partition`] cuts this node off through the
//! transport, clears all neighbor sets and arms a one-shot timer that
//! reconnects. Local writes keep succeeding in the meantime; they reach the
//! rest of the cluster once the timer fires. There is no cancel API.

use crate::metrics;
use crate::notify::{ChangeBus, ChangeEvent};
use crate::replica::ReplicaControl;
use crate::transport::{ClusterTransport, MembershipEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

/// State of a peer as seen by this node.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Never seen.
    Unknown,
    /// Reachable; replicas gossip to it.
    Connected,
    /// Was connected, currently unreachable.
    Disconnected,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Unknown => write!(f, "Unknown"),
            PeerState::Connected => write!(f, "Connected"),
            PeerState::Disconnected => write!(f, "Disconnected"),
        }
    }
}

enum Command {
    Peers {
        reply: oneshot::Sender<Vec<String>>,
    },
    PeerStates {
        reply: oneshot::Sender<BTreeMap<String, PeerState>>,
    },
    SimulatePartition {
        duration: Duration,
        reply: oneshot::Sender<()>,
    },
    /// Sent by the partition timer.
    Heal { generation: u64 },
}

/// Cloneable handle to the topology manager.
#[derive(Clone)]
pub struct TopologyHandle {
    tx: mpsc::Sender<Command>,
}

impl TopologyHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Currently connected peers, sorted.
    pub async fn peers(&self) -> Vec<String> {
        self.request(|reply| Command::Peers { reply })
            .await
            .unwrap_or_default()
    }

    /// Every peer ever seen and its state.
    pub async fn peer_states(&self) -> BTreeMap<String, PeerState> {
        self.request(|reply| Command::PeerStates { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn peer_state(&self, peer_id: &str) -> PeerState {
        self.peer_states()
            .await
            .get(peer_id)
            .copied()
            .unwrap_or(PeerState::Unknown)
    }

    pub async fn connected_count(&self) -> usize {
        self.peers().await.len()
    }

    /// Disconnect from every peer for `duration`, then reconnect.
    ///
    /// Returns once the partition is in effect.
    pub async fn simulate_partition(&self, duration: Duration) {
        self.request(|reply| Command::SimulatePartition { duration, reply })
            .await;
    }
}

/// Owns the peer table. Consumed by [`spawn`](Self::spawn).
pub struct TopologyManager {
    node_id: String,
    transport: Arc<dyn ClusterTransport>,
    replicas: Vec<Arc<dyn ReplicaControl>>,
    bus: ChangeBus,
    peers: BTreeMap<String, PeerState>,
    partitioned: bool,
    partition_generation: u64,
}

impl TopologyManager {
    pub fn new(
        node_id: impl Into<String>,
        transport: Arc<dyn ClusterTransport>,
        replicas: Vec<Arc<dyn ReplicaControl>>,
        bus: ChangeBus,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
            replicas,
            bus,
            peers: BTreeMap::new(),
            partitioned: false,
            partition_generation: 0,
        }
    }

    /// Track `seeds` as [`PeerState::Unknown`] until the transport reports
    /// them.
    pub fn with_seed_peers(mut self, seeds: &[String]) -> Self {
        for seed in seeds {
            if *seed != self.node_id {
                self.peers.entry(seed.clone()).or_insert(PeerState::Unknown);
            }
        }
        self
    }

    pub fn spawn(
        self,
        events: mpsc::UnboundedReceiver<MembershipEvent>,
        safety_net_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (TopologyHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let weak = tx.downgrade();
        let span = info_span!("topology", node_id = %self.node_id);
        let task = tokio::spawn(
            self.run(rx, weak, events, safety_net_interval, shutdown_rx)
                .instrument(span),
        );
        (TopologyHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        self_tx: mpsc::WeakSender<Command>,
        mut events: mpsc::UnboundedReceiver<MembershipEvent>,
        safety_net_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        self.reconcile("startup").await;

        let mut timer = tokio::time::interval(safety_net_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately; startup already reconciled
        timer.tick().await;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd, &self_tx).await,
                    None => break,
                },
                Some(event) = events.recv() => self.on_membership(event).await,
                _ = timer.tick() => {
                    if !self.partitioned {
                        self.reconcile("safety_net").await;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Topology manager stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, cmd: Command, self_tx: &mpsc::WeakSender<Command>) {
        match cmd {
            Command::Peers { reply } => {
                let _ = reply.send(self.connected());
            }
            Command::PeerStates { reply } => {
                let _ = reply.send(self.peers.clone());
            }
            Command::SimulatePartition { duration, reply } => {
                self.start_partition(duration, self_tx.clone()).await;
                let _ = reply.send(());
            }
            Command::Heal { generation } => {
                if generation == self.partition_generation && self.partitioned {
                    self.heal().await;
                }
            }
        }
    }

    fn connected(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, state)| **state == PeerState::Connected)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    async fn apply_neighbors(&self) {
        let connected = self.connected();
        for replica in &self.replicas {
            replica.set_neighbors(connected.clone()).await;
        }
        metrics::set_connected_peers(connected.len());
    }

    async fn resync_all(&self) {
        for replica in &self.replicas {
            replica.resync().await;
        }
    }

    fn publish_change(&self) {
        self.bus.publish(ChangeEvent::ClusterChange {
            peers: self.connected(),
        });
    }

    async fn on_membership(&mut self, event: MembershipEvent) {
        if self.partitioned {
            debug!(event = ?event, "Ignoring membership event during partition");
            return;
        }
        match event {
            MembershipEvent::NodeUp(peer) if peer != self.node_id => {
                let previous = self.peers.insert(peer.clone(), PeerState::Connected);
                if previous == Some(PeerState::Connected) {
                    return;
                }
                info!(peer_id = %peer, "Peer connected");
                metrics::record_membership_event("up");
                self.apply_neighbors().await;
                self.resync_all().await;
                self.publish_change();
            }
            MembershipEvent::NodeDown(peer) if peer != self.node_id => {
                let previous = self.peers.insert(peer.clone(), PeerState::Disconnected);
                if previous != Some(PeerState::Connected) {
                    return;
                }
                info!(peer_id = %peer, "Peer disconnected");
                metrics::record_membership_event("down");
                self.apply_neighbors().await;
                self.publish_change();
            }
            _ => {}
        }
    }

    /// Align the peer table with what the transport reports reachable and
    /// push the result to every replica.
    async fn reconcile(&mut self, reason: &str) {
        let reachable: BTreeSet<String> = self
            .transport
            .reachable_peers(&self.node_id)
            .into_iter()
            .filter(|p| *p != self.node_id)
            .collect();

        let mut joined = Vec::new();
        for peer in &reachable {
            if self.peers.get(peer) != Some(&PeerState::Connected) {
                self.peers.insert(peer.clone(), PeerState::Connected);
                joined.push(peer.clone());
            }
        }
        let mut left = Vec::new();
        for (peer, state) in self.peers.iter_mut() {
            if *state == PeerState::Connected && !reachable.contains(peer) {
                *state = PeerState::Disconnected;
                left.push(peer.clone());
            }
        }

        self.apply_neighbors().await;

        if joined.is_empty() && left.is_empty() {
            return;
        }
        info!(reason, joined = ?joined, left = ?left, "Topology reconciled");
        metrics::record_membership_event("reconcile");
        if !joined.is_empty() {
            self.resync_all().await;
        }
        self.publish_change();
    }

    async fn start_partition(&mut self, duration: Duration, self_tx: mpsc::WeakSender<Command>) {
        self.partition_generation += 1;
        let generation = self.partition_generation;
        warn!(duration_ms = duration.as_millis() as u64, "Simulating network partition");
        metrics::record_partition_simulated(duration);

        self.partitioned = true;
        self.transport.disconnect(&self.node_id);
        for state in self.peers.values_mut() {
            if *state == PeerState::Connected {
                *state = PeerState::Disconnected;
            }
        }
        for replica in &self.replicas {
            replica.set_neighbors(Vec::new()).await;
        }
        metrics::set_connected_peers(0);
        self.publish_change();

        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(Command::Heal { generation }).await;
            }
        });
    }

    async fn heal(&mut self) {
        info!("Partition over, reconnecting");
        self.partitioned = false;
        self.transport.reconnect(&self.node_id);
        self.reconcile("partition_healed").await;
    }
}
