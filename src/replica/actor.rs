// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica actor and its handle.
//!
//! One actor per replicated collection. It owns the [`LwwMap`], the clock,
//! the neighbor set and one [`Outbox`] per neighbor, and processes commands
//! strictly one at a time.
//!
//! # Event Loop
//!
//! ```text
//!            ┌──────────────── select! ────────────────┐
//! commands ──┤ put / get / snapshot / set_neighbors ...│
//! inbox    ──┤ merge remote delta, forward changes     │
//! interval ──┤ flush outboxes to neighbors             │
//! shutdown ──┤ final flush, exit                       │
//!            └─────────────────────────────────────────┘
//! ```
//!
//! Replication never fails the caller: a failed send re-stages its entries
//! for the next tick, an undecodable delta is logged and dropped.

use super::clock::HybridClock;
use super::lww::{DeltaEntries, LwwMap};
use super::outbox::Outbox;
use crate::metrics;
use crate::transport::{BoxFuture, ClusterTransport, DeltaEnvelope};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info_span, trace, warn, Instrument};

/// Values a replica can hold.
pub trait ReplicaValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> ReplicaValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Tuning for one replica actor.
#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub gossip_interval: Duration,
    pub command_capacity: usize,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(2),
            command_capacity: 1024,
        }
    }
}

enum Command<V> {
    Put {
        key: String,
        value: V,
        reply: oneshot::Sender<()>,
    },
    Seed {
        entries: DeltaEntries<V>,
        reply: oneshot::Sender<usize>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<V>>,
    },
    Snapshot {
        reply: oneshot::Sender<BTreeMap<String, V>>,
    },
    Entries {
        reply: oneshot::Sender<DeltaEntries<V>>,
    },
    SetNeighbors {
        peers: Vec<String>,
        reply: oneshot::Sender<()>,
    },
    Neighbors {
        reply: oneshot::Sender<Vec<String>>,
    },
    Resync {
        reply: oneshot::Sender<()>,
    },
    ContentHash {
        reply: oneshot::Sender<String>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

/// Uniform control surface over replicas of any value type.
///
/// Used by the topology manager and the hash watcher, which drive every
/// collection the same way.
pub trait ReplicaControl: Send + Sync {
    fn collection(&self) -> &str;
    fn set_neighbors(&self, peers: Vec<String>) -> BoxFuture<'_, ()>;
    fn resync(&self) -> BoxFuture<'_, ()>;
    fn content_hash(&self) -> BoxFuture<'_, String>;
}

/// Cheap, cloneable handle to a replica actor.
pub struct ReplicaHandle<V> {
    collection: Arc<str>,
    tx: mpsc::Sender<Command<V>>,
}

impl<V> Clone for ReplicaHandle<V> {
    fn clone(&self) -> Self {
        Self {
            collection: Arc::clone(&self.collection),
            tx: self.tx.clone(),
        }
    }
}

impl<V: ReplicaValue> ReplicaHandle<V> {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command<V>) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(make(reply)).await.is_err() {
            debug!(collection = %self.collection, "Replica actor closed");
            return None;
        }
        rx.await.ok()
    }

    /// Store `value` under `key` with a fresh local timestamp.
    pub async fn put(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        self.request(|reply| Command::Put { key, value, reply }).await;
    }

    /// Load entries from a snapshot, keeping their original write times.
    /// Each competes with what is held like a remote delta. Returns how
    /// many were applied.
    pub async fn seed(&self, entries: DeltaEntries<V>) -> usize {
        self.request(|reply| Command::Seed { entries, reply })
            .await
            .unwrap_or(0)
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let key = key.to_string();
        self.request(|reply| Command::Get { key, reply }).await.flatten()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, V> {
        self.request(|reply| Command::Snapshot { reply })
            .await
            .unwrap_or_default()
    }

    /// All entries with their write timestamps, in key order.
    pub async fn entries(&self) -> DeltaEntries<V> {
        self.request(|reply| Command::Entries { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn set_neighbors(&self, peers: Vec<String>) {
        self.request(|reply| Command::SetNeighbors { peers, reply }).await;
    }

    pub async fn neighbors(&self) -> Vec<String> {
        self.request(|reply| Command::Neighbors { reply })
            .await
            .unwrap_or_default()
    }

    /// Push the full state to every neighbor now.
    pub async fn resync(&self) {
        self.request(|reply| Command::Resync { reply }).await;
    }

    pub async fn content_hash(&self) -> String {
        self.request(|reply| Command::ContentHash { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.request(|reply| Command::Len { reply })
            .await
            .unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<V: ReplicaValue> ReplicaControl for ReplicaHandle<V> {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn set_neighbors(&self, peers: Vec<String>) -> BoxFuture<'_, ()> {
        Box::pin(ReplicaHandle::set_neighbors(self, peers))
    }

    fn resync(&self) -> BoxFuture<'_, ()> {
        Box::pin(ReplicaHandle::resync(self))
    }

    fn content_hash(&self) -> BoxFuture<'_, String> {
        Box::pin(ReplicaHandle::content_hash(self))
    }
}

/// Spawn a replica actor for `collection`.
///
/// `inbox` is the receiving end registered with the transport for this
/// node and collection.
pub fn spawn_replica<V: ReplicaValue>(
    collection: &str,
    node_id: &str,
    transport: Arc<dyn ClusterTransport>,
    inbox: mpsc::UnboundedReceiver<DeltaEnvelope>,
    options: ReplicaOptions,
    shutdown_rx: watch::Receiver<bool>,
) -> (ReplicaHandle<V>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(options.command_capacity.max(1));
    let actor = ReplicaActor {
        collection: collection.to_string(),
        node_id: node_id.to_string(),
        clock: HybridClock::new(node_id),
        map: LwwMap::new(),
        neighbors: BTreeSet::new(),
        outboxes: HashMap::new(),
        transport,
    };
    let span = info_span!("replica", collection = %collection, node_id = %node_id);
    let task = tokio::spawn(
        actor
            .run(rx, inbox, options.gossip_interval, shutdown_rx)
            .instrument(span),
    );
    let handle = ReplicaHandle {
        collection: Arc::from(collection),
        tx,
    };
    (handle, task)
}

struct ReplicaActor<V> {
    collection: String,
    node_id: String,
    clock: HybridClock,
    map: LwwMap<V>,
    neighbors: BTreeSet<String>,
    outboxes: HashMap<String, Outbox<V>>,
    transport: Arc<dyn ClusterTransport>,
}

impl<V: ReplicaValue> ReplicaActor<V> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command<V>>,
        mut inbox: mpsc::UnboundedReceiver<DeltaEnvelope>,
        gossip_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut timer = tokio::time::interval(gossip_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!("Replica actor started");
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                Some(envelope) = inbox.recv() => self.merge_envelope(envelope),
                _ = timer.tick() => self.flush().await,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        self.flush().await;
                        break;
                    }
                }
            }
        }
        debug!(entries = self.map.len(), "Replica actor stopped");
    }

    async fn handle(&mut self, cmd: Command<V>) {
        match cmd {
            Command::Put { key, value, reply } => {
                let ts = self.clock.tick();
                trace!(key = %key, ts = %ts, "Local write");
                let entry = self.map.insert_local(key.clone(), value, ts);
                for outbox in self.outboxes.values_mut() {
                    outbox.stage(key.clone(), entry.clone());
                }
                metrics::set_replica_size(&self.collection, self.map.len());
                let _ = reply.send(());
            }
            Command::Seed { entries, reply } => {
                let mut applied = 0;
                for (key, entry) in entries {
                    self.clock.observe(&entry.ts);
                    if self.map.merge_entry(key.clone(), entry.clone()) {
                        applied += 1;
                        for outbox in self.outboxes.values_mut() {
                            outbox.stage(key.clone(), entry.clone());
                        }
                    }
                }
                metrics::set_replica_size(&self.collection, self.map.len());
                let _ = reply.send(applied);
            }
            Command::Get { key, reply } => {
                let _ = reply.send(self.map.get(&key).cloned());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.map.snapshot());
            }
            Command::Entries { reply } => {
                let _ = reply.send(self.map.entries());
            }
            Command::SetNeighbors { peers, reply } => {
                self.set_neighbors(peers);
                let _ = reply.send(());
            }
            Command::Neighbors { reply } => {
                let _ = reply.send(self.neighbors.iter().cloned().collect());
            }
            Command::Resync { reply } => {
                let full = self.map.entries();
                for outbox in self.outboxes.values_mut() {
                    outbox.stage_all(full.clone());
                }
                self.flush().await;
                let _ = reply.send(());
            }
            Command::ContentHash { reply } => {
                let _ = reply.send(self.map.content_hash());
            }
            Command::Len { reply } => {
                let _ = reply.send(self.map.len());
            }
        }
    }

    fn set_neighbors(&mut self, peers: Vec<String>) {
        let next: BTreeSet<String> = peers
            .into_iter()
            .filter(|p| *p != self.node_id)
            .collect();

        if next.is_empty() {
            if !self.neighbors.is_empty() {
                debug!(dropped = self.neighbors.len(), "Neighbor set cleared");
            }
            self.neighbors.clear();
            self.outboxes.clear();
            metrics::set_neighbor_count(&self.collection, 0);
            return;
        }

        self.outboxes.retain(|peer, _| next.contains(peer));
        let added: Vec<String> = next.difference(&self.neighbors).cloned().collect();
        if !added.is_empty() {
            let full = self.map.entries();
            for peer in &added {
                let mut outbox = Outbox::new();
                outbox.stage_all(full.clone());
                self.outboxes.insert(peer.clone(), outbox);
            }
            debug!(added = ?added, total = next.len(), "Neighbors added");
        }
        self.neighbors = next;
        metrics::set_neighbor_count(&self.collection, self.neighbors.len());
    }

    fn merge_envelope(&mut self, envelope: DeltaEnvelope) {
        if envelope.collection != self.collection {
            warn!(
                from = %envelope.from,
                got = %envelope.collection,
                "Delta for another collection, dropping"
            );
            metrics::record_delta_dropped(&self.collection, "collection");
            return;
        }

        let delta: DeltaEntries<V> = match serde_json::from_slice(&envelope.payload) {
            Ok(delta) => delta,
            Err(e) => {
                warn!(from = %envelope.from, error = %e, "Undecodable delta, dropping");
                metrics::record_delta_dropped(&self.collection, "decode");
                return;
            }
        };

        let received = delta.len();
        for (_, entry) in &delta {
            self.clock.observe(&entry.ts);
        }
        let changed = self.map.merge(delta);

        // Forward what changed to everyone except the sender
        for key in &changed {
            let Some(entry) = self.map.entry(key).cloned() else {
                continue;
            };
            for (peer, outbox) in self.outboxes.iter_mut() {
                if *peer != envelope.from {
                    outbox.stage(key.clone(), entry.clone());
                }
            }
        }

        trace!(from = %envelope.from, received, applied = changed.len(), "Merged delta");
        metrics::record_delta_merged(&self.collection, received, changed.len());
        metrics::set_replica_size(&self.collection, self.map.len());
    }

    async fn flush(&mut self) {
        let batches: Vec<(String, DeltaEntries<V>)> = self
            .outboxes
            .iter_mut()
            .filter(|(_, outbox)| !outbox.is_empty())
            .map(|(peer, outbox)| (peer.clone(), outbox.drain()))
            .collect();

        let mut pending = Vec::with_capacity(batches.len());
        for (peer, entries) in batches {
            match serde_json::to_vec(&entries) {
                Ok(payload) => pending.push((peer, entries, payload)),
                Err(e) => warn!(peer_id = %peer, error = %e, "Failed to encode delta"),
            }
        }
        if pending.is_empty() {
            return;
        }

        // Neighbors are independent; send to all of them at once
        let sends = pending.iter().map(|(peer, _, payload)| {
            let envelope = DeltaEnvelope {
                collection: self.collection.clone(),
                from: self.node_id.clone(),
                payload: payload.clone(),
            };
            self.transport.send(peer, envelope)
        });
        let results = join_all(sends).await;

        for ((peer, entries, _), result) in pending.into_iter().zip(results) {
            let count = entries.len();
            match result {
                Ok(()) => {
                    debug!(peer_id = %peer, entries = count, "Delta sent");
                    metrics::record_delta_sent(&self.collection, &peer, count);
                }
                Err(e) => {
                    debug!(peer_id = %peer, error = %e, "Delta send failed, retrying next tick");
                    metrics::record_delta_send_failure(&self.collection, &peer);
                    if let Some(outbox) = self.outboxes.get_mut(&peer) {
                        outbox.restore(entries);
                    }
                }
            }
        }
    }
}
