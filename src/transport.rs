// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster transport integration.
//!
//! The transport is the external collaborator that moves deltas between
//! nodes and reports who is reachable. The core only depends on the
//! [`ClusterTransport`] trait; two implementations ship with the crate:
//!
//! - [`MeshHub`]: an in-process mesh. Every node attached to the same hub can
//!   reach every other node unless it was isolated with
//!   [`disconnect`](ClusterTransport::disconnect) or a specific link was cut
//!   with [`MeshHub::sever`]. Used by tests and single-process demos.
//! - [`NoOpTransport`]: a node with no peers. Sends always fail.
//!
//! # Membership Events
//!
//! Each node watches its own membership stream. The hub emits
//! `NodeUp`/`NodeDown` to *both* ends of a link when it appears or
//! disappears, mirroring how a cluster transport reports node up/down.
//!
//! ```text
//! join(b)         ──► a: NodeUp(b)
//! disconnect(b)   ──► a: NodeDown(b), b: NodeDown(a)
//! reconnect(b)    ──► a: NodeUp(b),   b: NodeUp(a)
//! ```

use crate::error::{MeshError, Result};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A batch of replica entries travelling from one node to another.
///
/// `payload` is the JSON encoding of the entries; the transport never looks
/// inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEnvelope {
    /// Logical collection the entries belong to (`pets`, `applications`, ...).
    pub collection: String,
    /// Node that sent the envelope.
    pub from: String,
    /// Encoded entries.
    pub payload: Vec<u8>,
}

/// Cluster membership change as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeUp(String),
    NodeDown(String),
}

/// What the core needs from the cluster transport.
pub trait ClusterTransport: Send + Sync + 'static {
    /// Register the inbox for one replicated collection on `node_id`.
    fn attach_inbox(&self, node_id: &str, collection: &str) -> mpsc::UnboundedReceiver<DeltaEnvelope>;

    /// Register the membership event stream for `node_id`.
    fn watch_membership(&self, node_id: &str) -> mpsc::UnboundedReceiver<MembershipEvent>;

    /// Announce `node_id` to the cluster.
    fn join(&self, node_id: &str);

    /// Withdraw `node_id` from the cluster.
    fn leave(&self, node_id: &str);

    /// Peers `node_id` can currently reach.
    fn reachable_peers(&self, node_id: &str) -> Vec<String>;

    /// Deliver an envelope to `to`. Fails with [`MeshError::Transport`] when
    /// the peer is unreachable.
    fn send(&self, to: &str, envelope: DeltaEnvelope) -> BoxFuture<'_, Result<()>>;

    /// Drop every link of `node_id` (fault injection).
    fn disconnect(&self, node_id: &str);

    /// Restore the links dropped by [`disconnect`](Self::disconnect).
    fn reconnect(&self, node_id: &str);
}

// ═══════════════════════════════════════════════════════════════════════════════
// MeshHub
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct HubInner {
    /// (node, collection) -> inbox
    inboxes: DashMap<(String, String), mpsc::UnboundedSender<DeltaEnvelope>>,
    /// node -> membership stream
    watchers: DashMap<String, mpsc::UnboundedSender<MembershipEvent>>,
    /// Nodes that have joined
    members: DashSet<String>,
    /// Nodes cut off from everyone
    isolated: DashSet<String>,
    /// Individually cut links, stored with the smaller id first
    severed: DashSet<(String, String)>,
}

/// In-process cluster transport.
///
/// Cloning is cheap; clones share the same mesh.
#[derive(Clone, Default)]
pub struct MeshHub {
    inner: Arc<HubInner>,
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl MeshHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a direct link between `a` and `b` is currently up.
    pub fn is_linked(&self, a: &str, b: &str) -> bool {
        a != b
            && self.inner.members.contains(a)
            && self.inner.members.contains(b)
            && !self.inner.isolated.contains(a)
            && !self.inner.isolated.contains(b)
            && !self.inner.severed.contains(&link_key(a, b))
    }

    /// Cut the direct link between `a` and `b`, leaving their other links up.
    pub fn sever(&self, a: &str, b: &str) {
        let was_linked = self.is_linked(a, b);
        self.inner.severed.insert(link_key(a, b));
        if was_linked {
            self.notify(a, MembershipEvent::NodeDown(b.to_string()));
            self.notify(b, MembershipEvent::NodeDown(a.to_string()));
        }
    }

    /// Undo [`sever`](Self::sever).
    pub fn restore_link(&self, a: &str, b: &str) {
        self.inner.severed.remove(&link_key(a, b));
        if self.is_linked(a, b) {
            self.notify(a, MembershipEvent::NodeUp(b.to_string()));
            self.notify(b, MembershipEvent::NodeUp(a.to_string()));
        }
    }

    /// Joined nodes, sorted.
    pub fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.inner.members.iter().map(|m| m.key().clone()).collect();
        members.sort();
        members
    }

    fn notify(&self, node_id: &str, event: MembershipEvent) {
        if let Some(tx) = self.inner.watchers.get(node_id) {
            // Receiver gone means the node's topology manager stopped
            let _ = tx.send(event);
        }
    }
}

impl ClusterTransport for MeshHub {
    fn attach_inbox(&self, node_id: &str, collection: &str) -> mpsc::UnboundedReceiver<DeltaEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .inboxes
            .insert((node_id.to_string(), collection.to_string()), tx);
        rx
    }

    fn watch_membership(&self, node_id: &str) -> mpsc::UnboundedReceiver<MembershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.watchers.insert(node_id.to_string(), tx);
        rx
    }

    fn join(&self, node_id: &str) {
        self.inner.members.insert(node_id.to_string());
        let peers = self.reachable_peers(node_id);
        info!(node_id = %node_id, peers = peers.len(), "Node joined mesh");
        for peer in peers {
            self.notify(&peer, MembershipEvent::NodeUp(node_id.to_string()));
        }
    }

    fn leave(&self, node_id: &str) {
        let peers = self.reachable_peers(node_id);
        self.inner.members.remove(node_id);
        // A later node under this id starts connected
        self.inner.isolated.remove(node_id);
        self.inner.inboxes.retain(|(node, _), _| node != node_id);
        self.inner.watchers.remove(node_id);
        info!(node_id = %node_id, "Node left mesh");
        for peer in peers {
            self.notify(&peer, MembershipEvent::NodeDown(node_id.to_string()));
        }
    }

    fn reachable_peers(&self, node_id: &str) -> Vec<String> {
        let mut peers: Vec<String> = self
            .inner
            .members
            .iter()
            .map(|m| m.key().clone())
            .filter(|m| self.is_linked(node_id, m))
            .collect();
        peers.sort();
        peers
    }

    fn send(&self, to: &str, envelope: DeltaEnvelope) -> BoxFuture<'_, Result<()>> {
        let to = to.to_string();
        Box::pin(async move {
            if !self.is_linked(&envelope.from, &to) {
                return Err(MeshError::transport(&to, "no link to peer"));
            }
            let key = (to.clone(), envelope.collection.clone());
            let tx = self
                .inner
                .inboxes
                .get(&key)
                .map(|r| r.value().clone())
                .ok_or_else(|| {
                    MeshError::transport(&to, format!("no inbox for collection {}", key.1))
                })?;
            tx.send(envelope)
                .map_err(|_| MeshError::transport(&to, "inbox closed"))
        })
    }

    fn disconnect(&self, node_id: &str) {
        let peers = self.reachable_peers(node_id);
        self.inner.isolated.insert(node_id.to_string());
        debug!(node_id = %node_id, peers = peers.len(), "Node isolated");
        for peer in peers {
            self.notify(&peer, MembershipEvent::NodeDown(node_id.to_string()));
            self.notify(node_id, MembershipEvent::NodeDown(peer));
        }
    }

    fn reconnect(&self, node_id: &str) {
        self.inner.isolated.remove(node_id);
        let peers = self.reachable_peers(node_id);
        debug!(node_id = %node_id, peers = peers.len(), "Node reconnected");
        for peer in peers {
            self.notify(&peer, MembershipEvent::NodeUp(node_id.to_string()));
            self.notify(node_id, MembershipEvent::NodeUp(peer));
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NoOpTransport
// ═══════════════════════════════════════════════════════════════════════════════

/// A transport for a standalone node.
///
/// Reports no peers and rejects every send.
#[derive(Clone, Default)]
pub struct NoOpTransport;

impl ClusterTransport for NoOpTransport {
    fn attach_inbox(&self, _node_id: &str, _collection: &str) -> mpsc::UnboundedReceiver<DeltaEnvelope> {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }

    fn watch_membership(&self, _node_id: &str) -> mpsc::UnboundedReceiver<MembershipEvent> {
        let (_tx, rx) = mpsc::unbounded_channel();
        rx
    }

    fn join(&self, node_id: &str) {
        tracing::debug!(node_id = %node_id, "NoOp: join");
    }

    fn leave(&self, node_id: &str) {
        tracing::debug!(node_id = %node_id, "NoOp: leave");
    }

    fn reachable_peers(&self, _node_id: &str) -> Vec<String> {
        Vec::new()
    }

    fn send(&self, to: &str, _envelope: DeltaEnvelope) -> BoxFuture<'_, Result<()>> {
        let to = to.to_string();
        Box::pin(async move { Err(MeshError::transport(to, "standalone node has no transport")) })
    }

    fn disconnect(&self, _node_id: &str) {}

    fn reconnect(&self, _node_id: &str) {}
}
