// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change notification bus.
//!
//! In-process fan-out of domain events to local subscribers (the UI layer).
//! Publishing never blocks and never fails: with no subscribers the event is
//! simply dropped, and a subscriber that falls behind the channel capacity
//! loses the oldest events (`RecvError::Lagged`).
//!
//! Remote changes do not pass through the local domain layer, so a
//! [`HashWatcher`] polls each replica's content hash and publishes a
//! generic `sync` event whenever it moves.

use crate::domain::{AdoptionApplication, Pet};
use crate::metrics;
use crate::replica::ReplicaControl;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info_span, trace, Instrument};

/// A change visible to subscribers. Serializes with a `type` tag equal to
/// [`event_type`](Self::event_type).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    PetAdded {
        pet: Pet,
    },
    PetUpdated {
        pet: Pet,
    },
    PetRemoved {
        pet: Pet,
    },
    ApplicationSubmitted {
        application: AdoptionApplication,
    },
    PetAdopted {
        pet: Pet,
        application: AdoptionApplication,
    },
    ClusterChange {
        peers: Vec<String>,
    },
    Sync {
        collection: String,
    },
}

impl ChangeEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PetAdded { .. } => "pet_added",
            Self::PetUpdated { .. } => "pet_updated",
            Self::PetRemoved { .. } => "pet_removed",
            Self::ApplicationSubmitted { .. } => "application_submitted",
            Self::PetAdopted { .. } => "pet_adopted",
            Self::ClusterChange { .. } => "cluster_change",
            Self::Sync { .. } => "sync",
        }
    }
}

/// Cloneable publish/subscribe handle.
#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver to every current subscriber. Fire-and-forget.
    pub fn publish(&self, event: ChangeEvent) {
        trace!(event_type = event.event_type(), "Publishing change event");
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    /// Receive events published from now on. Drop the receiver to
    /// unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Polls replica content hashes and publishes `sync` on change.
pub struct HashWatcher {
    replicas: Vec<Arc<dyn ReplicaControl>>,
    bus: ChangeBus,
    last: HashMap<String, String>,
}

impl HashWatcher {
    pub fn new(replicas: Vec<Arc<dyn ReplicaControl>>, bus: ChangeBus) -> Self {
        Self {
            replicas,
            bus,
            last: HashMap::new(),
        }
    }

    /// One polling pass. Returns the collections whose hash changed.
    ///
    /// The first pass only records a baseline.
    pub async fn poll(&mut self) -> Vec<String> {
        let mut changed = Vec::new();
        for replica in &self.replicas {
            let hash = replica.content_hash().await;
            let collection = replica.collection().to_string();
            match self.last.insert(collection.clone(), hash.clone()) {
                Some(previous) if previous != hash => {
                    debug!(collection = %collection, "Replica content changed");
                    metrics::record_sync_event(&collection);
                    self.bus.publish(ChangeEvent::Sync {
                        collection: collection.clone(),
                    });
                    changed.push(collection);
                }
                _ => {}
            }
        }
        changed
    }

    pub fn spawn(mut self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                let mut timer = tokio::time::interval(interval);
                timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = timer.tick() => {
                            self.poll().await;
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                debug!("Hash watcher stopping");
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("hash_watcher")),
        )
    }
}
