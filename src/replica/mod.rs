// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated map engine.
//!
//! A last-writer-wins map replicated by delta gossip:
//! - [`clock`]: hybrid logical timestamps, the LWW ordering
//! - [`lww`]: the map and its merge rule
//! - [`outbox`]: per-neighbor pending deltas
//! - [`actor`]: the task that owns one map and gossips it
//!
//! Each tick, entries accumulated since the last tick are pushed to each
//! neighbor; received entries merge by timestamp. Replicas converge within
//! roughly `sync_interval × diameter` of the last write.

pub mod actor;
pub mod clock;
pub mod lww;
pub mod outbox;

pub use actor::{spawn_replica, ReplicaControl, ReplicaHandle, ReplicaOptions, ReplicaValue};
pub use clock::{HybridClock, Timestamp};
pub use lww::{DeltaEntries, Entry, LwwMap};

/// Collection names used on the wire and in storage.
pub const PETS: &str = "pets";
pub const APPLICATIONS: &str = "applications";
pub const COUNTERS: &str = "counters";
