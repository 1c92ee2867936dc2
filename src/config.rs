//! Configuration for a shelter node.
//!
//! Configuration is passed to [`ShelterNode::new()`](crate::ShelterNode::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use shelter_mesh::config::{NodeConfig, ShelterConfig};
//!
//! let config = NodeConfig {
//!     shelter: ShelterConfig::new("node-a", "shelter-a", "Happy Paws"),
//!     ..Default::default()
//! };
//! assert_eq!(config.gossip.sync_interval, "2s");
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! NodeConfig
//! ├── shelter: ShelterConfig    # node_id, shelter_id, shelter_name
//! ├── cluster: ClusterConfig    # seed peers, membership safety-net timer
//! ├── gossip: GossipConfig      # delta sync interval
//! ├── notify: NotifyConfig      # hash watcher interval, bus capacity
//! └── snapshot: SnapshotConfig  # SQLite snapshot store
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! shelter:
//!   node_id: "shelter-north@10.0.0.4"
//!   shelter_id: "shelter-north"
//!   shelter_name: "North Side Rescue"
//!
//! cluster:
//!   seed_peers: ["shelter-south@10.0.0.5"]
//!   safety_net_interval: "10s"
//!
//! gossip:
//!   sync_interval: "2s"
//!
//! snapshot:
//!   interval: "5m"
//!   sqlite_path: "/var/lib/shelter/snapshots.db"
//! ```

use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parse a humantime duration string, falling back to `fallback` when the
/// string is malformed.
fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ShelterNode::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity of this shelter node.
    pub shelter: ShelterConfig,

    /// Cluster membership settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Replication gossip settings.
    #[serde(default)]
    pub gossip: GossipConfig,

    /// Change notification settings.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Snapshot persistence settings.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            shelter: ShelterConfig::new("local.dev.shelter", "local-shelter", "Local Shelter"),
            cluster: ClusterConfig::default(),
            gossip: GossipConfig::default(),
            notify: NotifyConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a config with fast timers for tests.
    ///
    /// The shelter id and display name are derived from `node_id`.
    pub fn for_testing(node_id: &str, sqlite_path: &str) -> Self {
        Self {
            shelter: ShelterConfig::new(node_id, node_id, &format!("Shelter {}", node_id)),
            cluster: ClusterConfig {
                seed_peers: Vec::new(),
                safety_net_interval: "200ms".to_string(),
            },
            gossip: GossipConfig {
                sync_interval: "20ms".to_string(),
                ..Default::default()
            },
            notify: NotifyConfig {
                poll_interval: "20ms".to_string(),
                ..Default::default()
            },
            snapshot: SnapshotConfig {
                // Long enough that tests drive snapshots explicitly
                interval: "1h".to_string(),
                sqlite_path: sqlite_path.to_string(),
                wal_mode: false,
                ..Default::default()
            },
        }
    }

    /// Reject configurations the node cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.shelter.node_id.trim().is_empty() {
            return Err(MeshError::Config("shelter.node_id must not be empty".into()));
        }
        if self.shelter.shelter_id.trim().is_empty() {
            return Err(MeshError::Config("shelter.shelter_id must not be empty".into()));
        }
        if self.shelter.shelter_name.trim().is_empty() {
            return Err(MeshError::Config("shelter.shelter_name must not be empty".into()));
        }
        if self.snapshot.batch_size == 0 {
            return Err(MeshError::Config("snapshot.batch_size must be at least 1".into()));
        }
        if self.snapshot.retain_meta == 0 {
            return Err(MeshError::Config("snapshot.retain_meta must be at least 1".into()));
        }
        if self.snapshot.sqlite_path.trim().is_empty() {
            return Err(MeshError::Config("snapshot.sqlite_path must not be empty".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ShelterConfig: process identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity settings, turned into a [`ShelterIdentity`](crate::identity::ShelterIdentity)
/// once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShelterConfig {
    /// Cluster-unique node identifier. Also prefixes generated record ids.
    pub node_id: String,
    /// Business identifier of the shelter.
    pub shelter_id: String,
    /// Human-readable shelter name shown on records it owns.
    pub shelter_name: String,
}

impl ShelterConfig {
    pub fn new(node_id: &str, shelter_id: &str, shelter_name: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            shelter_id: shelter_id.to_string(),
            shelter_name: shelter_name.to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ClusterConfig: membership
// ═══════════════════════════════════════════════════════════════════════════════

/// Cluster membership configuration.
///
/// Discovery itself belongs to the transport; `seed_peers` only tells the
/// topology manager which peers to track as `Unknown` before the transport
/// reports them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub seed_peers: Vec<String>,

    /// Periodic neighbor refresh in case membership events were missed.
    #[serde(default = "default_safety_net_interval")]
    pub safety_net_interval: String,
}

fn default_safety_net_interval() -> String {
    "10s".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seed_peers: Vec::new(),
            safety_net_interval: default_safety_net_interval(),
        }
    }
}

impl ClusterConfig {
    pub fn safety_net_interval_duration(&self) -> Duration {
        parse_duration_or(&self.safety_net_interval, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GossipConfig: delta propagation
// ═══════════════════════════════════════════════════════════════════════════════

/// Delta gossip configuration shared by all replicated maps of a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// How often accumulated deltas are pushed to neighbors (e.g. "2s").
    #[serde(default = "default_sync_interval")]
    pub sync_interval: String,

    /// Capacity of each replica actor's command queue.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

fn default_sync_interval() -> String {
    "2s".to_string()
}

fn default_command_capacity() -> usize {
    1024
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            sync_interval: default_sync_interval(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl GossipConfig {
    pub fn sync_interval_duration(&self) -> Duration {
        parse_duration_or(&self.sync_interval, Duration::from_secs(2))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NotifyConfig: change bus
// ═══════════════════════════════════════════════════════════════════════════════

/// Change notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// How often the hash watcher polls replica content hashes.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Broadcast buffer per subscriber; slow subscribers lag and skip.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl NotifyConfig {
    pub fn poll_interval_duration(&self) -> Duration {
        parse_duration_or(&self.poll_interval, Duration::from_secs(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SnapshotConfig: durable snapshots
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Whether periodic snapshots run. Shutdown snapshots always run.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Periodic snapshot interval (e.g. "5m").
    #[serde(default = "default_snapshot_interval")]
    pub interval: String,

    /// Path to the SQLite snapshot database (`:memory:` for tests).
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Rows per multi-row upsert statement.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of `snapshot_meta` rows retained.
    #[serde(default = "default_retain_meta")]
    pub retain_meta: usize,

    /// Whether to use WAL mode for SQLite.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

fn default_snapshot_interval() -> String {
    "5m".to_string()
}

fn default_sqlite_path() -> String {
    "data/shelter_snapshots.db".to_string()
}

fn default_batch_size() -> usize {
    200
}

fn default_retain_meta() -> usize {
    100
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_snapshot_interval(),
            sqlite_path: default_sqlite_path(),
            batch_size: default_batch_size(),
            retain_meta: default_retain_meta(),
            wal_mode: true,
        }
    }
}

impl SnapshotConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_duration_or(&self.interval, Duration::from_secs(300))
    }

    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
