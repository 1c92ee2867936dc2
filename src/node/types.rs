// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Node lifecycle types.
//!
//! ```text
//!            start()              (all tasks up)
//! Created ───────────→ Starting ─────────────────→ Running
//!    │                    │                           │
//!    │                    │ (store failed to open)    │ shutdown()
//!    │                    ↓                           ↓
//!    └──────────────→ Stopped ←──────────────── ShuttingDown
//! ```

/// Lifecycle state of a [`ShelterNode`](super::ShelterNode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Built but not started.
    Created,

    /// Opening the store, restoring and spawning tasks.
    Starting,

    /// Serving operations and replicating.
    Running,

    /// Final snapshot and task drain in progress.
    ShuttingDown,

    /// All tasks stopped. Safe to drop.
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Created => write!(f, "Created"),
            NodeState::Starting => write!(f, "Starting"),
            NodeState::Running => write!(f, "Running"),
            NodeState::ShuttingDown => write!(f, "ShuttingDown"),
            NodeState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Point-in-time health of a node. Collected without I/O beyond the
/// node's own actors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHealth {
    pub state: NodeState,
    pub connected_peers: usize,
    pub pets: usize,
    pub applications: usize,
}

impl NodeHealth {
    /// Running and able to serve operations.
    pub fn ready(&self) -> bool {
        self.state == NodeState::Running
    }
}
