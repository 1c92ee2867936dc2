// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process identity of a shelter node.

use crate::config::ShelterConfig;
use uuid::Uuid;

/// Immutable identity of this node, built once at startup and shared
/// read-only (behind an `Arc`) with every component that needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShelterIdentity {
    node_id: String,
    shelter_id: String,
    shelter_name: String,
}

impl ShelterIdentity {
    pub fn new(
        node_id: impl Into<String>,
        shelter_id: impl Into<String>,
        shelter_name: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            shelter_id: shelter_id.into(),
            shelter_name: shelter_name.into(),
        }
    }

    pub fn from_config(config: &ShelterConfig) -> Self {
        Self::new(
            config.node_id.clone(),
            config.shelter_id.clone(),
            config.shelter_name.clone(),
        )
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn shelter_id(&self) -> &str {
        &self.shelter_id
    }

    pub fn shelter_name(&self) -> &str {
        &self.shelter_name
    }

    /// Fresh record id, prefixed with this node so ids minted concurrently on
    /// different shelters never collide on the prefix alone.
    pub fn new_record_id(&self) -> String {
        format!("{}-{}", self.node_id, Uuid::new_v4().simple())
    }
}
