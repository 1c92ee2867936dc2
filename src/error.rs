// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the shelter mesh.
//!
//! Errors fall into two families: domain errors that are surfaced to the
//! caller for correction, and infrastructure errors that the core mostly
//! absorbs (logs, retries, rolls back) without failing the process.
//!
//! # Error Categories
//!
//! | Error Type | Domain | Retryable | Description |
//! |------------|--------|-----------|-------------|
//! | `Validation` | Yes | No | Malformed or out-of-range input, field-level detail |
//! | `NotFound` | Yes | No | Referenced id absent from the local replica |
//! | `PetNotAvailable` | Yes | No | Pet is not in the `available` state |
//! | `CannotApprove` | Yes | No | Approval preconditions not met |
//! | `Transport` | No | Yes | Peer unreachable, delta not delivered |
//! | `Store` | No | No | Local SQLite error (snapshot rolled back) |
//! | `Serialization` | No | No | Record could not be encoded/decoded |
//! | `Config` | No | No | Configuration invalid or storage path unusable |
//! | `Shutdown` | No | No | Component is shutting down |
//! | `Internal` | No | No | Unexpected internal error |

use std::fmt;
use thiserror::Error;

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;

/// A single violated input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// All field violations found while validating one input.
///
/// Validation never stops at the first problem; the caller gets the full
/// list so a form can highlight every bad field at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub fields: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: &'static str, message: impl Into<String>) {
        self.fields.push(FieldError {
            field,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Names of the violated fields, in the order they were checked.
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.field).collect()
    }

    /// Whether `field` is among the violations.
    pub fn has(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f.field == field)
    }

    /// `Ok(())` when nothing was recorded, otherwise a `MeshError::Validation`.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(MeshError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

/// Errors that can occur in the shelter mesh.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Input failed validation.
    ///
    /// Always recoverable: the caller fixes the listed fields and retries.
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    /// Referenced record does not exist in the local replica.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Pet exists but is no longer `available`.
    #[error("Pet {pet_id} is not available (status: {status})")]
    PetNotAvailable { pet_id: String, status: String },

    /// Approval preconditions were not met.
    #[error("Cannot approve application {application_id} for pet {pet_id}: {reason}")]
    CannotApprove {
        pet_id: String,
        application_id: String,
        reason: String,
    },

    /// A delta could not be delivered to a peer.
    ///
    /// Retried implicitly on the next gossip tick; never surfaced to
    /// domain callers.
    #[error("Transport error ({peer_id}): {message}")]
    Transport { peer_id: String, message: String },

    /// SQLite error in the snapshot store.
    #[error("Snapshot store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Record body could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration or unusable storage location.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The target component has shut down.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn transport(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Caller-correctable domain failure (not a system fault).
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NotFound { .. }
                | Self::PetNotAvailable { .. }
                | Self::CannotApprove { .. }
        )
    }

    /// Field-level detail when this is a validation failure.
    pub fn validation(&self) -> Option<&ValidationErrors> {
        match self {
            Self::Validation(v) => Some(v),
            _ => None,
        }
    }
}
