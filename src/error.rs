//! Error types for the Volume Orchestrator
//!
//! Provides the typed failure conditions reported by every orchestration
//! operation. Validation failures are raised before any state mutation;
//! collaborator failures are raised after the volume has been rolled back.

use crate::lifecycle::{VolumeEvent, VolumeState};
use std::time::Duration;
use thiserror::Error;

/// Category of a resource allocation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationErrorKind {
    /// Not enough free bytes on the pool
    Capacity,
    /// Requested size or IOPS outside the offering bounds
    Sizing,
    /// No compatible pool, or migration required to honour the offering tags
    Placement,
    /// A per-instance or per-account limit was reached
    Limit,
}

impl std::fmt::Display for AllocationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationErrorKind::Capacity => write!(f, "capacity"),
            AllocationErrorKind::Sizing => write!(f, "sizing"),
            AllocationErrorKind::Placement => write!(f, "placement"),
            AllocationErrorKind::Limit => write!(f, "limit"),
        }
    }
}

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Volume not found: {volume_id}")]
    VolumeNotFound { volume_id: String },

    #[error("Volume already exists: {volume_id}")]
    VolumeExists { volume_id: String },

    #[error("Snapshot not found: {snapshot_id}")]
    SnapshotNotFound { snapshot_id: String },

    #[error("Disk offering not found: {offering_id}")]
    OfferingNotFound { offering_id: String },

    #[error("Storage pool not found: {pool_id}")]
    PoolNotFound { pool_id: String },

    // =========================================================================
    // Orchestration Errors
    // =========================================================================
    #[error("Resource allocation failed ({kind}): {reason}")]
    ResourceAllocation {
        kind: AllocationErrorKind,
        reason: String,
    },

    #[error("Invalid state transition for volume {volume_id}: {event} is not allowed from {state}")]
    InvalidStateTransition {
        volume_id: String,
        state: VolumeState,
        event: VolumeEvent,
    },

    #[error("Volume {volume_id} changed concurrently: expected v{expected}, found v{actual}")]
    ConcurrentModification {
        volume_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Migration admission declined for {datastore_id}: {in_flight}/{ceiling} in flight")]
    MigrationAdmissionDeclined {
        datastore_id: String,
        in_flight: u64,
        ceiling: u64,
    },

    #[error("Destructive operation rejected for volume {volume_id}: {reason}")]
    DestructiveOperationRejected { volume_id: String, reason: String },

    #[error("{collaborator} failed during {step}: {reason}")]
    ExternalCollaboratorFailure {
        collaborator: String,
        step: String,
        reason: String,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the caller should do with a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after a specific duration
    RetryAfter(Duration),
    /// Re-fetch the volume state and issue a request valid for it
    Reconcile,
    /// Don't retry, the request itself is wrong
    NoRetry,
}

impl Error {
    /// Shorthand for a capacity failure
    pub fn capacity(reason: impl Into<String>) -> Self {
        Error::ResourceAllocation {
            kind: AllocationErrorKind::Capacity,
            reason: reason.into(),
        }
    }

    /// Shorthand for a sizing failure
    pub fn sizing(reason: impl Into<String>) -> Self {
        Error::ResourceAllocation {
            kind: AllocationErrorKind::Sizing,
            reason: reason.into(),
        }
    }

    /// Shorthand for a placement failure
    pub fn placement(reason: impl Into<String>) -> Self {
        Error::ResourceAllocation {
            kind: AllocationErrorKind::Placement,
            reason: reason.into(),
        }
    }

    /// Shorthand for a collaborator failure
    pub fn collaborator(
        collaborator: impl Into<String>,
        step: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::ExternalCollaboratorFailure {
            collaborator: collaborator.into(),
            step: step.into(),
            reason: reason.to_string(),
        }
    }

    /// Allocation failure category, if this is one
    pub fn allocation_kind(&self) -> Option<AllocationErrorKind> {
        match self {
            Error::ResourceAllocation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Determine what the caller should do with this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Shared budget exhausted - come back later
            Error::MigrationAdmissionDeclined { .. } => {
                ErrorAction::RetryAfter(Duration::from_secs(30))
            }

            // Capacity may free up
            Error::ResourceAllocation {
                kind: AllocationErrorKind::Capacity,
                ..
            } => ErrorAction::RetryAfter(Duration::from_secs(60)),

            // Caller raced another caller or automation
            Error::InvalidStateTransition { .. } | Error::ConcurrentModification { .. } => {
                ErrorAction::Reconcile
            }

            // Transient collaborator failures
            Error::ExternalCollaboratorFailure { .. } | Error::Io(_) => {
                ErrorAction::RetryWithBackoff
            }

            // Everything else is a request the core will never accept as-is
            _ => ErrorAction::NoRetry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is a "not found" condition
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::VolumeNotFound { .. }
                | Error::SnapshotNotFound { .. }
                | Error::OfferingNotFound { .. }
                | Error::PoolNotFound { .. }
        )
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
