//! Operation Requests
//!
//! Validated intents accepted by the orchestrator. Parsing and authorization
//! happen before these are built.

use crate::domain::model::LocationType;
use crate::domain::ports::{ExtractMode, RepairScope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request to allocate a new volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocVolumeRequest {
    pub name: String,
    pub account_id: String,
    pub zone_id: String,
    pub disk_offering_id: String,
    /// Required for custom-size offerings
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub min_iops: Option<u64>,
    #[serde(default)]
    pub max_iops: Option<u64>,
    /// Create from this snapshot; size is taken from it
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub display: Option<bool>,
}

/// Request to change size and/or IOPS, optionally with a new offering
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResizeVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub new_size_bytes: Option<u64>,
    #[serde(default)]
    pub new_min_iops: Option<u64>,
    #[serde(default)]
    pub new_max_iops: Option<u64>,
    #[serde(default)]
    pub new_offering_id: Option<String>,
    /// Acknowledge that shrinking may truncate data
    #[serde(default)]
    pub shrink_ok: bool,
}

/// Request to move a volume onto another offering
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeOfferingRequest {
    pub volume_id: String,
    pub new_offering_id: String,
    #[serde(default)]
    pub new_size_bytes: Option<u64>,
    #[serde(default)]
    pub new_min_iops: Option<u64>,
    #[serde(default)]
    pub new_max_iops: Option<u64>,
    /// Migrate to a compatible pool when the current one lacks the tags
    #[serde(default)]
    pub auto_migrate: bool,
    #[serde(default)]
    pub shrink_ok: bool,
}

/// Request to move a volume to another pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrateVolumeRequest {
    pub volume_id: String,
    pub destination_pool_id: String,
    /// Switch offering as part of the move
    #[serde(default)]
    pub new_offering_id: Option<String>,
}

/// Completion signal for an in-flight migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum MigrationOutcome {
    Succeeded {
        #[serde(default)]
        path: Option<String>,
    },
    Failed {
        reason: String,
    },
}

/// Request to create a volume from an external image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadVolumeRequest {
    pub name: String,
    pub account_id: String,
    pub zone_id: String,
    pub disk_offering_id: String,
    /// Expected size, used for placement before the image is seen
    #[serde(default)]
    pub size_bytes: Option<u64>,
    pub format: String,
    /// Source URL for direct uploads; unused for pre-signed uploads
    #[serde(default)]
    pub url: Option<String>,
}

/// Completion signal for a pre-signed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum UploadOutcome {
    Succeeded { path: String, size_bytes: u64 },
    Failed { reason: String },
}

/// Request to attach a volume to an instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachVolumeRequest {
    pub volume_id: String,
    pub instance_id: String,
    /// Next free slot when unset
    #[serde(default)]
    pub device_id: Option<u32>,
}

/// Request to detach a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetachVolumeRequest {
    pub volume_id: String,
    /// Must match the attached instance when set
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// Request to destroy a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestroyVolumeRequest {
    pub volume_id: String,
    /// Expunge immediately after destroying
    #[serde(default)]
    pub expunge: bool,
    /// Detach from the instance first instead of refusing
    #[serde(default)]
    pub force: bool,
}

/// Request to capture a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeSnapshotRequest {
    pub volume_id: String,
    #[serde(default)]
    pub policy_id: Option<String>,
    /// Previously allocated snapshot to capture into
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub quiesce_vm: bool,
    pub location_type: LocationType,
    /// Return once the primary capture is durable
    #[serde(default)]
    pub async_backup: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub zone_ids: Vec<String>,
}

impl TakeSnapshotRequest {
    /// Minimal primary snapshot request
    pub fn primary(volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            policy_id: None,
            snapshot_id: None,
            name: None,
            quiesce_vm: false,
            location_type: LocationType::Primary,
            async_backup: false,
            tags: BTreeMap::new(),
            zone_ids: Vec::new(),
        }
    }
}

/// Request to run a consistency check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckAndRepairRequest {
    pub volume_id: String,
    #[serde(default)]
    pub repair: Option<RepairScope>,
}

/// Request to hand a volume out for download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractVolumeRequest {
    pub volume_id: String,
    pub mode: ExtractMode,
}

/// Metadata-only update; the lifecycle state is never touched here
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub chain_info: Option<String>,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub display: Option<bool>,
    #[serde(default)]
    pub delete_protection: Option<bool>,
    #[serde(default)]
    pub custom_id: Option<String>,
}
