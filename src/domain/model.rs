//! Domain Model
//!
//! Records the orchestrator reasons about: volumes, disk offerings,
//! storage pools and snapshots.

use crate::lifecycle::VolumeState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Device slot reserved for an instance's root volume
pub const ROOT_DEVICE_ID: u32 = 0;

// =============================================================================
// Volume
// =============================================================================

/// A block storage volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    /// Owning account
    pub account_id: String,
    /// Zone the volume lives in
    pub zone_id: String,
    /// Current lifecycle state
    pub state: VolumeState,
    /// Provisioned size in bytes
    pub size_bytes: u64,
    /// Offering the volume is provisioned against
    pub disk_offering_id: String,
    /// Backing pool, unset while the volume is only allocated
    pub pool_id: Option<String>,
    /// Attached instance
    pub instance_id: Option<String>,
    /// Device slot on the attached instance
    pub device_id: Option<u32>,
    pub min_iops: Option<u64>,
    pub max_iops: Option<u64>,
    /// Image format, opaque to the orchestrator
    pub format: Option<String>,
    /// Backend path, opaque to the orchestrator
    pub path: Option<String>,
    /// Backing chain metadata, opaque to the orchestrator
    pub chain_info: Option<String>,
    /// Shown to the end user
    pub display: bool,
    /// Destroy is refused while set
    pub delete_protection: bool,
    pub custom_id: Option<String>,
    /// Bumped on every committed write
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: Option<DateTime<Utc>>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl Volume {
    /// Create a freshly allocated volume
    pub fn allocate(
        name: impl Into<String>,
        account_id: impl Into<String>,
        zone_id: impl Into<String>,
        disk_offering_id: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: generate_id("vol"),
            name: name.into(),
            account_id: account_id.into(),
            zone_id: zone_id.into(),
            state: VolumeState::Allocated,
            size_bytes,
            disk_offering_id: disk_offering_id.into(),
            pool_id: None,
            instance_id: None,
            device_id: None,
            min_iops: None,
            max_iops: None,
            format: None,
            path: None,
            chain_info: None,
            display: true,
            delete_protection: false,
            custom_id: None,
            version: 0,
            created_at: Utc::now(),
            destroyed_at: None,
            removed_at: None,
        }
    }

    /// Whether the volume is attached to an instance
    pub fn is_attached(&self) -> bool {
        self.instance_id.is_some()
    }

    /// Whether the volume is the root disk of its instance
    pub fn is_root(&self) -> bool {
        self.device_id == Some(ROOT_DEVICE_ID)
    }
}

// =============================================================================
// Disk Offering
// =============================================================================

/// Size, performance and tag template a volume is provisioned against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskOffering {
    pub id: String,
    pub name: String,
    /// Tags a pool must declare; empty means no constraint
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Fixed size when the offering is not custom-sized
    #[serde(default)]
    pub size_bytes: u64,
    /// Whether the caller picks the size
    #[serde(default)]
    pub custom_size: bool,
    #[serde(default)]
    pub min_size_bytes: u64,
    #[serde(default)]
    pub max_size_bytes: u64,
    /// Whether the caller picks min/max IOPS
    #[serde(default)]
    pub custom_iops: bool,
    #[serde(default)]
    pub min_iops: Option<u64>,
    #[serde(default)]
    pub max_iops: Option<u64>,
}

impl DiskOffering {
    /// Fixed-size offering
    pub fn fixed(id: impl Into<String>, size_bytes: u64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tags: BTreeSet::new(),
            size_bytes,
            custom_size: false,
            min_size_bytes: 0,
            max_size_bytes: 0,
            custom_iops: false,
            min_iops: None,
            max_iops: None,
        }
    }

    /// Custom-size offering accepting `[min, max]` bytes
    pub fn custom(id: impl Into<String>, min_size_bytes: u64, max_size_bytes: u64) -> Self {
        Self {
            custom_size: true,
            min_size_bytes,
            max_size_bytes,
            ..Self::fixed(id, 0)
        }
    }

    /// Builder: set the required tags
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: allow caller-chosen IOPS within optional bounds
    pub fn with_custom_iops(mut self, min_iops: Option<u64>, max_iops: Option<u64>) -> Self {
        self.custom_iops = true;
        self.min_iops = min_iops;
        self.max_iops = max_iops;
        self
    }

    /// Inclusive size range for custom offerings
    pub fn size_range(&self) -> Option<(u64, u64)> {
        self.custom_size
            .then_some((self.min_size_bytes, self.max_size_bytes))
    }
}

// =============================================================================
// Storage Pool
// =============================================================================

/// A concrete storage backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    /// Datastore sharing this pool's migration-admission budget
    pub datastore_id: String,
    pub zone_id: String,
    /// Tags the pool supports; empty supports nothing tag-specific
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub capacity_bytes: u64,
    /// Free bytes at the time this record was read
    pub available_bytes: u64,
}

impl StoragePool {
    /// Create an empty pool with all capacity free
    pub fn new(
        id: impl Into<String>,
        datastore_id: impl Into<String>,
        zone_id: impl Into<String>,
        capacity_bytes: u64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            datastore_id: datastore_id.into(),
            zone_id: zone_id.into(),
            tags: BTreeSet::new(),
            capacity_bytes,
            available_bytes: capacity_bytes,
        }
    }

    /// Builder: set the supported tags
    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Where a snapshot is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationType {
    Primary,
    Secondary,
    #[serde(rename = "zone-replicated")]
    ZoneReplicated,
}

impl std::fmt::Display for LocationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocationType::Primary => write!(f, "primary"),
            LocationType::Secondary => write!(f, "secondary"),
            LocationType::ZoneReplicated => write!(f, "zone-replicated"),
        }
    }
}

/// Snapshot record state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    Allocated,
    BackingUp,
    Ready,
    Failed,
}

/// Replication status of a snapshot in one target zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    Pending,
    Replicated,
    Failed { reason: String },
}

/// A point-in-time capture of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub volume_id: String,
    pub policy_id: Option<String>,
    /// Instance snapshot this volume snapshot belongs to
    pub vm_snapshot_id: Option<String>,
    pub location_type: LocationType,
    /// Target zones for cross-zone replication
    pub zone_ids: Vec<String>,
    /// Per-zone replication outcome
    pub replicas: BTreeMap<String, ReplicaStatus>,
    pub async_backup: bool,
    pub tags: BTreeMap<String, String>,
    pub state: SnapshotState,
    /// Physical size reported by the capture
    pub size_bytes: u64,
    /// Provisioned size of the volume when the snapshot was taken
    pub volume_size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Zones whose replication failed
    pub fn failed_zones(&self) -> Vec<String> {
        self.replicas
            .iter()
            .filter(|(_, status)| matches!(status, ReplicaStatus::Failed { .. }))
            .map(|(zone, _)| zone.clone())
            .collect()
    }

    /// Whether every target zone holds a replica
    pub fn fully_replicated(&self) -> bool {
        self.replicas
            .values()
            .all(|status| *status == ReplicaStatus::Replicated)
    }
}

// =============================================================================
// Identifiers
// =============================================================================

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique, prefixed identifier
pub fn generate_id(prefix: &str) -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let millis = Utc::now().timestamp_millis() as u64;
    format!("{}-{:011x}{:05x}", prefix, millis, counter & 0xF_FFFF)
}
