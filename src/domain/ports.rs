//! Domain Ports - Collaborator trait definitions
//!
//! These traits define the boundaries between the orchestration core and
//! the systems that actually move bytes, attach disks and account for
//! capacity. Adapters implement these traits to provide concrete
//! functionality; in-memory adapters live in `controlplane::backends`.

use crate::domain::model::{Snapshot, StoragePool, Volume};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capacity Accounting Port
// =============================================================================

/// Authoritative owner of pool byte reservations.
///
/// The orchestrator only gates on a snapshot of free capacity; `reserve`
/// must re-check atomically because another allocation may have raced it.
#[async_trait]
pub trait CapacityAccounting: Send + Sync {
    /// Start tracking a pool
    async fn track_pool(&self, pool: &StoragePool) -> Result<()>;

    /// Reserve bytes on a pool, failing with a capacity error if they are gone
    async fn reserve(&self, pool_id: &str, bytes: u64) -> Result<()>;

    /// Return previously reserved bytes
    async fn release(&self, pool_id: &str, bytes: u64) -> Result<()>;

    /// Current free bytes on a pool
    async fn available(&self, pool_id: &str) -> Result<u64>;
}

// =============================================================================
// Data Plane Port
// =============================================================================

/// Result of creating backing storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedVolume {
    /// Backend path of the new volume
    pub path: String,
    /// Image format chosen by the backend
    pub format: Option<String>,
}

/// Result of an upload from an external URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedVolume {
    pub path: String,
    pub size_bytes: u64,
}

/// Scope of a check-and-repair run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairScope {
    /// Reclaim leaked clusters only
    Leaks,
    /// Repair every inconsistency found
    All,
}

/// Outcome of a check-and-repair run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckAndRepairReport {
    /// Output of the consistency check
    pub check_result: String,
    /// Output of the repair, when one was requested
    pub repair_result: Option<String>,
}

/// How a volume is handed out by extract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMode {
    HttpDownload,
    FtpUpload,
}

/// Port for operations that touch volume data
#[async_trait]
pub trait DataPlane: Send + Sync {
    /// Create backing storage for an allocated volume
    async fn create(&self, volume: &Volume, pool: &StoragePool) -> Result<CreatedVolume>;

    /// Submit a migration job; completion is reported back separately
    async fn start_migration(&self, volume: &Volume, destination: &StoragePool) -> Result<()>;

    /// Grow or shrink a volume in place
    async fn resize(&self, volume: &Volume, new_size_bytes: u64) -> Result<()>;

    /// Upload content from an external URL into a pool
    async fn upload(
        &self,
        volume: &Volume,
        pool: &StoragePool,
        url: &str,
        format: &str,
    ) -> Result<UploadedVolume>;

    /// Run a consistency check, optionally repairing
    async fn check_and_repair(
        &self,
        volume: &Volume,
        repair: Option<RepairScope>,
    ) -> Result<CheckAndRepairReport>;

    /// Make a volume available for download, returning its URL
    async fn extract(&self, volume: &Volume, mode: ExtractMode) -> Result<String>;

    /// Remove backing storage
    async fn expunge(&self, volume: &Volume) -> Result<()>;
}

// =============================================================================
// Hypervisor Port
// =============================================================================

/// Port for instance-side operations
#[async_trait]
pub trait HypervisorAttach: Send + Sync {
    /// Attach a volume to an instance at a device slot
    async fn attach(&self, instance_id: &str, volume: &Volume, device_id: u32) -> Result<()>;

    /// Detach a volume from an instance
    async fn detach(&self, instance_id: &str, volume: &Volume) -> Result<()>;

    /// Freeze guest filesystem I/O
    async fn quiesce(&self, instance_id: &str) -> Result<()>;

    /// Resume guest filesystem I/O
    async fn thaw(&self, instance_id: &str) -> Result<()>;
}

// =============================================================================
// Snapshot Backend Port
// =============================================================================

/// Port for snapshot capture and cross-zone replication
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Capture a snapshot on primary storage, returning its physical size
    async fn capture(&self, snapshot: &Snapshot, volume: &Volume) -> Result<u64>;

    /// Copy a captured snapshot into another zone
    async fn replicate(&self, snapshot: &Snapshot, zone_id: &str) -> Result<()>;
}

// =============================================================================
// Upload URL Port
// =============================================================================

/// Parameters for an out-of-band, pre-signed upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadParams {
    pub volume_id: String,
    /// Endpoint the client posts the image to
    pub post_url: String,
    /// Opaque metadata echoed back by the upload endpoint
    pub metadata: String,
    /// Signature over the metadata and expiry
    pub signature: String,
    pub expires_at: DateTime<Utc>,
}

/// Port generating pre-signed upload endpoints
#[async_trait]
pub trait UploadUrlGenerator: Send + Sync {
    /// Generate upload parameters for a volume awaiting content
    async fn upload_params(
        &self,
        volume: &Volume,
        pool: &StoragePool,
        format: &str,
        use_https: bool,
    ) -> Result<UploadParams>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CapacityAccountingRef = Arc<dyn CapacityAccounting>;
pub type DataPlaneRef = Arc<dyn DataPlane>;
pub type HypervisorAttachRef = Arc<dyn HypervisorAttach>;
pub type SnapshotBackendRef = Arc<dyn SnapshotBackend>;
pub type UploadUrlGeneratorRef = Arc<dyn UploadUrlGenerator>;
