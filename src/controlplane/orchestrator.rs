//! Volume Orchestrator - The "Brain"
//!
//! Single entry point for every volume operation. Each operation follows
//! the same shape:
//! - validate against the catalog, tag matcher and resize validator
//! - reserve capacity and (for migrations) admission
//! - drive the state machine into the in-progress state
//! - call the collaborator, then commit success or roll back
//!
//! Attachment, migration/resize and upload/extract operations live in
//! sibling modules as further `impl VolumeOrchestrator` blocks.

use crate::admission::{AdmissionTicket, MigrationAdmissionController};
use crate::controlplane::backends::Collaborators;
use crate::domain::model::{
    DiskOffering, LocationType, Snapshot, SnapshotState, StoragePool, Volume,
};
use crate::domain::requests::{
    AllocVolumeRequest, DestroyVolumeRequest, DetachVolumeRequest, TakeSnapshotRequest,
    UpdateVolumeRequest,
};
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleEvent, VolumeEvent, VolumeState, VolumeStore};
use crate::metrics::OrchestratorMetrics;
use crate::placement::{
    pool_supports_offering, pool_supports_tags, resolve_allocation_size, validate_iops,
    PoolRequirements, PoolSelector, ResizePlan, StorageCatalog,
};
use crate::snapshot::SnapshotOrchestrator;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Pool definition in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSeed {
    pub id: String,
    pub datastore_id: String,
    pub zone_id: String,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl From<PoolSeed> for StoragePool {
    fn from(seed: PoolSeed) -> Self {
        StoragePool::new(seed.id, seed.datastore_id, seed.zone_id, seed.capacity_bytes)
            .with_tags(seed.tags)
    }
}

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent migrations per destination datastore, 0 = unlimited
    #[serde(rename = "concurrent.migrations.per.target.datastore")]
    pub concurrent_migrations_per_target_datastore: u64,
    /// Scheme of generated upload URLs
    #[serde(rename = "use.https.to.upload")]
    pub use_https_to_upload: bool,
    /// Data volume device slots per instance, slot 0 is the root disk
    #[serde(rename = "max.data.volumes.per.vm")]
    pub max_data_volumes_per_vm: u32,
    /// Offerings registered at startup
    pub offerings: Vec<DiskOffering>,
    /// Pools registered at startup
    pub pools: Vec<PoolSeed>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrent_migrations_per_target_datastore: 0,
            use_https_to_upload: true,
            max_data_volumes_per_vm: 6,
            offerings: Vec::new(),
            pools: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        info!("Loaded configuration from {}", path.display());
        Self::from_yaml_str(&yaml)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_data_volumes_per_vm == 0 {
            return Err(Error::Configuration(
                "max.data.volumes.per.vm must be at least 1".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for offering in &self.offerings {
            if !seen.insert(offering.id.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate disk offering {}",
                    offering.id
                )));
            }
            if offering.custom_size && offering.min_size_bytes > offering.max_size_bytes {
                return Err(Error::Configuration(format!(
                    "offering {} has min size above max size",
                    offering.id
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.id.as_str()) {
                return Err(Error::Configuration(format!("duplicate storage pool {}", pool.id)));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Pending Migration
// =============================================================================

/// State carried between `migrate_volume` and `complete_migration`
#[derive(Debug)]
pub(crate) struct PendingMigration {
    pub ticket: AdmissionTicket,
    pub source_pool_id: Option<String>,
    pub destination: StoragePool,
    /// Bytes reserved on the destination
    pub reserved_bytes: u64,
    pub new_offering_id: Option<String>,
    /// Resize applied once the volume has landed
    pub follow_up: Option<ResizePlan>,
    pub started_at: DateTime<Utc>,
}

/// In-flight migration as reported to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub volume_id: String,
    pub destination_pool_id: String,
    pub datastore_id: String,
    pub started_at: DateTime<Utc>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Orchestrates volume lifecycle, placement and migration admission
pub struct VolumeOrchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) catalog: StorageCatalog,
    pub(crate) volumes: Arc<VolumeStore>,
    pub(crate) admission: Arc<MigrationAdmissionController>,
    pub(crate) snapshots: Arc<SnapshotOrchestrator>,
    pub(crate) collaborators: Collaborators,
    pub(crate) pending_migrations: DashMap<String, PendingMigration>,
    /// Serializes device slot selection per instance
    pub(crate) instance_locks: DashMap<String, Arc<parking_lot::Mutex<()>>>,
    pub(crate) metrics: Arc<OrchestratorMetrics>,
}

impl VolumeOrchestrator {
    /// Create a new orchestrator
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;

        let metrics = Arc::new(OrchestratorMetrics::new()?);
        let volumes = Arc::new(VolumeStore::with_metrics(Arc::clone(&metrics)));
        let admission = MigrationAdmissionController::with_metrics(
            config.concurrent_migrations_per_target_datastore,
            Arc::clone(&metrics),
        );
        let snapshots = SnapshotOrchestrator::new(
            Arc::clone(&volumes),
            Arc::clone(&collaborators.snapshots),
            Arc::clone(&collaborators.hypervisor),
            Arc::clone(&metrics),
        );

        Ok(Arc::new(Self {
            config,
            catalog: StorageCatalog::new(),
            volumes,
            admission,
            snapshots,
            collaborators,
            pending_migrations: DashMap::new(),
            instance_locks: DashMap::new(),
            metrics,
        }))
    }

    /// Register the offerings and pools from the configuration
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing volume orchestrator");

        for offering in self.config.offerings.clone() {
            self.register_offering(offering);
        }
        for seed in self.config.pools.clone() {
            self.register_pool(seed.into()).await?;
        }

        info!(
            offerings = self.config.offerings.len(),
            pools = self.catalog.pool_count(),
            ceiling = self.admission.ceiling(),
            "Volume orchestrator initialized"
        );
        Ok(())
    }

    pub fn register_offering(&self, offering: DiskOffering) {
        self.catalog.add_offering(offering);
    }

    /// Register a pool and start accounting its capacity
    pub async fn register_pool(&self, pool: StoragePool) -> Result<()> {
        self.collaborators.capacity.track_pool(&pool).await?;
        self.catalog.add_pool(pool);
        Ok(())
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<OrchestratorMetrics> {
        &self.metrics
    }

    pub fn catalog(&self) -> &StorageCatalog {
        &self.catalog
    }

    /// Subscribe to committed lifecycle transitions
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.volumes.subscribe()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        self.volumes.get(volume_id)
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.volumes.list()
    }

    /// Whether a pool supports an offering's tags
    pub fn does_storage_pool_support_disk_offering(
        &self,
        pool_id: &str,
        offering_id: &str,
    ) -> Result<bool> {
        let pool = self.catalog.pool(pool_id)?;
        let offering = self.catalog.offering(offering_id)?;
        Ok(pool_supports_offering(&pool, &offering))
    }

    /// Whether a pool supports a comma-separated tag list
    pub fn does_storage_pool_support_disk_offering_tags(
        &self,
        pool_id: &str,
        tags: Option<&str>,
    ) -> Result<bool> {
        let pool = self.catalog.pool(pool_id)?;
        Ok(pool_supports_tags(&pool, tags))
    }

    /// Migrations currently holding an admission ticket
    pub fn list_migrations(&self) -> Vec<MigrationInfo> {
        let mut migrations: Vec<MigrationInfo> = self
            .pending_migrations
            .iter()
            .map(|entry| MigrationInfo {
                volume_id: entry.key().clone(),
                destination_pool_id: entry.destination.id.clone(),
                datastore_id: entry.destination.datastore_id.clone(),
                started_at: entry.started_at,
            })
            .collect();
        migrations.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        migrations
    }

    /// Change the per-datastore migration ceiling at runtime
    pub fn set_migration_ceiling(&self, ceiling: u64) {
        self.admission.set_ceiling(ceiling);
    }

    pub fn migration_ceiling(&self) -> u64 {
        self.admission.ceiling()
    }

    /// Outstanding migrations onto a datastore
    pub fn migrations_in_flight(&self, datastore_id: &str) -> u64 {
        self.admission.in_flight(datastore_id)
    }

    /// Overall status summary
    pub fn status(&self) -> OrchestratorStatus {
        let volumes = self.volumes.list();
        let mut volumes_by_state = BTreeMap::new();
        for volume in &volumes {
            *volumes_by_state.entry(volume.state.to_string()).or_insert(0u64) += 1;
        }

        OrchestratorStatus {
            healthy: true,
            volume_count: volumes.len() as u64,
            volumes_by_state,
            pool_count: self.catalog.pool_count() as u64,
            snapshot_count: self.snapshots.list(None).len() as u64,
            migrations_in_flight: self.pending_migrations.len() as u64,
            migration_ceiling: self.admission.ceiling(),
        }
    }

    // =========================================================================
    // Allocation and Creation
    // =========================================================================

    /// Accept a volume intent without touching storage
    pub async fn alloc_volume(&self, request: AllocVolumeRequest) -> Result<Volume> {
        if request.name.trim().is_empty() {
            return Err(Error::InvalidParameter("volume name must not be empty".to_string()));
        }

        let offering = self.catalog.offering(&request.disk_offering_id)?;
        let size = match &request.snapshot_id {
            Some(snapshot_id) => {
                let snapshot = self.snapshots.get(snapshot_id)?;
                if snapshot.state != SnapshotState::Ready {
                    return Err(Error::InvalidParameter(format!(
                        "snapshot {} is not ready",
                        snapshot_id
                    )));
                }
                snapshot.volume_size_bytes
            }
            None => resolve_allocation_size(&offering, request.size_bytes)?,
        };

        validate_iops(&offering, request.min_iops, request.max_iops)?;

        let mut volume = Volume::allocate(
            request.name,
            request.account_id,
            request.zone_id,
            offering.id.clone(),
            size,
        );
        if offering.custom_iops {
            volume.min_iops = request.min_iops.or(offering.min_iops);
            volume.max_iops = request.max_iops.or(offering.max_iops);
        } else {
            volume.min_iops = offering.min_iops;
            volume.max_iops = offering.max_iops;
        }
        if let Some(display) = request.display {
            volume.display = display;
        }

        let volume = self.volumes.insert(volume)?;
        info!(volume_id = %volume.id, offering = %offering.id, size, "Volume allocated");
        Ok(volume)
    }

    /// Create backing storage for an allocated volume.
    ///
    /// Without an explicit pool, the compatible pool in the volume's zone
    /// with the most free bytes is chosen.
    pub async fn create_volume(&self, volume_id: &str, pool_id: Option<&str>) -> Result<Volume> {
        let volume = self.volumes.get(volume_id)?;
        if !volume.state.accepts(VolumeEvent::CreateRequested) {
            return Err(Error::InvalidStateTransition {
                volume_id: volume.id,
                state: volume.state,
                event: VolumeEvent::CreateRequested,
            });
        }

        let offering = self.catalog.offering(&volume.disk_offering_id)?;
        let pool = self.place(&volume, &offering, pool_id).await?;

        self.collaborators
            .capacity
            .reserve(&pool.id, volume.size_bytes)
            .await?;

        let volume = match self
            .volumes
            .transit_with(volume_id, VolumeEvent::CreateRequested, |v| {
                v.pool_id = Some(pool.id.clone());
                Ok(())
            }) {
            Ok(volume) => volume,
            Err(err) => {
                self.release_capacity(&pool.id, volume.size_bytes).await;
                return Err(err);
            }
        };

        match self.collaborators.data_plane.create(&volume, &pool).await {
            Ok(created) => {
                let volume = self
                    .volumes
                    .transit_with(volume_id, VolumeEvent::CreateSucceeded, |v| {
                        v.path = Some(created.path);
                        v.format = created.format;
                        Ok(())
                    })?;
                info!(volume_id, pool_id = %pool.id, "Volume created");
                Ok(volume)
            }
            Err(err) => {
                error!(volume_id, pool_id = %pool.id, error = %err, "Volume creation failed");
                self.volumes
                    .transit_with(volume_id, VolumeEvent::CreateFailed, |v| {
                        v.pool_id = None;
                        Ok(())
                    })?;
                self.release_capacity(&pool.id, volume.size_bytes).await;
                Err(collaborator_error("data-plane", "create")(err))
            }
        }
    }

    /// Resolve the pool a new volume lands on
    pub(crate) async fn place(
        &self,
        volume: &Volume,
        offering: &DiskOffering,
        pool_id: Option<&str>,
    ) -> Result<StoragePool> {
        match pool_id {
            Some(pool_id) => {
                let pool = self.refreshed_pool(pool_id).await?;
                if pool.zone_id != volume.zone_id {
                    return Err(Error::placement(format!(
                        "pool {} is in zone {}, volume is in zone {}",
                        pool.id, pool.zone_id, volume.zone_id
                    )));
                }
                if !pool_supports_offering(&pool, offering) {
                    return Err(Error::placement(format!(
                        "pool {} does not support the tags of offering {}",
                        pool.id, offering.id
                    )));
                }
                if pool.available_bytes < volume.size_bytes {
                    return Err(Error::capacity(format!(
                        "pool {} has {} free bytes, volume needs {}",
                        pool.id, pool.available_bytes, volume.size_bytes
                    )));
                }
                Ok(pool)
            }
            None => {
                let candidates = self.refreshed_pools(&volume.zone_id).await?;
                let requirements = PoolRequirements {
                    offering,
                    required_bytes: volume.size_bytes,
                    zone_id: Some(volume.zone_id.as_str()),
                    exclude_pool: None,
                };
                PoolSelector::select(&requirements, &candidates)
                    .cloned()
                    .ok_or_else(|| {
                        Error::placement(format!(
                            "no pool in zone {} supports offering {} with {} free bytes",
                            volume.zone_id, offering.id, volume.size_bytes
                        ))
                    })
            }
        }
    }

    // =========================================================================
    // Destroy, Expunge, Recover
    // =========================================================================

    /// Soft-delete a volume; it stays recoverable until expunged
    pub async fn destroy_volume(&self, request: DestroyVolumeRequest) -> Result<Volume> {
        let volume = self.volumes.get(&request.volume_id)?;
        ensure_destroyable(&volume)?;

        if volume.is_attached() {
            if !request.force {
                return Err(Error::DestructiveOperationRejected {
                    volume_id: volume.id,
                    reason: "volume is attached; detach it or force the destroy".to_string(),
                });
            }
            info!(volume_id = %volume.id, "Force-detaching volume before destroy");
            self.detach_volume_from_vm(DetachVolumeRequest {
                volume_id: volume.id.clone(),
                instance_id: None,
            })
            .await?;
        }

        let volume = self
            .volumes
            .transit_with(&request.volume_id, VolumeEvent::DestroyRequested, |v| {
                ensure_destroyable(v)?;
                if v.is_attached() {
                    return Err(Error::DestructiveOperationRejected {
                        volume_id: v.id.clone(),
                        reason: "volume was attached concurrently".to_string(),
                    });
                }
                Ok(())
            })?;
        info!(volume_id = %volume.id, "Volume destroyed");

        if request.expunge {
            return self.expunge_volume(&volume.id).await;
        }
        Ok(volume)
    }

    /// Permanently remove a destroyed volume
    pub async fn expunge_volume(&self, volume_id: &str) -> Result<Volume> {
        let volume = self.volumes.transit(volume_id, VolumeEvent::ExpungeRequested)?;

        if let Err(err) = self.collaborators.data_plane.expunge(&volume).await {
            error!(volume_id, error = %err, "Expunge failed, volume stays destroyed");
            self.volumes.transit(volume_id, VolumeEvent::ExpungeFailed)?;
            return Err(collaborator_error("data-plane", "expunge")(err));
        }

        let pool_id = volume.pool_id.clone();
        let volume = self
            .volumes
            .transit_with(volume_id, VolumeEvent::ExpungeSucceeded, |v| {
                v.pool_id = None;
                v.path = None;
                Ok(())
            })?;

        if let Some(pool_id) = pool_id {
            self.release_capacity(&pool_id, volume.size_bytes).await;
        }

        info!(volume_id, "Volume expunged");
        Ok(volume)
    }

    /// Bring a destroyed volume back
    pub async fn recover_volume(&self, volume_id: &str) -> Result<Volume> {
        let volume = self.volumes.transit(volume_id, VolumeEvent::RecoverRequested)?;
        info!(volume_id, "Volume recovered");
        Ok(volume)
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Change metadata; never the lifecycle state
    pub async fn update_volume(&self, request: UpdateVolumeRequest) -> Result<Volume> {
        if let Some(name) = &request.name {
            if name.trim().is_empty() {
                return Err(Error::InvalidParameter("volume name must not be empty".to_string()));
            }
        }

        // Re-pointing a volume moves its reservation to the new pool
        let current = self.volumes.get(&request.volume_id)?;
        let relocation = match &request.pool_id {
            Some(pool_id) if current.pool_id.as_deref() != Some(pool_id.as_str()) => {
                let pool = self.catalog.pool(pool_id)?;
                self.ensure_pool_fits(&current, &current.disk_offering_id, &pool)?;
                self.collaborators
                    .capacity
                    .reserve(&pool.id, current.size_bytes)
                    .await?;
                Some(pool)
            }
            _ => None,
        };

        let updated = self.volumes.update(&request.volume_id, |v| {
            if let Some(pool) = &relocation {
                if v.pool_id != current.pool_id || v.size_bytes != current.size_bytes {
                    return Err(Error::ConcurrentModification {
                        volume_id: v.id.clone(),
                        expected: current.version,
                        actual: v.version,
                    });
                }
                self.ensure_pool_fits(v, &v.disk_offering_id, pool)?;
                v.pool_id = Some(pool.id.clone());
            }
            if let Some(name) = request.name {
                v.name = name;
            }
            if let Some(path) = request.path {
                v.path = Some(path);
            }
            if let Some(chain_info) = request.chain_info {
                v.chain_info = Some(chain_info);
            }
            if let Some(display) = request.display {
                v.display = display;
            }
            if let Some(delete_protection) = request.delete_protection {
                v.delete_protection = delete_protection;
            }
            if let Some(custom_id) = request.custom_id {
                v.custom_id = Some(custom_id);
            }
            Ok(())
        });

        let volume = match updated {
            Ok(volume) => volume,
            Err(err) => {
                if let Some(pool) = &relocation {
                    self.release_capacity(&pool.id, current.size_bytes).await;
                }
                return Err(err);
            }
        };

        if let (Some(pool), Some(old_pool)) = (&relocation, &current.pool_id) {
            self.release_capacity(old_pool, current.size_bytes).await;
            info!(volume_id = %volume.id, from = %old_pool, to = %pool.id, "Volume re-pointed");
        }

        debug!(volume_id = %volume.id, version = volume.version, "Volume metadata updated");
        Ok(volume)
    }

    /// Zone and tag check for placing `volume` under `offering_id` on `pool`
    fn ensure_pool_fits(
        &self,
        volume: &Volume,
        offering_id: &str,
        pool: &StoragePool,
    ) -> Result<()> {
        if pool.zone_id != volume.zone_id {
            return Err(Error::placement(format!(
                "pool {} is in zone {}, volume is in zone {}",
                pool.id, pool.zone_id, volume.zone_id
            )));
        }
        let offering = self.catalog.offering(offering_id)?;
        if !pool_supports_offering(pool, &offering) {
            return Err(Error::placement(format!(
                "pool {} does not support the tags of offering {}",
                pool.id, offering.id
            )));
        }
        Ok(())
    }

    /// Move a detached volume to another account
    pub async fn assign_volume_to_account(
        &self,
        volume_id: &str,
        account_id: &str,
    ) -> Result<Volume> {
        if account_id.trim().is_empty() {
            return Err(Error::InvalidParameter("account must not be empty".to_string()));
        }

        let volume = self.volumes.update(volume_id, |v| {
            if !matches!(v.state, VolumeState::Ready | VolumeState::Allocated) {
                return Err(Error::InvalidParameter(format!(
                    "volume {} is {}; only allocated or ready volumes can change owner",
                    v.id, v.state
                )));
            }
            if v.is_attached() {
                return Err(Error::InvalidParameter(format!(
                    "volume {} is attached; detach it before assigning it",
                    v.id
                )));
            }
            if v.account_id == account_id {
                return Err(Error::InvalidParameter(format!(
                    "volume {} already belongs to account {}",
                    v.id, account_id
                )));
            }
            v.account_id = account_id.to_string();
            Ok(())
        })?;

        info!(volume_id, account_id, "Volume assigned to account");
        Ok(volume)
    }

    /// Apply an event directly.
    ///
    /// Privileged: bypasses the operation-level checks but not the
    /// transition table. Completing a migration this way releases its
    /// admission ticket.
    pub async fn state_transit_to(&self, volume_id: &str, event: VolumeEvent) -> Result<Volume> {
        warn!(volume_id, %event, "Privileged state transition requested");
        let volume = self.volumes.transit(volume_id, event)?;

        if matches!(event, VolumeEvent::MigrateSucceeded | VolumeEvent::MigrateFailed) {
            if let Some((_, pending)) = self.pending_migrations.remove(volume_id) {
                self.release_capacity(&pending.destination.id, pending.reserved_bytes)
                    .await;
                pending.ticket.release();
            }
        }

        Ok(volume)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    pub fn alloc_snapshot(
        &self,
        volume_id: &str,
        policy_id: Option<String>,
        name: Option<String>,
        location_type: LocationType,
        zone_ids: Vec<String>,
    ) -> Result<Snapshot> {
        self.snapshots
            .alloc_snapshot(volume_id, policy_id, name, location_type, zone_ids)
    }

    pub async fn take_snapshot(&self, request: TakeSnapshotRequest) -> Result<Snapshot> {
        self.snapshots.take_snapshot(request).await
    }

    pub fn alloc_snapshot_for_vm(
        &self,
        vm_id: &str,
        volume_id: &str,
        name: Option<String>,
        vm_snapshot_id: &str,
    ) -> Result<Snapshot> {
        self.snapshots
            .alloc_snapshot_for_vm(vm_id, volume_id, name, vm_snapshot_id)
    }

    pub async fn retry_snapshot_replication(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.snapshots.retry_replication(snapshot_id).await
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.snapshots.get(snapshot_id)
    }

    pub fn list_snapshots(&self, volume_id: Option<&str>) -> Vec<Snapshot> {
        self.snapshots.list(volume_id)
    }

    // =========================================================================
    // Capacity helpers
    // =========================================================================

    /// Pool with its free capacity read from the ledger
    pub(crate) async fn refreshed_pool(&self, pool_id: &str) -> Result<StoragePool> {
        let available = self.collaborators.capacity.available(pool_id).await?;
        self.catalog.set_available(pool_id, available)?;
        self.catalog.pool(pool_id)
    }

    /// Pools in a zone with fresh free capacity
    pub(crate) async fn refreshed_pools(&self, zone_id: &str) -> Result<Vec<StoragePool>> {
        let mut pools = Vec::new();
        for pool in self.catalog.pools_in_zone(zone_id) {
            pools.push(self.refreshed_pool(&pool.id).await?);
        }
        Ok(pools)
    }

    /// Give bytes back, logging rather than failing
    pub(crate) async fn release_capacity(&self, pool_id: &str, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if let Err(err) = self.collaborators.capacity.release(pool_id, bytes).await {
            warn!(pool_id, bytes, error = %err, "Failed to release pool capacity");
        }
    }
}

/// Orchestrator status summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    pub healthy: bool,
    pub volume_count: u64,
    pub volumes_by_state: BTreeMap<String, u64>,
    pub pool_count: u64,
    pub snapshot_count: u64,
    pub migrations_in_flight: u64,
    pub migration_ceiling: u64,
}

fn ensure_destroyable(volume: &Volume) -> Result<()> {
    if volume.delete_protection {
        return Err(Error::DestructiveOperationRejected {
            volume_id: volume.id.clone(),
            reason: "delete protection is enabled".to_string(),
        });
    }
    if volume.is_root() {
        return Err(Error::DestructiveOperationRejected {
            volume_id: volume.id.clone(),
            reason: "root volumes are destroyed with their instance".to_string(),
        });
    }
    Ok(())
}

/// Wrap a collaborator error unless it already names its collaborator
pub(crate) fn collaborator_error(
    collaborator: &'static str,
    step: &'static str,
) -> impl Fn(Error) -> Error {
    move |err| match err {
        err @ Error::ExternalCollaboratorFailure { .. } => err,
        other => Error::collaborator(collaborator, step, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::{Harness, GIB};
    use crate::error::AllocationErrorKind;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_alloc_and_create_picks_most_free_compatible_pool() {
        let h = Harness::new().await;
        let volume = h.ready_volume("ssd", None).await;

        assert_eq!(volume.state, VolumeState::Ready);
        assert_eq!(volume.pool_id.as_deref(), Some("ssd-2"));
        assert!(volume.path.is_some());
        assert_eq!(h.memory.capacity.reserved("ssd-2"), 10 * GIB);
    }

    #[tokio::test]
    async fn test_alloc_rejects_out_of_range_size() {
        let h = Harness::new().await;
        let err = h
            .orchestrator
            .alloc_volume(AllocVolumeRequest {
                name: "data".into(),
                account_id: "acct-1".into(),
                zone_id: "zone-a".into(),
                disk_offering_id: "custom".into(),
                size_bytes: Some(5000 * GIB),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.allocation_kind(), Some(crate::error::AllocationErrorKind::Sizing));
        assert!(h.orchestrator.list_volumes().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_rolls_back() {
        let h = Harness::new().await;
        h.memory.data_plane.faults().fail("create", 1);

        let volume = h.alloc("plain", None).await;
        let err = h
            .orchestrator
            .create_volume(&volume.id, None)
            .await
            .unwrap_err();
        assert_matches!(err, Error::ExternalCollaboratorFailure { .. });

        let volume = h.orchestrator.get_volume(&volume.id).unwrap();
        assert_eq!(volume.state, VolumeState::Failed);
        assert_eq!(volume.pool_id, None);
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 0);
    }

    #[tokio::test]
    async fn test_create_on_explicit_incompatible_pool() {
        let h = Harness::new().await;
        let volume = h.alloc("ssd", None).await;

        let err = h
            .orchestrator
            .create_volume(&volume.id, Some("hdd-1"))
            .await
            .unwrap_err();
        assert_eq!(err.allocation_kind(), Some(crate::error::AllocationErrorKind::Placement));
        assert_eq!(
            h.orchestrator.get_volume(&volume.id).unwrap().state,
            VolumeState::Allocated
        );
    }

    #[tokio::test]
    async fn test_destroy_recover_then_expunge() {
        let h = Harness::new().await;
        let volume = h.ready_volume("plain", None).await;

        let destroyed = h
            .orchestrator
            .destroy_volume(DestroyVolumeRequest {
                volume_id: volume.id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(destroyed.state, VolumeState::Destroyed);

        let recovered = h.orchestrator.recover_volume(&volume.id).await.unwrap();
        assert_eq!(recovered.state, VolumeState::Ready);

        let expunged = h
            .orchestrator
            .destroy_volume(DestroyVolumeRequest {
                volume_id: volume.id.clone(),
                expunge: true,
                force: false,
            })
            .await
            .unwrap();
        assert_eq!(expunged.state, VolumeState::Expunged);
        assert!(expunged.removed_at.is_some());
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 0);

        let err = h.orchestrator.recover_volume(&volume.id).await.unwrap_err();
        assert_matches!(
            err,
            Error::InvalidStateTransition {
                state: VolumeState::Expunged,
                event: VolumeEvent::RecoverRequested,
                ..
            }
        );
    }

    #[tokio::test]
    async fn test_expunge_failure_returns_to_destroyed() {
        let h = Harness::new().await;
        let volume = h.ready_volume("plain", None).await;
        h.orchestrator
            .destroy_volume(DestroyVolumeRequest {
                volume_id: volume.id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();

        h.memory.data_plane.faults().fail("expunge", 1);
        assert!(h.orchestrator.expunge_volume(&volume.id).await.is_err());
        assert_eq!(
            h.orchestrator.get_volume(&volume.id).unwrap().state,
            VolumeState::Destroyed
        );

        let recovered = h.orchestrator.recover_volume(&volume.id).await.unwrap();
        assert_eq!(recovered.state, VolumeState::Ready);
    }

    #[tokio::test]
    async fn test_destroy_guards() {
        let h = Harness::new().await;
        let volume = h.ready_volume("plain", None).await;

        h.orchestrator
            .update_volume(UpdateVolumeRequest {
                volume_id: volume.id.clone(),
                delete_protection: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = h
            .orchestrator
            .destroy_volume(DestroyVolumeRequest {
                volume_id: volume.id.clone(),
                force: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::DestructiveOperationRejected { .. });

        let attached = h.ready_volume("plain", Some("vm-1")).await;
        let err = h
            .orchestrator
            .destroy_volume(DestroyVolumeRequest {
                volume_id: attached.id.clone(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::DestructiveOperationRejected { .. });

        let destroyed = h
            .orchestrator
            .destroy_volume(DestroyVolumeRequest {
                volume_id: attached.id.clone(),
                force: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(destroyed.state, VolumeState::Destroyed);
        assert!(!destroyed.is_attached());
    }

    #[tokio::test]
    async fn test_assign_requires_detached() {
        let h = Harness::new().await;
        let attached = h.ready_volume("plain", Some("vm-1")).await;

        let err = h
            .orchestrator
            .assign_volume_to_account(&attached.id, "acct-2")
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidParameter(_));

        let detached = h.ready_volume("plain", None).await;
        let moved = h
            .orchestrator
            .assign_volume_to_account(&detached.id, "acct-2")
            .await
            .unwrap();
        assert_eq!(moved.account_id, "acct-2");
        assert_eq!(moved.state, VolumeState::Ready);
    }

    #[tokio::test]
    async fn test_update_volume_never_changes_state() {
        let h = Harness::new().await;
        let volume = h.ready_volume("plain", None).await;

        let updated = h
            .orchestrator
            .update_volume(UpdateVolumeRequest {
                volume_id: volume.id.clone(),
                name: Some("renamed".into()),
                chain_info: Some("{\"chain\":[]}".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.state, VolumeState::Ready);
        assert!(updated.version > volume.version);

        let moved = h
            .orchestrator
            .update_volume(UpdateVolumeRequest {
                volume_id: volume.id.clone(),
                pool_id: Some("ssd-1".into()),
                ..Default::default()
            })
            .await;
        assert!(moved.is_ok(), "untagged offering fits any pool");
    }

    #[tokio::test]
    async fn test_update_pool_moves_reservation() {
        let h = Harness::new().await;
        let volume = h.ready_volume("plain", None).await;
        assert_eq!(volume.pool_id.as_deref(), Some("hdd-1"));
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 10 * GIB);

        // remote-1 lives in another zone
        let err = h
            .orchestrator
            .update_volume(UpdateVolumeRequest {
                volume_id: volume.id.clone(),
                pool_id: Some("remote-1".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.allocation_kind(), Some(AllocationErrorKind::Placement));
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 10 * GIB);
        assert_eq!(h.memory.capacity.reserved("remote-1"), 0);

        let moved = h
            .orchestrator
            .update_volume(UpdateVolumeRequest {
                volume_id: volume.id.clone(),
                pool_id: Some("ssd-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(moved.pool_id.as_deref(), Some("ssd-1"));
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 0);
        assert_eq!(h.memory.capacity.reserved("ssd-1"), 10 * GIB);

        h.orchestrator
            .destroy_volume(DestroyVolumeRequest {
                volume_id: volume.id.clone(),
                expunge: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 0);
        assert_eq!(h.memory.capacity.reserved("ssd-1"), 0);

        // Tags are checked against the volume's offering
        let hdd = h.ready_volume("hdd", None).await;
        let err = h
            .orchestrator
            .update_volume(UpdateVolumeRequest {
                volume_id: hdd.id.clone(),
                pool_id: Some("ssd-1".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.allocation_kind(), Some(AllocationErrorKind::Placement));
        assert_eq!(h.memory.capacity.reserved("ssd-1"), 0);
    }

    #[tokio::test]
    async fn test_support_queries() {
        let h = Harness::new().await;
        let o = &h.orchestrator;

        assert!(o.does_storage_pool_support_disk_offering("ssd-1", "ssd").unwrap());
        assert!(!o.does_storage_pool_support_disk_offering("hdd-1", "ssd").unwrap());
        assert!(o.does_storage_pool_support_disk_offering_tags("ssd-1", None).unwrap());
        assert!(o.does_storage_pool_support_disk_offering_tags("ssd-2", Some("ssd,fast")).unwrap());
        assert!(!o
            .does_storage_pool_support_disk_offering_tags("ssd-1", Some("ssd,fast"))
            .unwrap());
        assert!(o
            .does_storage_pool_support_disk_offering("nope", "ssd")
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_state_transit_to_uses_the_table() {
        let h = Harness::new().await;
        let volume = h.ready_volume("plain", None).await;

        let err = h
            .orchestrator
            .state_transit_to(&volume.id, VolumeEvent::ExpungeSucceeded)
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidStateTransition { .. });

        let destroyed = h
            .orchestrator
            .state_transit_to(&volume.id, VolumeEvent::DestroyRequested)
            .await
            .unwrap();
        assert_eq!(destroyed.state, VolumeState::Destroyed);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let h = Harness::new().await;
        h.ready_volume("plain", None).await;
        h.alloc("plain", None).await;

        let status = h.orchestrator.status();
        assert_eq!(status.volume_count, 2);
        assert_eq!(status.volumes_by_state.get("Ready"), Some(&1));
        assert_eq!(status.volumes_by_state.get("Allocated"), Some(&1));
        assert_eq!(status.pool_count, 4);
    }

    #[test]
    fn test_config_yaml_dotted_keys() {
        let yaml = r#"
concurrent.migrations.per.target.datastore: 2
use.https.to.upload: false
offerings:
  - id: gold
    name: Gold
    tags: [ssd]
    size_bytes: 1073741824
pools:
  - id: p1
    datastore_id: ds-1
    zone_id: zone-a
    capacity_bytes: 1099511627776
    tags: [ssd, fast]
"#;
        let config = OrchestratorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.concurrent_migrations_per_target_datastore, 2);
        assert!(!config.use_https_to_upload);
        assert_eq!(config.max_data_volumes_per_vm, 6);
        assert_eq!(config.offerings[0].tags.len(), 1);

        let pool: StoragePool = config.pools[0].clone().into();
        assert_eq!(pool.available_bytes, pool.capacity_bytes);
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = OrchestratorConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.concurrent_migrations_per_target_datastore, 0);
        assert!(config.use_https_to_upload);

        let duplicate = r#"
pools:
  - { id: p1, datastore_id: ds-1, zone_id: z, capacity_bytes: 1 }
  - { id: p1, datastore_id: ds-1, zone_id: z, capacity_bytes: 1 }
"#;
        assert_matches!(
            OrchestratorConfig::from_yaml_str(duplicate),
            Err(Error::Configuration(_))
        );
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.yaml");
        std::fs::write(&path, "concurrent.migrations.per.target.datastore: 4\n").unwrap();

        let config = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(config.concurrent_migrations_per_target_datastore, 4);

        assert_matches!(
            OrchestratorConfig::load(dir.path().join("missing.yaml")),
            Err(Error::Io(_))
        );
    }
}
