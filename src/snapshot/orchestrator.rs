//! Snapshot Orchestrator
//!
//! Allocates snapshot records, captures them on primary storage and fans
//! replication out to target zones. A snapshot is `Ready` as soon as the
//! primary capture succeeds; replica failures are recorded per zone and can
//! be retried without touching the zones that already succeeded.

use crate::domain::model::{
    generate_id, LocationType, ReplicaStatus, Snapshot, SnapshotState, Volume,
};
use crate::domain::ports::{HypervisorAttachRef, SnapshotBackendRef};
use crate::domain::requests::TakeSnapshotRequest;
use crate::error::{Error, Result};
use crate::lifecycle::{VolumeEvent, VolumeState, VolumeStore};
use crate::metrics::OrchestratorMetrics;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Coordinates snapshot capture and replication
pub struct SnapshotOrchestrator {
    volumes: Arc<VolumeStore>,
    snapshots: DashMap<String, Snapshot>,
    backend: SnapshotBackendRef,
    hypervisor: HypervisorAttachRef,
    metrics: Arc<OrchestratorMetrics>,
}

impl SnapshotOrchestrator {
    pub fn new(
        volumes: Arc<VolumeStore>,
        backend: SnapshotBackendRef,
        hypervisor: HypervisorAttachRef,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            volumes,
            snapshots: DashMap::new(),
            backend,
            hypervisor,
            metrics,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.snapshots
            .get(snapshot_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::SnapshotNotFound {
                snapshot_id: snapshot_id.to_string(),
            })
    }

    /// Snapshots, optionally of one volume, oldest first
    pub fn list(&self, volume_id: Option<&str>) -> Vec<Snapshot> {
        let mut snapshots: Vec<Snapshot> = self
            .snapshots
            .iter()
            .filter(|e| volume_id.map_or(true, |id| e.value().volume_id == id))
            .map(|e| e.value().clone())
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a snapshot record for a `Ready` volume.
    ///
    /// Takes no exclusive hold on the volume; the state check happens again
    /// when the snapshot is taken.
    pub fn alloc_snapshot(
        &self,
        volume_id: &str,
        policy_id: Option<String>,
        name: Option<String>,
        location_type: LocationType,
        zone_ids: Vec<String>,
    ) -> Result<Snapshot> {
        let volume = self.volumes.get(volume_id)?;
        ensure_ready(&volume, VolumeEvent::SnapshotRequested)?;

        let zone_ids = validate_zones(&volume, location_type, zone_ids)?;
        let snapshot = new_record(&volume, policy_id, name, location_type, zone_ids, None);

        info!(snapshot_id = %snapshot.id, volume_id, %location_type, "Allocated snapshot");
        self.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    /// Allocate a volume snapshot belonging to an instance snapshot
    pub fn alloc_snapshot_for_vm(
        &self,
        vm_id: &str,
        volume_id: &str,
        name: Option<String>,
        vm_snapshot_id: &str,
    ) -> Result<Snapshot> {
        let volume = self.volumes.get(volume_id)?;
        if volume.instance_id.as_deref() != Some(vm_id) {
            return Err(Error::InvalidParameter(format!(
                "volume {} is not attached to instance {}",
                volume_id, vm_id
            )));
        }
        ensure_ready(&volume, VolumeEvent::SnapshotRequested)?;

        let snapshot = new_record(
            &volume,
            None,
            name,
            LocationType::Primary,
            Vec::new(),
            Some(vm_snapshot_id.to_string()),
        );

        info!(
            snapshot_id = %snapshot.id,
            volume_id,
            vm_id,
            vm_snapshot_id,
            "Allocated instance volume snapshot"
        );
        self.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    // =========================================================================
    // Capture
    // =========================================================================

    /// Capture a snapshot and replicate it.
    ///
    /// With `async_backup` the call returns once the primary capture is
    /// durable and replication continues in the background. Otherwise it
    /// returns after every target zone has reported.
    pub async fn take_snapshot(
        self: &Arc<Self>,
        request: TakeSnapshotRequest,
    ) -> Result<Snapshot> {
        let volume = self.volumes.get(&request.volume_id)?;

        if request.quiesce_vm && !volume.is_attached() {
            return Err(Error::InvalidParameter(format!(
                "cannot quiesce: volume {} is not attached to an instance",
                volume.id
            )));
        }

        let mut snapshot = match &request.snapshot_id {
            Some(snapshot_id) => self.claim_allocated(snapshot_id, &volume.id)?,
            None => {
                let zone_ids =
                    validate_zones(&volume, request.location_type, request.zone_ids.clone())?;
                new_record(
                    &volume,
                    request.policy_id.clone(),
                    request.name.clone(),
                    request.location_type,
                    zone_ids,
                    None,
                )
            }
        };
        snapshot.async_backup = request.async_backup;
        snapshot.tags.extend(request.tags.clone());

        let volume = match self.volumes.transit(&volume.id, VolumeEvent::SnapshotRequested) {
            Ok(volume) => volume,
            Err(err) => {
                if request.snapshot_id.is_some() {
                    self.set_state(&snapshot.id, SnapshotState::Allocated);
                }
                return Err(err);
            }
        };

        snapshot.state = SnapshotState::BackingUp;
        self.snapshots.insert(snapshot.id.clone(), snapshot.clone());

        let captured = self.capture(&snapshot, &volume, request.quiesce_vm).await;
        let size = match captured {
            Ok(size) => size,
            Err(err) => {
                error!(
                    snapshot_id = %snapshot.id,
                    volume_id = %volume.id,
                    error = %err,
                    "Snapshot capture failed"
                );
                self.set_state(&snapshot.id, SnapshotState::Failed);
                self.volumes.transit(&volume.id, VolumeEvent::SnapshotFailed)?;
                return Err(err);
            }
        };

        snapshot.size_bytes = size;
        snapshot.state = SnapshotState::Ready;
        snapshot.replicas = snapshot
            .zone_ids
            .iter()
            .map(|zone| (zone.clone(), ReplicaStatus::Pending))
            .collect();
        self.snapshots.insert(snapshot.id.clone(), snapshot.clone());
        self.volumes.transit(&volume.id, VolumeEvent::SnapshotDone)?;

        info!(
            snapshot_id = %snapshot.id,
            volume_id = %volume.id,
            size,
            zones = snapshot.zone_ids.len(),
            "Snapshot captured"
        );

        if snapshot.zone_ids.is_empty() {
            return Ok(snapshot);
        }

        let zones = snapshot.zone_ids.clone();
        if request.async_backup {
            let this = Arc::clone(self);
            let snapshot_id = snapshot.id.clone();
            tokio::spawn(async move {
                this.replicate(&snapshot_id, zones).await;
            });
            return Ok(snapshot);
        }

        self.replicate(&snapshot.id, zones).await;
        self.get(&snapshot.id)
    }

    /// Re-run replication for the zones that failed
    pub async fn retry_replication(&self, snapshot_id: &str) -> Result<Snapshot> {
        let snapshot = self.get(snapshot_id)?;
        if snapshot.state != SnapshotState::Ready {
            return Err(Error::InvalidParameter(format!(
                "snapshot {} is {:?}; only ready snapshots can be replicated",
                snapshot_id, snapshot.state
            )));
        }

        let failed = snapshot.failed_zones();
        if failed.is_empty() {
            return Ok(snapshot);
        }

        info!(snapshot_id, zones = ?failed, "Retrying snapshot replication");
        self.replicate(snapshot_id, failed).await;
        self.get(snapshot_id)
    }

    /// Move a pre-allocated snapshot from `Allocated` to `BackingUp` under
    /// its map entry. Only one caller can win the claim.
    fn claim_allocated(&self, snapshot_id: &str, volume_id: &str) -> Result<Snapshot> {
        let mut entry = self
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| Error::SnapshotNotFound {
                snapshot_id: snapshot_id.to_string(),
            })?;

        if entry.volume_id != volume_id {
            return Err(Error::InvalidParameter(format!(
                "snapshot {} belongs to volume {}",
                snapshot_id, entry.volume_id
            )));
        }
        if entry.state != SnapshotState::Allocated {
            return Err(Error::InvalidParameter(format!(
                "snapshot {} was already taken",
                snapshot_id
            )));
        }

        entry.state = SnapshotState::BackingUp;
        Ok(entry.value().clone())
    }

    async fn capture(&self, snapshot: &Snapshot, volume: &Volume, quiesce: bool) -> Result<u64> {
        let instance = volume.instance_id.as_deref().filter(|_| quiesce);

        if let Some(instance_id) = instance {
            self.hypervisor
                .quiesce(instance_id)
                .await
                .map_err(|e| Error::collaborator("hypervisor", "quiesce", e))?;
        }

        let captured = self
            .backend
            .capture(snapshot, volume)
            .await
            .map_err(|e| Error::collaborator("snapshot-backend", "capture", e));

        if let Some(instance_id) = instance {
            if let Err(err) = self.hypervisor.thaw(instance_id).await {
                warn!(instance_id, error = %err, "Failed to thaw instance after snapshot");
            }
        }

        captured
    }

    /// Replicate to `zones` concurrently, recording each zone's outcome
    async fn replicate(&self, snapshot_id: &str, zones: Vec<String>) {
        let Ok(snapshot) = self.get(snapshot_id) else {
            return;
        };

        for zone in &zones {
            self.set_replica(snapshot_id, zone, ReplicaStatus::Pending);
        }

        let jobs = zones.iter().map(|zone| {
            let snapshot = &snapshot;
            async move {
                let outcome = self.backend.replicate(snapshot, zone).await;
                (zone, outcome)
            }
        });

        for (zone, outcome) in join_all(jobs).await {
            match outcome {
                Ok(()) => {
                    self.metrics.record_replication(true);
                    self.set_replica(snapshot_id, zone, ReplicaStatus::Replicated);
                }
                Err(err) => {
                    warn!(
                        snapshot_id,
                        zone_id = %zone,
                        error = %err,
                        "Snapshot replication failed"
                    );
                    self.metrics.record_replication(false);
                    self.set_replica(
                        snapshot_id,
                        zone,
                        ReplicaStatus::Failed {
                            reason: err.to_string(),
                        },
                    );
                }
            }
        }
    }

    fn set_state(&self, snapshot_id: &str, state: SnapshotState) {
        if let Some(mut snapshot) = self.snapshots.get_mut(snapshot_id) {
            snapshot.state = state;
        }
    }

    fn set_replica(&self, snapshot_id: &str, zone_id: &str, status: ReplicaStatus) {
        if let Some(mut snapshot) = self.snapshots.get_mut(snapshot_id) {
            snapshot.replicas.insert(zone_id.to_string(), status);
        }
    }
}

fn ensure_ready(volume: &Volume, event: VolumeEvent) -> Result<()> {
    if volume.state != VolumeState::Ready {
        return Err(Error::InvalidStateTransition {
            volume_id: volume.id.clone(),
            state: volume.state,
            event,
        });
    }
    Ok(())
}

/// Deduplicate target zones and check them against the location type
fn validate_zones(
    volume: &Volume,
    location_type: LocationType,
    zone_ids: Vec<String>,
) -> Result<Vec<String>> {
    let zones: BTreeSet<String> = zone_ids.into_iter().collect();

    if zones.contains(&volume.zone_id) {
        return Err(Error::InvalidParameter(format!(
            "zone {} is the volume's own zone and cannot be a replication target",
            volume.zone_id
        )));
    }

    match location_type {
        LocationType::Primary if !zones.is_empty() => Err(Error::InvalidParameter(
            "primary snapshots are not replicated to other zones".to_string(),
        )),
        LocationType::ZoneReplicated if zones.is_empty() => Err(Error::InvalidParameter(
            "zone-replicated snapshots need at least one target zone".to_string(),
        )),
        _ => Ok(zones.into_iter().collect()),
    }
}

fn new_record(
    volume: &Volume,
    policy_id: Option<String>,
    name: Option<String>,
    location_type: LocationType,
    zone_ids: Vec<String>,
    vm_snapshot_id: Option<String>,
) -> Snapshot {
    let now = Utc::now();
    let name = name.unwrap_or_else(|| format!("{}_{}", volume.name, now.format("%Y%m%d%H%M%S")));

    Snapshot {
        id: generate_id("snap"),
        name,
        volume_id: volume.id.clone(),
        policy_id,
        vm_snapshot_id,
        location_type,
        zone_ids,
        replicas: BTreeMap::new(),
        async_backup: false,
        tags: BTreeMap::new(),
        state: SnapshotState::Allocated,
        size_bytes: 0,
        volume_size_bytes: volume.size_bytes,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{InMemoryHypervisor, InMemorySnapshotBackend};
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Fixture {
        volumes: Arc<VolumeStore>,
        backend: Arc<InMemorySnapshotBackend>,
        hypervisor: Arc<InMemoryHypervisor>,
        snapshots: Arc<SnapshotOrchestrator>,
    }

    fn fixture_with(backend: InMemorySnapshotBackend) -> Fixture {
        let volumes = Arc::new(VolumeStore::new());
        let backend = Arc::new(backend);
        let hypervisor = Arc::new(InMemoryHypervisor::new());
        let metrics = Arc::new(OrchestratorMetrics::new().unwrap());
        let snapshots = SnapshotOrchestrator::new(
            Arc::clone(&volumes),
            backend.clone(),
            hypervisor.clone(),
            metrics,
        );
        Fixture {
            volumes,
            backend,
            hypervisor,
            snapshots,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(InMemorySnapshotBackend::new())
    }

    fn ready_volume(store: &VolumeStore, instance: Option<&str>) -> String {
        let mut volume = Volume::allocate("data", "acct-1", "zone-a", "small", 1000);
        volume.instance_id = instance.map(str::to_string);
        volume.device_id = instance.map(|_| 1);
        let id = volume.id.clone();
        store.insert(volume).unwrap();
        store.transit(&id, VolumeEvent::CreateSucceeded).unwrap();
        id
    }

    fn replicated(volume_id: &str, zones: &[&str], async_backup: bool) -> TakeSnapshotRequest {
        TakeSnapshotRequest {
            location_type: LocationType::ZoneReplicated,
            zone_ids: zones.iter().map(|z| z.to_string()).collect(),
            async_backup,
            ..TakeSnapshotRequest::primary(volume_id)
        }
    }

    #[tokio::test]
    async fn test_primary_snapshot_returns_volume_to_ready() {
        let f = fixture();
        let volume_id = ready_volume(&f.volumes, None);

        let snapshot = f
            .snapshots
            .take_snapshot(TakeSnapshotRequest::primary(&volume_id))
            .await
            .unwrap();

        assert_eq!(snapshot.state, SnapshotState::Ready);
        assert_eq!(snapshot.size_bytes, 100);
        assert!(f.backend.is_captured(&snapshot.id).await);
        assert_eq!(f.volumes.get(&volume_id).unwrap().state, VolumeState::Ready);
    }

    #[tokio::test]
    async fn test_failed_zone_recorded_and_retried() {
        let f = fixture();
        let volume_id = ready_volume(&f.volumes, None);
        f.backend.faults().fail("replicate:zone-c", 1);

        let snapshot = f
            .snapshots
            .take_snapshot(replicated(&volume_id, &["zone-b", "zone-c"], false))
            .await
            .unwrap();

        assert_eq!(snapshot.state, SnapshotState::Ready);
        assert_eq!(snapshot.replicas["zone-b"], ReplicaStatus::Replicated);
        assert_matches!(snapshot.replicas["zone-c"], ReplicaStatus::Failed { .. });
        assert_eq!(snapshot.failed_zones(), vec!["zone-c".to_string()]);

        let retried = f.snapshots.retry_replication(&snapshot.id).await.unwrap();
        assert!(retried.fully_replicated());
        assert_eq!(f.backend.replica_zones(&snapshot.id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_async_backup_returns_before_replication() {
        let f = fixture_with(InMemorySnapshotBackend::with_replication_delay(
            Duration::from_millis(50),
        ));
        let volume_id = ready_volume(&f.volumes, None);

        let snapshot = f
            .snapshots
            .take_snapshot(replicated(&volume_id, &["zone-b"], true))
            .await
            .unwrap();

        assert_eq!(snapshot.state, SnapshotState::Ready);
        assert_eq!(snapshot.replicas["zone-b"], ReplicaStatus::Pending);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(f.snapshots.get(&snapshot.id).unwrap().fully_replicated());
    }

    #[tokio::test]
    async fn test_capture_failure_marks_snapshot_failed() {
        let f = fixture();
        let volume_id = ready_volume(&f.volumes, None);
        f.backend.faults().fail("capture", 1);

        let err = f
            .snapshots
            .take_snapshot(TakeSnapshotRequest::primary(&volume_id))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ExternalCollaboratorFailure { .. });

        let snapshots = f.snapshots.list(Some(volume_id.as_str()));
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].state, SnapshotState::Failed);
        assert_eq!(f.volumes.get(&volume_id).unwrap().state, VolumeState::Ready);
    }

    #[tokio::test]
    async fn test_quiesce_requires_attachment() {
        let f = fixture();
        let detached = ready_volume(&f.volumes, None);

        let request = TakeSnapshotRequest {
            quiesce_vm: true,
            ..TakeSnapshotRequest::primary(&detached)
        };
        let err = f.snapshots.take_snapshot(request).await.unwrap_err();
        assert_matches!(err, Error::InvalidParameter(_));

        let attached = ready_volume(&f.volumes, Some("vm-1"));
        let request = TakeSnapshotRequest {
            quiesce_vm: true,
            ..TakeSnapshotRequest::primary(&attached)
        };
        f.snapshots.take_snapshot(request).await.unwrap();
        assert!(!f.hypervisor.is_quiesced("vm-1").await);
    }

    #[tokio::test]
    async fn test_allocated_snapshot_is_taken_once() {
        let f = fixture();
        let volume_id = ready_volume(&f.volumes, None);

        let allocated = f
            .snapshots
            .alloc_snapshot(&volume_id, Some("daily".into()), None, LocationType::Primary, vec![])
            .unwrap();
        assert_eq!(allocated.state, SnapshotState::Allocated);
        assert_eq!(allocated.policy_id.as_deref(), Some("daily"));

        let request = TakeSnapshotRequest {
            snapshot_id: Some(allocated.id.clone()),
            ..TakeSnapshotRequest::primary(&volume_id)
        };
        let taken = f.snapshots.take_snapshot(request.clone()).await.unwrap();
        assert_eq!(taken.id, allocated.id);
        assert_eq!(taken.state, SnapshotState::Ready);

        assert_matches!(
            f.snapshots.take_snapshot(request).await,
            Err(Error::InvalidParameter(_))
        );
    }

    #[tokio::test]
    async fn test_allocated_snapshot_claimed_by_one_caller() {
        let f = fixture();
        let volume_id = ready_volume(&f.volumes, None);
        let allocated = f
            .snapshots
            .alloc_snapshot(&volume_id, None, None, LocationType::Primary, vec![])
            .unwrap();

        let request = TakeSnapshotRequest {
            snapshot_id: Some(allocated.id.clone()),
            ..TakeSnapshotRequest::primary(&volume_id)
        };
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let snapshots = Arc::clone(&f.snapshots);
                let request = request.clone();
                tokio::spawn(async move { snapshots.take_snapshot(request).await })
            })
            .collect();

        let mut taken = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(snapshot) => {
                    assert_eq!(snapshot.state, SnapshotState::Ready);
                    taken += 1;
                }
                Err(err) => assert_matches!(
                    err,
                    Error::InvalidParameter(_) | Error::InvalidStateTransition { .. }
                ),
            }
        }
        assert_eq!(taken, 1);
        assert_eq!(f.volumes.get(&volume_id).unwrap().state, VolumeState::Ready);
    }

    #[tokio::test]
    async fn test_claim_released_when_volume_busy() {
        let f = fixture();
        let volume_id = ready_volume(&f.volumes, None);
        let allocated = f
            .snapshots
            .alloc_snapshot(&volume_id, None, None, LocationType::Primary, vec![])
            .unwrap();
        f.volumes
            .transit(&volume_id, VolumeEvent::ResizeRequested)
            .unwrap();

        let request = TakeSnapshotRequest {
            snapshot_id: Some(allocated.id.clone()),
            ..TakeSnapshotRequest::primary(&volume_id)
        };
        assert_matches!(
            f.snapshots.take_snapshot(request.clone()).await,
            Err(Error::InvalidStateTransition { .. })
        );
        assert_eq!(
            f.snapshots.get(&allocated.id).unwrap().state,
            SnapshotState::Allocated
        );

        f.volumes
            .transit(&volume_id, VolumeEvent::ResizeSucceeded)
            .unwrap();
        let taken = f.snapshots.take_snapshot(request).await.unwrap();
        assert_eq!(taken.state, SnapshotState::Ready);
    }

    #[tokio::test]
    async fn test_alloc_requires_ready_volume() {
        let f = fixture();
        let volume_id = ready_volume(&f.volumes, None);
        f.volumes.transit(&volume_id, VolumeEvent::DestroyRequested).unwrap();

        let err = f
            .snapshots
            .alloc_snapshot(&volume_id, None, None, LocationType::Primary, vec![])
            .unwrap_err();
        assert_matches!(err, Error::InvalidStateTransition { state: VolumeState::Destroyed, .. });
    }

    #[test]
    fn test_zone_validation() {
        let volume = Volume::allocate("data", "acct-1", "zone-a", "small", 10);

        assert!(validate_zones(&volume, LocationType::ZoneReplicated, vec![]).is_err());
        assert!(validate_zones(&volume, LocationType::Primary, vec!["zone-b".into()]).is_err());
        assert!(validate_zones(&volume, LocationType::Secondary, vec!["zone-a".into()]).is_err());

        let zones = validate_zones(
            &volume,
            LocationType::ZoneReplicated,
            vec!["zone-c".into(), "zone-b".into(), "zone-c".into()],
        )
        .unwrap();
        assert_eq!(zones, vec!["zone-b".to_string(), "zone-c".to_string()]);
    }

    #[test]
    fn test_alloc_for_vm_requires_attachment() {
        let f = fixture();
        let volume_id = ready_volume(&f.volumes, Some("vm-1"));

        let snapshot = f
            .snapshots
            .alloc_snapshot_for_vm("vm-1", &volume_id, None, "vmsnap-1")
            .unwrap();
        assert_eq!(snapshot.vm_snapshot_id.as_deref(), Some("vmsnap-1"));

        assert_matches!(
            f.snapshots.alloc_snapshot_for_vm("vm-2", &volume_id, None, "vmsnap-2"),
            Err(Error::InvalidParameter(_))
        );
    }
}
