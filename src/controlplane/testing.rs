//! Test fixtures shared by the control plane tests

use super::backends::InMemoryCollaborators;
use super::orchestrator::{OrchestratorConfig, PoolSeed, VolumeOrchestrator};
use crate::domain::model::{DiskOffering, Volume};
use crate::domain::requests::{AllocVolumeRequest, AttachVolumeRequest};
use std::sync::Arc;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Orchestrator over in-memory collaborators with a small catalog.
///
/// Zone `zone-a` holds `hdd-1` (ds-1, 1000 GiB, {hdd}), `ssd-1` (ds-2,
/// 500 GiB, {ssd}) and `ssd-2` (ds-2, 800 GiB, {ssd, fast}). Zone
/// `zone-b` holds `remote-1` (ds-3, 1000 GiB, {ssd}).
pub struct Harness {
    pub orchestrator: Arc<VolumeOrchestrator>,
    pub memory: InMemoryCollaborators,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_ceiling(ceiling: u64) -> Self {
        Self::with_config(|c| c.concurrent_migrations_per_target_datastore = ceiling).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        let mut config = OrchestratorConfig {
            offerings: offerings(),
            pools: pools(),
            ..Default::default()
        };
        customize(&mut config);

        let memory = InMemoryCollaborators::new();
        let orchestrator = VolumeOrchestrator::new(config, memory.collaborators()).unwrap();
        orchestrator.initialize().await.unwrap();

        Self {
            orchestrator,
            memory,
        }
    }

    /// Allocated volume in `zone-a`
    pub async fn alloc(&self, offering: &str, size_bytes: Option<u64>) -> Volume {
        self.orchestrator
            .alloc_volume(AllocVolumeRequest {
                name: "data".into(),
                account_id: "acct-1".into(),
                zone_id: "zone-a".into(),
                disk_offering_id: offering.into(),
                size_bytes,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    /// Created volume, attached to `instance` when given
    pub async fn ready_volume(&self, offering: &str, instance: Option<&str>) -> Volume {
        let volume = self.alloc(offering, None).await;
        self.create_and_attach(volume, instance).await
    }

    /// Created volume of the custom-size offering
    pub async fn ready_custom_volume(&self, size_bytes: u64) -> Volume {
        let volume = self.alloc("custom", Some(size_bytes)).await;
        self.create_and_attach(volume, None).await
    }

    async fn create_and_attach(&self, volume: Volume, instance: Option<&str>) -> Volume {
        let volume = self
            .orchestrator
            .create_volume(&volume.id, None)
            .await
            .unwrap();

        match instance {
            Some(instance_id) => self
                .orchestrator
                .attach_volume_to_vm(AttachVolumeRequest {
                    volume_id: volume.id,
                    instance_id: instance_id.into(),
                    device_id: None,
                })
                .await
                .unwrap(),
            None => volume,
        }
    }
}

fn offerings() -> Vec<DiskOffering> {
    vec![
        DiskOffering::fixed("plain", 10 * GIB),
        DiskOffering::fixed("ssd", 10 * GIB).with_tags(["ssd"]),
        DiskOffering::fixed("ssd-fast", 10 * GIB).with_tags(["ssd", "fast"]),
        DiskOffering::fixed("ssd-large", 20 * GIB).with_tags(["ssd"]),
        DiskOffering::fixed("hdd", 10 * GIB).with_tags(["hdd"]),
        DiskOffering::custom("custom", GIB, 1000 * GIB),
        DiskOffering::custom("iops", GIB, 100 * GIB).with_custom_iops(Some(100), Some(5000)),
    ]
}

fn pools() -> Vec<PoolSeed> {
    let seed = |id: &str, datastore: &str, zone: &str, gib: u64, tags: &[&str]| PoolSeed {
        id: id.into(),
        datastore_id: datastore.into(),
        zone_id: zone.into(),
        capacity_bytes: gib * GIB,
        tags: tags.iter().map(|t| t.to_string()).collect(),
    };

    vec![
        seed("hdd-1", "ds-1", "zone-a", 1000, &["hdd"]),
        seed("ssd-1", "ds-2", "zone-a", 500, &["ssd"]),
        seed("ssd-2", "ds-2", "zone-a", 800, &["ssd", "fast"]),
        seed("remote-1", "ds-3", "zone-b", 1000, &["ssd"]),
    ]
}
