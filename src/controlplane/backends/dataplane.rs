//! In-Memory Data Plane
//!
//! Stands in for the systems that actually create, move and resize volume
//! bytes. Backing volumes are tracked internally so tests can assert on
//! what the orchestrator asked for.

use super::faults::FaultPlan;
use crate::domain::model::{StoragePool, Volume};
use crate::domain::ports::{
    CheckAndRepairReport, CreatedVolume, DataPlane, ExtractMode, RepairScope, UploadedVolume,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

const COLLABORATOR: &str = "data-plane";

/// Backing volume as the data plane sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingVolume {
    pub volume_id: String,
    pub pool_id: String,
    pub path: String,
    pub size_bytes: u64,
}

/// Data plane kept in process memory
#[derive(Debug)]
pub struct InMemoryDataPlane {
    volumes: RwLock<BTreeMap<String, BackingVolume>>,
    /// Migrations submitted and not yet observed
    migrations: RwLock<BTreeMap<String, String>>,
    /// Size reported for uploaded images
    upload_size_bytes: u64,
    faults: FaultPlan,
}

impl Default for InMemoryDataPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDataPlane {
    pub fn new() -> Self {
        Self {
            volumes: RwLock::new(BTreeMap::new()),
            migrations: RwLock::new(BTreeMap::new()),
            upload_size_bytes: 1024 * 1024 * 1024,
            faults: FaultPlan::new(),
        }
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    pub async fn backing(&self, volume_id: &str) -> Option<BackingVolume> {
        self.volumes.read().await.get(volume_id).cloned()
    }

    /// Destination pool of a submitted migration
    pub async fn migration_target(&self, volume_id: &str) -> Option<String> {
        self.migrations.read().await.get(volume_id).cloned()
    }
}

#[async_trait]
impl DataPlane for InMemoryDataPlane {
    async fn create(&self, volume: &Volume, pool: &StoragePool) -> Result<CreatedVolume> {
        self.faults.check(COLLABORATOR, "create")?;

        let path = format!("{}/{}", pool.id, volume.id);
        self.volumes.write().await.insert(
            volume.id.clone(),
            BackingVolume {
                volume_id: volume.id.clone(),
                pool_id: pool.id.clone(),
                path: path.clone(),
                size_bytes: volume.size_bytes,
            },
        );

        info!(volume_id = %volume.id, pool_id = %pool.id, "Created backing volume");
        Ok(CreatedVolume {
            path,
            format: Some("qcow2".to_string()),
        })
    }

    async fn start_migration(&self, volume: &Volume, destination: &StoragePool) -> Result<()> {
        self.faults.check(COLLABORATOR, "migrate")?;

        self.migrations
            .write()
            .await
            .insert(volume.id.clone(), destination.id.clone());

        debug!(volume_id = %volume.id, destination = %destination.id, "Migration job submitted");
        Ok(())
    }

    async fn resize(&self, volume: &Volume, new_size_bytes: u64) -> Result<()> {
        self.faults.check(COLLABORATOR, "resize")?;

        let mut volumes = self.volumes.write().await;
        let backing = volumes
            .entry(volume.id.clone())
            .or_insert_with(|| BackingVolume {
                volume_id: volume.id.clone(),
                pool_id: volume.pool_id.clone().unwrap_or_default(),
                path: volume.path.clone().unwrap_or_default(),
                size_bytes: volume.size_bytes,
            });
        backing.size_bytes = new_size_bytes;

        debug!(volume_id = %volume.id, new_size_bytes, "Resized backing volume");
        Ok(())
    }

    async fn upload(
        &self,
        volume: &Volume,
        pool: &StoragePool,
        url: &str,
        format: &str,
    ) -> Result<UploadedVolume> {
        self.faults.check(COLLABORATOR, "upload")?;

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::collaborator(
                COLLABORATOR,
                "upload",
                format!("unsupported source url {}", url),
            ));
        }

        let path = format!("{}/{}.{}", pool.id, volume.id, format.to_lowercase());
        let size_bytes = volume.size_bytes.max(self.upload_size_bytes);
        self.volumes.write().await.insert(
            volume.id.clone(),
            BackingVolume {
                volume_id: volume.id.clone(),
                pool_id: pool.id.clone(),
                path: path.clone(),
                size_bytes,
            },
        );

        info!(volume_id = %volume.id, url, "Uploaded volume content");
        Ok(UploadedVolume { path, size_bytes })
    }

    async fn check_and_repair(
        &self,
        volume: &Volume,
        repair: Option<RepairScope>,
    ) -> Result<CheckAndRepairReport> {
        self.faults.check(COLLABORATOR, "check")?;

        let check_result = format!("{{\"image\":\"{}\",\"leaks\":0,\"corruptions\":0}}", volume.id);
        let repair_result = repair.map(|scope| match scope {
            RepairScope::Leaks => "{\"leaks-fixed\":0}".to_string(),
            RepairScope::All => "{\"leaks-fixed\":0,\"corruptions-fixed\":0}".to_string(),
        });

        Ok(CheckAndRepairReport {
            check_result,
            repair_result,
        })
    }

    async fn extract(&self, volume: &Volume, mode: ExtractMode) -> Result<String> {
        self.faults.check(COLLABORATOR, "extract")?;

        let scheme = match mode {
            ExtractMode::HttpDownload => "https",
            ExtractMode::FtpUpload => "ftp",
        };
        Ok(format!(
            "{}://extract.local/{}/{}",
            scheme,
            volume.zone_id,
            urlencoding::encode(&volume.id)
        ))
    }

    async fn expunge(&self, volume: &Volume) -> Result<()> {
        self.faults.check(COLLABORATOR, "expunge")?;

        self.volumes.write().await.remove(&volume.id);
        self.migrations.write().await.remove(&volume.id);

        info!(volume_id = %volume.id, "Expunged backing volume");
        Ok(())
    }
}
