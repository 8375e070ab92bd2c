//! Upload, Extract and Check-and-Repair
//!
//! Uploads come in two flavours. A direct upload hands the source URL to
//! the data plane and finishes in one call. A pre-signed upload returns
//! endpoint parameters and leaves the volume `Uploading` until the upload
//! endpoint reports back through `complete_upload`.

use super::orchestrator::{collaborator_error, VolumeOrchestrator};
use crate::domain::model::{StoragePool, Volume};
use crate::domain::ports::{CheckAndRepairReport, UploadParams};
use crate::domain::requests::{
    AllocVolumeRequest, CheckAndRepairRequest, ExtractVolumeRequest, UploadOutcome,
    UploadVolumeRequest,
};
use crate::error::{Error, Result};
use crate::lifecycle::{VolumeEvent, VolumeState};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Image formats accepted for upload
pub const UPLOAD_FORMATS: [&str; 6] = ["QCOW2", "RAW", "VHD", "VHDX", "VMDK", "OVA"];

/// A volume waiting for a pre-signed upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedUpload {
    pub volume: Volume,
    pub params: UploadParams,
}

impl VolumeOrchestrator {
    // =========================================================================
    // Upload
    // =========================================================================

    /// Create a volume from an image at an external URL
    pub async fn upload_volume(&self, request: UploadVolumeRequest) -> Result<Volume> {
        let url = match request.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => {
                return Err(Error::InvalidParameter(
                    "a source url is required for direct uploads".to_string(),
                ))
            }
        };
        let format = normalize_format(&request.format)?;

        let (volume, pool) = self.prepare_upload(&request, &format).await?;

        match self
            .collaborators
            .data_plane
            .upload(&volume, &pool, &url, &format)
            .await
        {
            Ok(uploaded) => {
                self.settle_upload(&volume, &pool.id, uploaded.path, uploaded.size_bytes)
                    .await
            }
            Err(err) => {
                error!(volume_id = %volume.id, url, error = %err, "Upload failed");
                self.fail_upload(&volume, &pool.id).await?;
                Err(collaborator_error("data-plane", "upload")(err))
            }
        }
    }

    /// Allocate a volume and return pre-signed upload parameters for it
    pub async fn get_upload_params(&self, request: UploadVolumeRequest) -> Result<PreparedUpload> {
        let format = normalize_format(&request.format)?;
        let (volume, pool) = self.prepare_upload(&request, &format).await?;

        match self
            .collaborators
            .upload_urls
            .upload_params(&volume, &pool, &format, self.config.use_https_to_upload)
            .await
        {
            Ok(params) => {
                info!(
                    volume_id = %volume.id,
                    post_url = %params.post_url,
                    "Upload parameters issued"
                );
                Ok(PreparedUpload { volume, params })
            }
            Err(err) => {
                self.fail_upload(&volume, &pool.id).await?;
                Err(collaborator_error("upload-urls", "sign")(err))
            }
        }
    }

    /// Report the outcome of a pre-signed upload
    pub async fn complete_upload(&self, volume_id: &str, outcome: UploadOutcome) -> Result<Volume> {
        let volume = self.volumes.get(volume_id)?;
        let event = match &outcome {
            UploadOutcome::Succeeded { .. } => VolumeEvent::UploadSucceeded,
            UploadOutcome::Failed { .. } => VolumeEvent::UploadFailed,
        };
        let pool_id = match (&volume.pool_id, volume.state) {
            (Some(pool_id), VolumeState::Uploading) => pool_id.clone(),
            _ => {
                return Err(Error::InvalidStateTransition {
                    volume_id: volume.id,
                    state: volume.state,
                    event,
                })
            }
        };

        match outcome {
            UploadOutcome::Succeeded { path, size_bytes } => {
                self.settle_upload(&volume, &pool_id, path, size_bytes).await
            }
            UploadOutcome::Failed { reason } => {
                warn!(volume_id, reason = %reason, "Upload reported as failed");
                self.fail_upload(&volume, &pool_id).await
            }
        }
    }

    /// Allocate, place and reserve a volume, leaving it `Uploading`
    async fn prepare_upload(
        &self,
        request: &UploadVolumeRequest,
        format: &str,
    ) -> Result<(Volume, StoragePool)> {
        let volume = self
            .alloc_volume(AllocVolumeRequest {
                name: request.name.clone(),
                account_id: request.account_id.clone(),
                zone_id: request.zone_id.clone(),
                disk_offering_id: request.disk_offering_id.clone(),
                size_bytes: request.size_bytes,
                ..Default::default()
            })
            .await?;

        let offering = self.catalog.offering(&volume.disk_offering_id)?;
        let pool = match self.place(&volume, &offering, None).await {
            Ok(pool) => pool,
            Err(err) => {
                self.abandon_allocation(&volume.id);
                return Err(err);
            }
        };

        if let Err(err) = self
            .collaborators
            .capacity
            .reserve(&pool.id, volume.size_bytes)
            .await
        {
            self.abandon_allocation(&volume.id);
            return Err(err);
        }

        let uploading = self
            .volumes
            .transit_with(&volume.id, VolumeEvent::UploadRequested, |v| {
                v.pool_id = Some(pool.id.clone());
                v.format = Some(format.to_string());
                Ok(())
            });
        match uploading {
            Ok(uploading) => Ok((uploading, pool)),
            Err(err) => {
                self.release_capacity(&pool.id, volume.size_bytes).await;
                Err(err)
            }
        }
    }

    /// Commit a finished upload, adjusting the reservation to the real size
    async fn settle_upload(
        &self,
        volume: &Volume,
        pool_id: &str,
        path: String,
        size_bytes: u64,
    ) -> Result<Volume> {
        let extra = size_bytes.saturating_sub(volume.size_bytes);
        if extra > 0 {
            if let Err(err) = self.collaborators.capacity.reserve(pool_id, extra).await {
                warn!(
                    volume_id = %volume.id,
                    pool_id,
                    extra,
                    "Uploaded image exceeds pool capacity"
                );
                self.fail_upload(volume, pool_id).await?;
                return Err(err);
            }
        }

        let ready = match self
            .volumes
            .transit_with(&volume.id, VolumeEvent::UploadSucceeded, |v| {
                v.path = Some(path);
                v.size_bytes = size_bytes;
                Ok(())
            }) {
            Ok(ready) => ready,
            Err(err) => {
                self.release_capacity(pool_id, extra).await;
                return Err(err);
            }
        };

        self.release_capacity(pool_id, volume.size_bytes.saturating_sub(size_bytes))
            .await;

        info!(volume_id = %volume.id, pool_id, size_bytes, "Upload completed");
        Ok(ready)
    }

    async fn fail_upload(&self, volume: &Volume, pool_id: &str) -> Result<Volume> {
        let failed = self
            .volumes
            .transit_with(&volume.id, VolumeEvent::UploadFailed, |v| {
                v.pool_id = None;
                Ok(())
            })?;
        self.release_capacity(pool_id, volume.size_bytes).await;
        Ok(failed)
    }

    /// Mark an allocation that never reached storage as failed
    fn abandon_allocation(&self, volume_id: &str) {
        if let Err(err) = self.volumes.transit(volume_id, VolumeEvent::CreateFailed) {
            warn!(volume_id, error = %err, "Failed to abandon allocation");
        }
    }

    // =========================================================================
    // Extract / Check
    // =========================================================================

    /// Make a volume downloadable and return where to fetch it
    pub async fn extract_volume(&self, request: ExtractVolumeRequest) -> Result<String> {
        let volume = self.volumes.get(&request.volume_id)?;
        ensure_ready(&volume, "extracted")?;
        if volume.is_attached() {
            return Err(Error::InvalidParameter(format!(
                "volume {} must be detached before it can be extracted",
                volume.id
            )));
        }

        let url = self
            .collaborators
            .data_plane
            .extract(&volume, request.mode)
            .await
            .map_err(collaborator_error("data-plane", "extract"))?;

        info!(volume_id = %volume.id, mode = ?request.mode, "Volume extracted");
        Ok(url)
    }

    /// Run a consistency check and optional repair on a volume
    pub async fn check_and_repair_volume(
        &self,
        request: CheckAndRepairRequest,
    ) -> Result<CheckAndRepairReport> {
        let volume = self.volumes.get(&request.volume_id)?;
        ensure_ready(&volume, "checked")?;

        let report = self
            .collaborators
            .data_plane
            .check_and_repair(&volume, request.repair)
            .await
            .map_err(collaborator_error("data-plane", "check"))?;

        info!(
            volume_id = %volume.id,
            repaired = report.repair_result.is_some(),
            "Volume checked"
        );
        Ok(report)
    }
}

fn normalize_format(format: &str) -> Result<String> {
    let format = format.trim().to_uppercase();
    if UPLOAD_FORMATS.contains(&format.as_str()) {
        Ok(format)
    } else {
        Err(Error::InvalidParameter(format!(
            "unsupported image format '{}'",
            format
        )))
    }
}

fn ensure_ready(volume: &Volume, what: &str) -> Result<()> {
    if volume.state != VolumeState::Ready {
        return Err(Error::InvalidParameter(format!(
            "volume {} is {} and cannot be {}",
            volume.id, volume.state, what
        )));
    }
    Ok(())
}
