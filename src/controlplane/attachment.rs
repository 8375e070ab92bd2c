//! Attach / Detach
//!
//! Device slot selection is serialized per instance; the slot is reserved
//! on the volume record in the same write as `AttachRequested`, so the
//! per-instance lock is released before the hypervisor is called.

use super::orchestrator::{collaborator_error, VolumeOrchestrator};
use crate::domain::model::{Volume, ROOT_DEVICE_ID};
use crate::domain::requests::{AttachVolumeRequest, DetachVolumeRequest};
use crate::error::{AllocationErrorKind, Error, Result};
use crate::lifecycle::VolumeEvent;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};

impl VolumeOrchestrator {
    /// Attach a volume to an instance
    pub async fn attach_volume_to_vm(&self, request: AttachVolumeRequest) -> Result<Volume> {
        if request.instance_id.trim().is_empty() {
            return Err(Error::InvalidParameter("instance must not be empty".to_string()));
        }

        let volume = self.reserve_device(&request)?;
        let device_id = volume.device_id.unwrap_or_default();

        match self
            .collaborators
            .hypervisor
            .attach(&request.instance_id, &volume, device_id)
            .await
        {
            Ok(()) => {
                let volume = self.volumes.transit(&volume.id, VolumeEvent::AttachSucceeded)?;
                info!(
                    volume_id = %volume.id,
                    instance_id = %request.instance_id,
                    device_id,
                    "Volume attached"
                );
                Ok(volume)
            }
            Err(err) => {
                error!(
                    volume_id = %volume.id,
                    instance_id = %request.instance_id,
                    error = %err,
                    "Attach failed"
                );
                self.volumes
                    .transit_with(&volume.id, VolumeEvent::AttachFailed, |v| {
                        v.instance_id = None;
                        v.device_id = None;
                        Ok(())
                    })?;
                Err(collaborator_error("hypervisor", "attach")(err))
            }
        }
    }

    /// Pick a device slot and commit `AttachRequested` under the instance lock
    fn reserve_device(&self, request: &AttachVolumeRequest) -> Result<Volume> {
        let lock = self.instance_lock(&request.instance_id);
        let _guard = lock.lock();

        let max_slot = self.config.max_data_volumes_per_vm;
        let used: BTreeSet<u32> = self
            .volumes
            .list_attached_to(&request.instance_id)
            .into_iter()
            .filter_map(|v| v.device_id)
            .collect();

        let device_id = match request.device_id {
            Some(ROOT_DEVICE_ID) => {
                return Err(Error::InvalidParameter(
                    "device 0 is reserved for the root volume".to_string(),
                ))
            }
            Some(device_id) if device_id > max_slot => {
                return Err(Error::InvalidParameter(format!(
                    "device {} is beyond the {} data volume slots",
                    device_id, max_slot
                )))
            }
            Some(device_id) if used.contains(&device_id) => {
                return Err(Error::InvalidParameter(format!(
                    "device {} is already in use on instance {}",
                    device_id, request.instance_id
                )))
            }
            Some(device_id) => device_id,
            None => (1..=max_slot)
                .find(|slot| !used.contains(slot))
                .ok_or_else(|| Error::ResourceAllocation {
                    kind: AllocationErrorKind::Limit,
                    reason: format!(
                        "instance {} already has {} data volumes attached",
                        request.instance_id, max_slot
                    ),
                })?,
        };

        self.volumes
            .transit_with(&request.volume_id, VolumeEvent::AttachRequested, |v| {
                if let Some(instance_id) = &v.instance_id {
                    return Err(Error::InvalidParameter(format!(
                        "volume {} is already attached to instance {}",
                        v.id, instance_id
                    )));
                }
                if v.pool_id.is_none() {
                    return Err(Error::InvalidParameter(format!(
                        "volume {} has no backing storage",
                        v.id
                    )));
                }
                v.instance_id = Some(request.instance_id.clone());
                v.device_id = Some(device_id);
                Ok(())
            })
    }

    /// Detach a volume from its instance
    pub async fn detach_volume_from_vm(&self, request: DetachVolumeRequest) -> Result<Volume> {
        let volume = self
            .volumes
            .transit_with(&request.volume_id, VolumeEvent::DetachRequested, |v| {
                let Some(attached_to) = v.instance_id.clone() else {
                    return Err(Error::InvalidParameter(format!(
                        "volume {} is not attached",
                        v.id
                    )));
                };
                if let Some(expected) = &request.instance_id {
                    if expected != &attached_to {
                        return Err(Error::InvalidParameter(format!(
                            "volume {} is attached to instance {}, not {}",
                            v.id, attached_to, expected
                        )));
                    }
                }
                if v.is_root() {
                    return Err(Error::InvalidParameter(format!(
                        "volume {} is the root disk of instance {}",
                        v.id, attached_to
                    )));
                }
                Ok(())
            })?;

        let instance_id = volume.instance_id.clone().unwrap_or_default();
        match self
            .collaborators
            .hypervisor
            .detach(&instance_id, &volume)
            .await
        {
            Ok(()) => {
                let volume = self
                    .volumes
                    .transit_with(&volume.id, VolumeEvent::DetachSucceeded, |v| {
                        v.instance_id = None;
                        v.device_id = None;
                        Ok(())
                    })?;
                info!(volume_id = %volume.id, instance_id, "Volume detached");
                Ok(volume)
            }
            Err(err) => {
                error!(volume_id = %volume.id, instance_id, error = %err, "Detach failed");
                self.volumes.transit(&volume.id, VolumeEvent::DetachFailed)?;
                Err(collaborator_error("hypervisor", "detach")(err))
            }
        }
    }

    /// Record the detach of a volume whose instance is being destroyed.
    ///
    /// The hypervisor is not contacted; root volumes are released too.
    pub async fn detach_volume_via_destroy_vm(
        &self,
        vm_id: &str,
        volume_id: &str,
    ) -> Result<Volume> {
        self.volumes
            .transit_with(volume_id, VolumeEvent::DetachRequested, |v| {
                if v.instance_id.as_deref() != Some(vm_id) {
                    return Err(Error::InvalidParameter(format!(
                        "volume {} is not attached to instance {}",
                        v.id, vm_id
                    )));
                }
                Ok(())
            })?;

        let volume = self
            .volumes
            .transit_with(volume_id, VolumeEvent::DetachSucceeded, |v| {
                v.instance_id = None;
                v.device_id = None;
                Ok(())
            })?;

        info!(volume_id, vm_id, "Volume released by instance destroy");
        Ok(volume)
    }

    fn instance_lock(&self, instance_id: &str) -> Arc<parking_lot::Mutex<()>> {
        Arc::clone(
            self.instance_locks
                .entry(instance_id.to_string())
                .or_default()
                .value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::Harness;
    use crate::lifecycle::VolumeState;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_attach_assigns_first_free_slot() {
        let h = Harness::new().await;
        let first = h.ready_volume("plain", Some("vm-1")).await;
        let second = h.ready_volume("plain", Some("vm-1")).await;

        assert_eq!(first.device_id, Some(1));
        assert_eq!(second.device_id, Some(2));
        assert_eq!(first.state, VolumeState::Ready);

        let devices = h.memory.hypervisor.devices("vm-1").await;
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn test_attach_explicit_slot_conflicts() {
        let h = Harness::new().await;
        h.ready_volume("plain", Some("vm-1")).await;
        let volume = h.ready_volume("plain", None).await;

        for device_id in [0, 1, 99] {
            let err = h
                .orchestrator
                .attach_volume_to_vm(AttachVolumeRequest {
                    volume_id: volume.id.clone(),
                    instance_id: "vm-1".into(),
                    device_id: Some(device_id),
                })
                .await
                .unwrap_err();
            assert_matches!(err, Error::InvalidParameter(_), "device {}", device_id);
        }
        assert_eq!(h.orchestrator.get_volume(&volume.id).unwrap().state, VolumeState::Ready);
    }

    #[tokio::test]
    async fn test_attach_limit() {
        let h = Harness::with_config(|c| c.max_data_volumes_per_vm = 2).await;
        h.ready_volume("plain", Some("vm-1")).await;
        h.ready_volume("plain", Some("vm-1")).await;
        let third = h.ready_volume("plain", None).await;

        let err = h
            .orchestrator
            .attach_volume_to_vm(AttachVolumeRequest {
                volume_id: third.id.clone(),
                instance_id: "vm-1".into(),
                device_id: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.allocation_kind(), Some(AllocationErrorKind::Limit));
    }

    #[tokio::test]
    async fn test_attach_failure_clears_reservation() {
        let h = Harness::new().await;
        let volume = h.ready_volume("plain", None).await;
        h.memory.hypervisor.faults().fail("attach", 1);

        let err = h
            .orchestrator
            .attach_volume_to_vm(AttachVolumeRequest {
                volume_id: volume.id.clone(),
                instance_id: "vm-1".into(),
                device_id: None,
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::ExternalCollaboratorFailure { .. });

        let volume = h.orchestrator.get_volume(&volume.id).unwrap();
        assert_eq!(volume.state, VolumeState::Ready);
        assert!(!volume.is_attached());
    }

    #[tokio::test]
    async fn test_concurrent_attaches_get_distinct_slots() {
        let h = Harness::new().await;
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(h.ready_volume("plain", None).await.id);
        }

        let tasks: Vec<_> = ids
            .iter()
            .map(|id| {
                let orchestrator = Arc::clone(&h.orchestrator);
                let id = id.clone();
                tokio::spawn(async move {
                    orchestrator
                        .attach_volume_to_vm(AttachVolumeRequest {
                            volume_id: id,
                            instance_id: "vm-1".into(),
                            device_id: None,
                        })
                        .await
                })
            })
            .collect();

        let mut slots = BTreeSet::new();
        for task in tasks {
            let volume = task.await.unwrap().unwrap();
            assert!(slots.insert(volume.device_id.unwrap()));
        }
        assert_eq!(slots, (1..=4).collect());
    }

    #[tokio::test]
    async fn test_detach_checks_instance() {
        let h = Harness::new().await;
        let volume = h.ready_volume("plain", Some("vm-1")).await;

        let err = h
            .orchestrator
            .detach_volume_from_vm(DetachVolumeRequest {
                volume_id: volume.id.clone(),
                instance_id: Some("vm-2".into()),
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidParameter(_));

        let detached = h
            .orchestrator
            .detach_volume_from_vm(DetachVolumeRequest {
                volume_id: volume.id.clone(),
                instance_id: Some("vm-1".into()),
            })
            .await
            .unwrap();
        assert!(!detached.is_attached());
        assert!(h.memory.hypervisor.devices("vm-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_detach_failure_keeps_attachment() {
        let h = Harness::new().await;
        let volume = h.ready_volume("plain", Some("vm-1")).await;
        h.memory.hypervisor.faults().fail("detach", 1);

        assert!(h
            .orchestrator
            .detach_volume_from_vm(DetachVolumeRequest {
                volume_id: volume.id.clone(),
                instance_id: None,
            })
            .await
            .is_err());

        let volume = h.orchestrator.get_volume(&volume.id).unwrap();
        assert_eq!(volume.state, VolumeState::Ready);
        assert_eq!(volume.instance_id.as_deref(), Some("vm-1"));
    }

    #[tokio::test]
    async fn test_detach_via_destroy_vm() {
        let h = Harness::new().await;
        let volume = h.ready_volume("plain", Some("vm-1")).await;

        assert!(h
            .orchestrator
            .detach_volume_via_destroy_vm("vm-2", &volume.id)
            .await
            .is_err());

        let released = h
            .orchestrator
            .detach_volume_via_destroy_vm("vm-1", &volume.id)
            .await
            .unwrap();
        assert!(!released.is_attached());
        assert_eq!(released.state, VolumeState::Ready);
    }
}
