//! In-Memory Hypervisor
//!
//! Records attachments and quiesce state per instance.

use super::faults::FaultPlan;
use crate::domain::model::Volume;
use crate::domain::ports::HypervisorAttach;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::debug;

const COLLABORATOR: &str = "hypervisor";

/// Hypervisor kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryHypervisor {
    /// instance -> device slot -> volume
    attachments: RwLock<BTreeMap<String, BTreeMap<u32, String>>>,
    quiesced: RwLock<BTreeSet<String>>,
    faults: FaultPlan,
}

impl InMemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Device slots in use on an instance
    pub async fn devices(&self, instance_id: &str) -> BTreeMap<u32, String> {
        self.attachments
            .read()
            .await
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn is_quiesced(&self, instance_id: &str) -> bool {
        self.quiesced.read().await.contains(instance_id)
    }
}

#[async_trait]
impl HypervisorAttach for InMemoryHypervisor {
    async fn attach(&self, instance_id: &str, volume: &Volume, device_id: u32) -> Result<()> {
        self.faults.check(COLLABORATOR, "attach")?;

        self.attachments
            .write()
            .await
            .entry(instance_id.to_string())
            .or_default()
            .insert(device_id, volume.id.clone());

        debug!(instance_id, volume_id = %volume.id, device_id, "Attached volume");
        Ok(())
    }

    async fn detach(&self, instance_id: &str, volume: &Volume) -> Result<()> {
        self.faults.check(COLLABORATOR, "detach")?;

        if let Some(devices) = self.attachments.write().await.get_mut(instance_id) {
            devices.retain(|_, attached| attached != &volume.id);
        }

        debug!(instance_id, volume_id = %volume.id, "Detached volume");
        Ok(())
    }

    async fn quiesce(&self, instance_id: &str) -> Result<()> {
        self.faults.check(COLLABORATOR, "quiesce")?;
        self.quiesced.write().await.insert(instance_id.to_string());
        Ok(())
    }

    async fn thaw(&self, instance_id: &str) -> Result<()> {
        self.faults.check(COLLABORATOR, "thaw")?;
        self.quiesced.write().await.remove(instance_id);
        Ok(())
    }
}
