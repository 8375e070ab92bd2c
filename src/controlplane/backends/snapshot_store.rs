//! In-Memory Snapshot Backend
//!
//! Captures are recorded per snapshot and replicas per zone. Replication
//! faults are armed per zone with the step name `replicate:<zone>`.

use super::faults::FaultPlan;
use crate::domain::model::{Snapshot, Volume};
use crate::domain::ports::SnapshotBackend;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const COLLABORATOR: &str = "snapshot-backend";

/// Snapshot backend kept in process memory
#[derive(Debug, Default)]
pub struct InMemorySnapshotBackend {
    captured: RwLock<BTreeMap<String, u64>>,
    replicas: RwLock<BTreeMap<String, BTreeSet<String>>>,
    /// Artificial replication latency
    replication_delay: Option<Duration>,
    faults: FaultPlan,
}

impl InMemorySnapshotBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose replications take `delay`
    pub fn with_replication_delay(delay: Duration) -> Self {
        Self {
            replication_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    pub async fn is_captured(&self, snapshot_id: &str) -> bool {
        self.captured.read().await.contains_key(snapshot_id)
    }

    /// Zones holding a replica of a snapshot
    pub async fn replica_zones(&self, snapshot_id: &str) -> BTreeSet<String> {
        self.replicas
            .read()
            .await
            .get(snapshot_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotBackend for InMemorySnapshotBackend {
    async fn capture(&self, snapshot: &Snapshot, volume: &Volume) -> Result<u64> {
        self.faults.check(COLLABORATOR, "capture")?;

        // Thin snapshots: report a tenth of the provisioned size
        let size = volume.size_bytes / 10;
        self.captured.write().await.insert(snapshot.id.clone(), size);

        debug!(snapshot_id = %snapshot.id, volume_id = %volume.id, size, "Captured snapshot");
        Ok(size)
    }

    async fn replicate(&self, snapshot: &Snapshot, zone_id: &str) -> Result<()> {
        if let Some(delay) = self.replication_delay {
            tokio::time::sleep(delay).await;
        }
        self.faults
            .check(COLLABORATOR, &format!("replicate:{}", zone_id))?;

        self.replicas
            .write()
            .await
            .entry(snapshot.id.clone())
            .or_default()
            .insert(zone_id.to_string());

        debug!(snapshot_id = %snapshot.id, zone_id, "Replicated snapshot");
        Ok(())
    }
}
