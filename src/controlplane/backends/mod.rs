//! Collaborator Adapters
//!
//! In-memory implementations of every collaborator port, used by tests and
//! by the standalone binary:
//! - Capacity ledger: authoritative pool reservations
//! - Data plane: create / migrate / resize / upload / check / extract / expunge
//! - Hypervisor: attach, detach, quiesce
//! - Snapshot backend: capture and zone replication
//! - Upload URLs: pre-signed upload endpoints

pub mod dataplane;
pub mod faults;
pub mod hypervisor;
pub mod ledger;
pub mod snapshot_store;
pub mod upload;

pub use dataplane::*;
pub use faults::FaultPlan;
pub use hypervisor::*;
pub use ledger::*;
pub use snapshot_store::*;
pub use upload::*;

use crate::domain::ports::{
    CapacityAccountingRef, DataPlaneRef, HypervisorAttachRef, SnapshotBackendRef,
    UploadUrlGeneratorRef,
};
use std::sync::Arc;

/// The set of collaborators an orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub capacity: CapacityAccountingRef,
    pub data_plane: DataPlaneRef,
    pub hypervisor: HypervisorAttachRef,
    pub snapshots: SnapshotBackendRef,
    pub upload_urls: UploadUrlGeneratorRef,
}

/// In-memory collaborators, keeping typed handles for inspection
#[derive(Debug, Clone, Default)]
pub struct InMemoryCollaborators {
    pub capacity: Arc<InMemoryCapacityLedger>,
    pub data_plane: Arc<InMemoryDataPlane>,
    pub hypervisor: Arc<InMemoryHypervisor>,
    pub snapshots: Arc<InMemorySnapshotBackend>,
    pub upload_urls: Arc<SignedUploadUrls>,
}

impl InMemoryCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same collaborators with a custom snapshot backend
    pub fn with_snapshot_backend(mut self, snapshots: InMemorySnapshotBackend) -> Self {
        self.snapshots = Arc::new(snapshots);
        self
    }

    /// Type-erased handles for the orchestrator
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            capacity: self.capacity.clone(),
            data_plane: self.data_plane.clone(),
            hypervisor: self.hypervisor.clone(),
            snapshots: self.snapshots.clone(),
            upload_urls: self.upload_urls.clone(),
        }
    }
}

impl From<&InMemoryCollaborators> for Collaborators {
    fn from(in_memory: &InMemoryCollaborators) -> Self {
        in_memory.collaborators()
    }
}
