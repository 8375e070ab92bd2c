//! Volume Orchestrator - Volume Lifecycle & Placement Orchestration
//!
//! The decision-making core of a block storage control plane. It decides
//! where a volume may live, whether a resize or offering change is
//! allowed, when a migration may start, and how each operation moves a
//! volume through its lifecycle. Actual data movement is delegated to
//! collaborators behind async ports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                 Orchestration Façade (VolumeOrchestrator)            │
//! │      REST adapter (axum)  ·  health / metrics servers (hyper)        │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌───────────────┐  ┌───────────────┐  ┌─────────────────────────┐  │
//! │  │ Tag Matcher & │  │  Migration    │  │   Snapshot              │  │
//! │  │ Resize Valid. │  │  Admission    │  │   Orchestrator          │  │
//! │  └───────┬───────┘  └───────┬───────┘  └────────────┬────────────┘  │
//! │          └──────────────────┼───────────────────────┘               │
//! │                 ┌───────────┴───────────┐                           │
//! │                 │ Volume State Machine  │                           │
//! │                 │ (per-volume CAS store)│                           │
//! │                 └───────────────────────┘                           │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   Ports: capacity · data plane · hypervisor · snapshots · upload    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator façade, collaborator adapters and REST API
//! - [`placement`]: Tag matching, pool selection, resize validation
//! - [`admission`]: Per-datastore migration admission
//! - [`lifecycle`]: Volume state machine and the versioned volume store
//! - [`snapshot`]: Snapshot capture and zone replication
//! - [`domain`]: Records, requests and port traits
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod admission;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod placement;
pub mod snapshot;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, Collaborators, InMemoryCollaborators, OrchestratorConfig,
    OrchestratorStatus, VolumeOrchestrator,
};

pub use domain::model::{DiskOffering, Snapshot, StoragePool, Volume};

pub use domain::ports::{
    CapacityAccounting, DataPlane, HypervisorAttach, SnapshotBackend, UploadUrlGenerator,
};

pub use admission::{AdmissionTicket, MigrationAdmissionController};

pub use error::{Error, ErrorAction, Result};

pub use lifecycle::{LifecycleEvent, VolumeEvent, VolumeState};

pub use metrics::OrchestratorMetrics;

pub use placement::{pool_supports_offering, supports, PoolSelector, ResizeValidator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
