//! Snapshot - Capture and cross-zone replication of volume snapshots

pub mod orchestrator;

pub use orchestrator::SnapshotOrchestrator;
