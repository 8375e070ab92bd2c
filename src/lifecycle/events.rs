//! Lifecycle Events
//!
//! Every committed transition is published on a broadcast channel so that
//! external consumers (usage accounting, audit, tests) can follow volumes
//! without polling the store.

use super::state::{VolumeEvent, VolumeState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capacity of the lifecycle broadcast channel
pub const LIFECYCLE_CHANNEL_CAPACITY: usize = 1024;

/// A committed state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub volume_id: String,
    pub from: VolumeState,
    pub to: VolumeState,
    pub event: VolumeEvent,
    /// Volume version after the transition
    pub version: u64,
    pub at: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Whether the volume reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}
