//! Volume State Machine
//!
//! The authoritative lifecycle of a volume. Every mutating operation is
//! expressed as a [`VolumeEvent`]; the pair `(state, event)` either names a
//! single destination state in [`VolumeState::on`] or the event is invalid.

use serde::{Deserialize, Serialize};

// =============================================================================
// States
// =============================================================================

/// Lifecycle state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    /// Intent accepted, no backing storage yet
    Allocated,
    /// Backing storage being created
    Creating,
    /// Usable and idle
    Ready,
    /// Moving to another pool
    Migrating,
    /// Changing size, IOPS or offering
    Resizing,
    /// Primary snapshot capture in progress
    Snapshotting,
    /// Content being uploaded from an external URL
    Uploading,
    /// Being attached to an instance
    Attaching,
    /// Being detached from an instance
    Detaching,
    /// Soft-deleted, recoverable until expunged
    Destroyed,
    /// Backing storage being removed
    Expunging,
    /// Gone for good
    Expunged,
    /// Never became usable
    Failed,
}

impl VolumeState {
    /// Every state, in declaration order
    pub const ALL: [VolumeState; 13] = [
        VolumeState::Allocated,
        VolumeState::Creating,
        VolumeState::Ready,
        VolumeState::Migrating,
        VolumeState::Resizing,
        VolumeState::Snapshotting,
        VolumeState::Uploading,
        VolumeState::Attaching,
        VolumeState::Detaching,
        VolumeState::Destroyed,
        VolumeState::Expunging,
        VolumeState::Expunged,
        VolumeState::Failed,
    ];

    /// Destination state for `event`, or `None` if no edge exists.
    ///
    /// This is the complete transition table. Adding a transition is a
    /// one-line edit here.
    pub fn on(self, event: VolumeEvent) -> Option<VolumeState> {
        use VolumeEvent as E;
        use VolumeState as S;

        let next = match (self, event) {
            // Creation
            (S::Allocated, E::CreateRequested) => S::Creating,
            (S::Allocated | S::Creating, E::CreateSucceeded) => S::Ready,
            (S::Allocated | S::Creating, E::CreateFailed) => S::Failed,

            // Upload
            (S::Allocated, E::UploadRequested) => S::Uploading,
            (S::Uploading, E::UploadSucceeded) => S::Ready,
            (S::Uploading, E::UploadFailed) => S::Failed,

            // Migration
            (S::Ready, E::MigrateRequested) => S::Migrating,
            (S::Migrating, E::MigrateSucceeded | E::MigrateFailed) => S::Ready,

            // Resize / offering change
            (S::Ready, E::ResizeRequested) => S::Resizing,
            (S::Resizing, E::ResizeSucceeded | E::ResizeFailed) => S::Ready,

            // Snapshot
            (S::Ready, E::SnapshotRequested) => S::Snapshotting,
            (S::Snapshotting, E::SnapshotDone | E::SnapshotFailed) => S::Ready,

            // Attach / detach
            (S::Ready, E::AttachRequested) => S::Attaching,
            (S::Attaching, E::AttachSucceeded | E::AttachFailed) => S::Ready,
            (S::Ready, E::DetachRequested) => S::Detaching,
            (S::Detaching, E::DetachSucceeded | E::DetachFailed) => S::Ready,

            // Destroy, recover, expunge
            (S::Ready, E::DestroyRequested) => S::Destroyed,
            (S::Destroyed, E::RecoverRequested) => S::Ready,
            (S::Destroyed, E::ExpungeRequested) => S::Expunging,
            (S::Expunging, E::ExpungeSucceeded) => S::Expunged,
            (S::Expunging, E::ExpungeFailed) => S::Destroyed,

            _ => return None,
        };

        Some(next)
    }

    /// Whether `event` has an edge out of this state
    pub fn accepts(self, event: VolumeEvent) -> bool {
        self.on(event).is_some()
    }

    /// No event leaves a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, VolumeState::Expunged | VolumeState::Failed)
    }

    /// An operation is in flight and awaits its completion event
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            VolumeState::Creating
                | VolumeState::Migrating
                | VolumeState::Resizing
                | VolumeState::Snapshotting
                | VolumeState::Uploading
                | VolumeState::Attaching
                | VolumeState::Detaching
                | VolumeState::Expunging
        )
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VolumeState::Allocated => "Allocated",
            VolumeState::Creating => "Creating",
            VolumeState::Ready => "Ready",
            VolumeState::Migrating => "Migrating",
            VolumeState::Resizing => "Resizing",
            VolumeState::Snapshotting => "Snapshotting",
            VolumeState::Uploading => "Uploading",
            VolumeState::Attaching => "Attaching",
            VolumeState::Detaching => "Detaching",
            VolumeState::Destroyed => "Destroyed",
            VolumeState::Expunging => "Expunging",
            VolumeState::Expunged => "Expunged",
            VolumeState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Event driving a volume through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeEvent {
    CreateRequested,
    CreateSucceeded,
    CreateFailed,
    UploadRequested,
    UploadSucceeded,
    UploadFailed,
    MigrateRequested,
    MigrateSucceeded,
    MigrateFailed,
    ResizeRequested,
    ResizeSucceeded,
    ResizeFailed,
    SnapshotRequested,
    SnapshotDone,
    SnapshotFailed,
    AttachRequested,
    AttachSucceeded,
    AttachFailed,
    DetachRequested,
    DetachSucceeded,
    DetachFailed,
    DestroyRequested,
    RecoverRequested,
    ExpungeRequested,
    ExpungeSucceeded,
    ExpungeFailed,
}

impl VolumeEvent {
    /// Every event, in declaration order
    pub const ALL: [VolumeEvent; 26] = [
        VolumeEvent::CreateRequested,
        VolumeEvent::CreateSucceeded,
        VolumeEvent::CreateFailed,
        VolumeEvent::UploadRequested,
        VolumeEvent::UploadSucceeded,
        VolumeEvent::UploadFailed,
        VolumeEvent::MigrateRequested,
        VolumeEvent::MigrateSucceeded,
        VolumeEvent::MigrateFailed,
        VolumeEvent::ResizeRequested,
        VolumeEvent::ResizeSucceeded,
        VolumeEvent::ResizeFailed,
        VolumeEvent::SnapshotRequested,
        VolumeEvent::SnapshotDone,
        VolumeEvent::SnapshotFailed,
        VolumeEvent::AttachRequested,
        VolumeEvent::AttachSucceeded,
        VolumeEvent::AttachFailed,
        VolumeEvent::DetachRequested,
        VolumeEvent::DetachSucceeded,
        VolumeEvent::DetachFailed,
        VolumeEvent::DestroyRequested,
        VolumeEvent::RecoverRequested,
        VolumeEvent::ExpungeRequested,
        VolumeEvent::ExpungeSucceeded,
        VolumeEvent::ExpungeFailed,
    ];

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeEvent::CreateRequested => "CreateRequested",
            VolumeEvent::CreateSucceeded => "CreateSucceeded",
            VolumeEvent::CreateFailed => "CreateFailed",
            VolumeEvent::UploadRequested => "UploadRequested",
            VolumeEvent::UploadSucceeded => "UploadSucceeded",
            VolumeEvent::UploadFailed => "UploadFailed",
            VolumeEvent::MigrateRequested => "MigrateRequested",
            VolumeEvent::MigrateSucceeded => "MigrateSucceeded",
            VolumeEvent::MigrateFailed => "MigrateFailed",
            VolumeEvent::ResizeRequested => "ResizeRequested",
            VolumeEvent::ResizeSucceeded => "ResizeSucceeded",
            VolumeEvent::ResizeFailed => "ResizeFailed",
            VolumeEvent::SnapshotRequested => "SnapshotRequested",
            VolumeEvent::SnapshotDone => "SnapshotDone",
            VolumeEvent::SnapshotFailed => "SnapshotFailed",
            VolumeEvent::AttachRequested => "AttachRequested",
            VolumeEvent::AttachSucceeded => "AttachSucceeded",
            VolumeEvent::AttachFailed => "AttachFailed",
            VolumeEvent::DetachRequested => "DetachRequested",
            VolumeEvent::DetachSucceeded => "DetachSucceeded",
            VolumeEvent::DetachFailed => "DetachFailed",
            VolumeEvent::DestroyRequested => "DestroyRequested",
            VolumeEvent::RecoverRequested => "RecoverRequested",
            VolumeEvent::ExpungeRequested => "ExpungeRequested",
            VolumeEvent::ExpungeSucceeded => "ExpungeSucceeded",
            VolumeEvent::ExpungeFailed => "ExpungeFailed",
        }
    }
}

impl std::fmt::Display for VolumeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VolumeEvent {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VolumeEvent::ALL
            .iter()
            .copied()
            .find(|event| event.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                crate::error::Error::InvalidParameter(format!("unknown volume event: {}", s))
            })
    }
}
