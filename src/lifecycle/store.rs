//! Volume Store
//!
//! Concurrent home of volume records. All state changes go through
//! [`VolumeStore::transit_with`], which performs the table lookup and the
//! write while holding the volume's map entry, so two callers can never
//! both observe `Ready` and both move the volume out of it.
//!
//! The entry guard is synchronous and is never held across an `.await`.

use super::events::{LifecycleEvent, LIFECYCLE_CHANNEL_CAPACITY};
use super::state::{VolumeEvent, VolumeState};
use crate::domain::model::Volume;
use crate::error::{Error, Result};
use crate::metrics::OrchestratorMetrics;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Authoritative volume records
#[derive(Debug)]
pub struct VolumeStore {
    volumes: DashMap<String, Volume>,
    events: broadcast::Sender<LifecycleEvent>,
    metrics: Option<Arc<OrchestratorMetrics>>,
}

impl Default for VolumeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self {
            volumes: DashMap::new(),
            events,
            metrics: None,
        }
    }

    /// Create a store reporting transitions to `metrics`
    pub fn with_metrics(metrics: Arc<OrchestratorMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::new()
        }
    }

    /// Subscribe to committed transitions
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&self, volume_id: &str) -> Result<Volume> {
        self.volumes
            .get(volume_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(volume_id))
    }

    /// All volumes, oldest first
    pub fn list(&self) -> Vec<Volume> {
        let mut volumes: Vec<Volume> = self.volumes.iter().map(|e| e.value().clone()).collect();
        volumes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        volumes
    }

    /// Volumes attached to an instance, ordered by device slot
    pub fn list_attached_to(&self, instance_id: &str) -> Vec<Volume> {
        let mut volumes: Vec<Volume> = self
            .volumes
            .iter()
            .filter(|e| e.value().instance_id.as_deref() == Some(instance_id))
            .map(|e| e.value().clone())
            .collect();
        volumes.sort_by_key(|v| v.device_id);
        volumes
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert a new volume record
    pub fn insert(&self, volume: Volume) -> Result<Volume> {
        match self.volumes.entry(volume.id.clone()) {
            Entry::Occupied(_) => Err(Error::VolumeExists {
                volume_id: volume.id,
            }),
            Entry::Vacant(vacant) => {
                debug!(volume_id = %volume.id, state = %volume.state, "Volume record inserted");
                vacant.insert(volume.clone());
                Ok(volume)
            }
        }
    }

    /// Apply `event` to a volume
    pub fn transit(&self, volume_id: &str, event: VolumeEvent) -> Result<Volume> {
        self.transit_with(volume_id, event, |_| Ok(()))
    }

    /// Apply `event` only if the volume is still at `expected_version`
    pub fn transit_if(
        &self,
        volume_id: &str,
        expected_version: u64,
        event: VolumeEvent,
    ) -> Result<Volume> {
        self.commit(volume_id, event, Some(expected_version), |_| Ok(()))
    }

    /// Apply `event` and let `mutate` adjust the record in the same write.
    ///
    /// `mutate` sees the record with the destination state already set. If
    /// it fails, nothing is written and its error is returned.
    pub fn transit_with<F>(&self, volume_id: &str, event: VolumeEvent, mutate: F) -> Result<Volume>
    where
        F: FnOnce(&mut Volume) -> Result<()>,
    {
        self.commit(volume_id, event, None, mutate)
    }

    /// Change metadata without touching the lifecycle state
    pub fn update<F>(&self, volume_id: &str, mutate: F) -> Result<Volume>
    where
        F: FnOnce(&mut Volume) -> Result<()>,
    {
        let mut entry = self
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(volume_id))?;

        let mut next = entry.value().clone();
        mutate(&mut next)?;
        if next.state != entry.state || next.id != entry.id {
            return Err(Error::Internal(format!(
                "metadata update attempted to change the identity or state of volume {}",
                volume_id
            )));
        }
        next.version = entry.version + 1;
        *entry = next.clone();

        Ok(next)
    }

    fn commit<F>(
        &self,
        volume_id: &str,
        event: VolumeEvent,
        expected_version: Option<u64>,
        mutate: F,
    ) -> Result<Volume>
    where
        F: FnOnce(&mut Volume) -> Result<()>,
    {
        let (from, next) = {
            let mut entry = self
                .volumes
                .get_mut(volume_id)
                .ok_or_else(|| not_found(volume_id))?;

            if let Some(expected) = expected_version {
                if entry.version != expected {
                    return Err(Error::ConcurrentModification {
                        volume_id: volume_id.to_string(),
                        expected,
                        actual: entry.version,
                    });
                }
            }

            let from = entry.state;
            let to = match from.on(event) {
                Some(to) => to,
                None => {
                    warn!(volume_id, state = %from, %event, "Rejected volume event");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_rejected_transition(event.as_str());
                    }
                    return Err(Error::InvalidStateTransition {
                        volume_id: volume_id.to_string(),
                        state: from,
                        event,
                    });
                }
            };

            let mut next = entry.value().clone();
            next.state = to;
            mutate(&mut next)?;
            next.state = to;
            next.version = entry.version + 1;
            stamp(&mut next, to);

            *entry = next.clone();
            (from, next)
        };

        debug!(
            volume_id,
            from = %from,
            to = %next.state,
            %event,
            version = next.version,
            "Volume transitioned"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(event.as_str());
        }

        // No subscribers is fine
        let _ = self.events.send(LifecycleEvent {
            volume_id: volume_id.to_string(),
            from,
            to: next.state,
            event,
            version: next.version,
            at: Utc::now(),
        });

        Ok(next)
    }
}

/// Maintain lifecycle timestamps
fn stamp(volume: &mut Volume, to: VolumeState) {
    match to {
        VolumeState::Destroyed if volume.destroyed_at.is_none() => {
            volume.destroyed_at = Some(Utc::now());
        }
        VolumeState::Ready => volume.destroyed_at = None,
        VolumeState::Expunged => volume.removed_at = Some(Utc::now()),
        _ => {}
    }
}

fn not_found(volume_id: &str) -> Error {
    Error::VolumeNotFound {
        volume_id: volume_id.to_string(),
    }
}
