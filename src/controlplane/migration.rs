//! Migration, Resize and Offering Change
//!
//! Migration is asynchronous: `migrate_volume` returns once the volume is
//! `Migrating`, admission is held and the data plane has accepted the job.
//! The caller reports the outcome through `complete_migration`, which
//! always gives the admission ticket back.

use super::orchestrator::{collaborator_error, PendingMigration, VolumeOrchestrator};
use crate::domain::model::{StoragePool, Volume};
use crate::domain::requests::{
    ChangeOfferingRequest, MigrateVolumeRequest, MigrationOutcome, ResizeVolumeRequest,
};
use crate::error::{Error, Result};
use crate::lifecycle::{VolumeEvent, VolumeState};
use crate::placement::{pool_supports_offering, ResizePlan, ResizeRequest, ResizeValidator};
use chrono::Utc;
use tracing::{error, info, warn};

impl VolumeOrchestrator {
    // =========================================================================
    // Migration
    // =========================================================================

    /// Start moving a volume to another pool
    pub async fn migrate_volume(&self, request: MigrateVolumeRequest) -> Result<Volume> {
        let volume = self.volumes.get(&request.volume_id)?;
        ensure_accepts(&volume, VolumeEvent::MigrateRequested)?;

        let destination = self.refreshed_pool(&request.destination_pool_id).await?;
        if volume.pool_id.as_deref() == Some(destination.id.as_str()) {
            return Err(Error::InvalidParameter(format!(
                "volume {} already lives on pool {}",
                volume.id, destination.id
            )));
        }

        let offering_id = request
            .new_offering_id
            .clone()
            .unwrap_or_else(|| volume.disk_offering_id.clone());
        let offering = self.catalog.offering(&offering_id)?;

        if destination.zone_id != volume.zone_id {
            return Err(Error::placement(format!(
                "pool {} is in zone {}, volume is in zone {}",
                destination.id, destination.zone_id, volume.zone_id
            )));
        }
        if !pool_supports_offering(&destination, &offering) {
            return Err(Error::placement(format!(
                "pool {} does not support the tags of offering {}",
                destination.id, offering.id
            )));
        }
        if destination.available_bytes < volume.size_bytes {
            return Err(Error::capacity(format!(
                "pool {} has {} free bytes, volume needs {}",
                destination.id, destination.available_bytes, volume.size_bytes
            )));
        }

        self.begin_migration(&volume, destination, request.new_offering_id, None)
            .await
    }

    /// Admission, reservation and the `MigrateRequested` transition.
    ///
    /// Any failure after admission drops the ticket, which releases it.
    pub(crate) async fn begin_migration(
        &self,
        volume: &Volume,
        destination: StoragePool,
        new_offering_id: Option<String>,
        follow_up: Option<ResizePlan>,
    ) -> Result<Volume> {
        let ticket = self.admission.try_acquire(&destination.datastore_id)?;
        let reserved_bytes = volume.size_bytes;

        self.collaborators
            .capacity
            .reserve(&destination.id, reserved_bytes)
            .await?;

        let migrating = match self
            .volumes
            .transit_if(&volume.id, volume.version, VolumeEvent::MigrateRequested)
        {
            Ok(migrating) => migrating,
            Err(err) => {
                self.release_capacity(&destination.id, reserved_bytes).await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .collaborators
            .data_plane
            .start_migration(&migrating, &destination)
            .await
        {
            error!(
                volume_id = %volume.id,
                destination = %destination.id,
                error = %err,
                "Migration job rejected"
            );
            self.release_capacity(&destination.id, reserved_bytes).await;
            self.volumes.transit(&volume.id, VolumeEvent::MigrateFailed)?;
            return Err(collaborator_error("data-plane", "migrate")(err));
        }

        info!(
            volume_id = %volume.id,
            destination = %destination.id,
            datastore_id = %destination.datastore_id,
            "Migration started"
        );

        self.pending_migrations.insert(
            volume.id.clone(),
            PendingMigration {
                ticket,
                source_pool_id: volume.pool_id.clone(),
                destination,
                reserved_bytes,
                new_offering_id,
                follow_up,
                started_at: Utc::now(),
            },
        );

        Ok(migrating)
    }

    /// Finish an in-flight migration with its outcome
    pub async fn complete_migration(
        &self,
        volume_id: &str,
        outcome: MigrationOutcome,
    ) -> Result<Volume> {
        let event = match &outcome {
            MigrationOutcome::Succeeded { .. } => VolumeEvent::MigrateSucceeded,
            MigrationOutcome::Failed { .. } => VolumeEvent::MigrateFailed,
        };

        let Some((_, pending)) = self.pending_migrations.remove(volume_id) else {
            let volume = self.volumes.get(volume_id)?;
            return Err(Error::InvalidStateTransition {
                volume_id: volume.id,
                state: volume.state,
                event,
            });
        };

        let PendingMigration {
            ticket,
            source_pool_id,
            destination,
            reserved_bytes,
            new_offering_id,
            follow_up,
            started_at,
        } = pending;

        let elapsed = Utc::now().signed_duration_since(started_at);

        match outcome {
            MigrationOutcome::Succeeded { path } => {
                let plan = follow_up.map(|plan| plan.after_migration());

                // Resize the destination copy before the commit; on failure
                // the record keeps its pre-migration pool and offering.
                let resized = match &plan {
                    Some(plan) => self.resize_on_destination(volume_id, &destination, plan).await,
                    None => Ok(0),
                };
                let grown = match resized {
                    Ok(grown) => grown,
                    Err(err) => {
                        error!(
                            volume_id,
                            destination = %destination.id,
                            error = %err,
                            "Post-migration resize failed"
                        );
                        self.release_capacity(&destination.id, reserved_bytes).await;
                        ticket.release();
                        self.volumes.transit(volume_id, VolumeEvent::MigrateFailed)?;
                        return Err(err);
                    }
                };

                let volume = self
                    .volumes
                    .transit_with(volume_id, VolumeEvent::MigrateSucceeded, |v| {
                        v.pool_id = Some(destination.id.clone());
                        if path.is_some() {
                            v.path = path;
                        }
                        if let Some(offering_id) = new_offering_id {
                            v.disk_offering_id = offering_id;
                        }
                        if let Some(plan) = &plan {
                            commit_plan(v, plan);
                        }
                        Ok(())
                    });
                let volume = match volume {
                    Ok(volume) => volume,
                    Err(err) => {
                        self.release_capacity(&destination.id, reserved_bytes + grown).await;
                        ticket.release();
                        return Err(err);
                    }
                };

                if let Some(source) = source_pool_id {
                    self.release_capacity(&source, reserved_bytes).await;
                }
                if let Some(plan) = &plan {
                    self.release_capacity(&destination.id, plan.shrink_bytes()).await;
                }
                ticket.release();

                info!(
                    volume_id,
                    destination = %destination.id,
                    size_bytes = volume.size_bytes,
                    offering = %volume.disk_offering_id,
                    elapsed_ms = elapsed.num_milliseconds(),
                    "Migration succeeded"
                );
                Ok(volume)
            }
            MigrationOutcome::Failed { reason } => {
                self.release_capacity(&destination.id, reserved_bytes).await;
                ticket.release();

                let volume = self.volumes.transit(volume_id, VolumeEvent::MigrateFailed)?;
                warn!(
                    volume_id,
                    destination = %destination.id,
                    reason = %reason,
                    "Migration failed"
                );
                Ok(volume)
            }
        }
    }

    /// Abandon an in-flight migration
    pub async fn cancel_migration(&self, volume_id: &str) -> Result<Volume> {
        self.complete_migration(
            volume_id,
            MigrationOutcome::Failed {
                reason: "cancelled".to_string(),
            },
        )
        .await
    }

    /// Resize the migrated copy on the destination pool.
    ///
    /// Returns the bytes reserved for growth. On failure nothing stays
    /// reserved.
    async fn resize_on_destination(
        &self,
        volume_id: &str,
        destination: &StoragePool,
        plan: &ResizePlan,
    ) -> Result<u64> {
        if !plan.changes_size() {
            return Ok(0);
        }

        let mut moved = self.volumes.get(volume_id)?;
        moved.pool_id = Some(destination.id.clone());

        let grow = plan.grow_bytes();
        if grow > 0 {
            self.collaborators
                .capacity
                .reserve(&destination.id, grow)
                .await?;
        }

        if let Err(err) = self
            .collaborators
            .data_plane
            .resize(&moved, plan.new_size_bytes)
            .await
        {
            self.release_capacity(&destination.id, grow).await;
            return Err(collaborator_error("data-plane", "resize")(err));
        }
        Ok(grow)
    }

    // =========================================================================
    // Resize
    // =========================================================================

    /// Change size and/or IOPS, optionally with a compatible new offering
    pub async fn resize_volume(&self, request: ResizeVolumeRequest) -> Result<Volume> {
        let volume = self.volumes.get(&request.volume_id)?;
        let current_offering = self.catalog.offering(&volume.disk_offering_id)?;
        let new_offering = request
            .new_offering_id
            .as_deref()
            .map(|id| self.catalog.offering(id))
            .transpose()?;
        let current_pool = match &volume.pool_id {
            Some(pool_id) => Some(self.refreshed_pool(pool_id).await?),
            None => None,
        };

        let plan = ResizeValidator::validate(
            &volume,
            &current_offering,
            current_pool.as_ref(),
            &ResizeRequest {
                new_size_bytes: request.new_size_bytes,
                new_min_iops: request.new_min_iops,
                new_max_iops: request.new_max_iops,
                new_offering: new_offering.as_ref(),
                auto_migrate: false,
                shrink_ok: request.shrink_ok,
            },
            &[],
        )?;

        self.apply_resize(&volume, &plan).await
    }

    /// Move a volume onto another offering, migrating first if allowed
    pub async fn change_disk_offering_for_volume(
        &self,
        request: ChangeOfferingRequest,
    ) -> Result<Volume> {
        let volume = self.volumes.get(&request.volume_id)?;
        let current_offering = self.catalog.offering(&volume.disk_offering_id)?;
        let new_offering = self.catalog.offering(&request.new_offering_id)?;
        let current_pool = match &volume.pool_id {
            Some(pool_id) => Some(self.refreshed_pool(pool_id).await?),
            None => None,
        };
        let candidates = if request.auto_migrate {
            self.refreshed_pools(&volume.zone_id).await?
        } else {
            Vec::new()
        };

        let plan = ResizeValidator::validate(
            &volume,
            &current_offering,
            current_pool.as_ref(),
            &ResizeRequest {
                new_size_bytes: request.new_size_bytes,
                new_min_iops: request.new_min_iops,
                new_max_iops: request.new_max_iops,
                new_offering: Some(&new_offering),
                auto_migrate: request.auto_migrate,
                shrink_ok: request.shrink_ok,
            },
            &candidates,
        )?;

        match &plan.migration {
            Some(step) => {
                ensure_accepts(&volume, VolumeEvent::MigrateRequested)?;
                let destination = self.catalog.pool(&step.destination_pool_id)?;
                info!(
                    volume_id = %volume.id,
                    offering = %new_offering.id,
                    destination = %destination.id,
                    "Offering change requires migration"
                );
                self.begin_migration(
                    &volume,
                    destination,
                    Some(new_offering.id.clone()),
                    Some(plan.clone()),
                )
                .await
            }
            None => self.apply_resize(&volume, &plan).await,
        }
    }

    /// Apply a validated plan that needs no migration
    pub(crate) async fn apply_resize(&self, volume: &Volume, plan: &ResizePlan) -> Result<Volume> {
        if plan.requires_migration() {
            return Err(Error::Internal(format!(
                "resize plan for volume {} still requires a migration",
                volume.id
            )));
        }

        let offering_changes = plan
            .new_offering_id
            .as_ref()
            .is_some_and(|id| *id != volume.disk_offering_id);
        let iops_change =
            plan.new_min_iops != volume.min_iops || plan.new_max_iops != volume.max_iops;
        if !plan.changes_size() && !offering_changes && !iops_change {
            return Ok(volume.clone());
        }

        // Never created: only the record changes
        if volume.state == VolumeState::Allocated {
            return self.volumes.update(&volume.id, |v| {
                if v.state != VolumeState::Allocated {
                    return Err(Error::InvalidParameter(format!(
                        "volume {} changed state during resize",
                        v.id
                    )));
                }
                commit_plan(v, plan);
                Ok(())
            });
        }

        let pool_id = volume.pool_id.clone();
        let grow = plan.grow_bytes();
        if let (Some(pool_id), true) = (&pool_id, grow > 0) {
            self.collaborators.capacity.reserve(pool_id, grow).await?;
        }

        let resizing = match self.volumes.transit(&volume.id, VolumeEvent::ResizeRequested) {
            Ok(resizing) => resizing,
            Err(err) => {
                if let Some(pool_id) = &pool_id {
                    self.release_capacity(pool_id, grow).await;
                }
                return Err(err);
            }
        };

        if plan.changes_size() {
            if let Err(err) = self
                .collaborators
                .data_plane
                .resize(&resizing, plan.new_size_bytes)
                .await
            {
                error!(volume_id = %volume.id, error = %err, "Resize failed");
                if let Some(pool_id) = &pool_id {
                    self.release_capacity(pool_id, grow).await;
                }
                self.volumes.transit(&volume.id, VolumeEvent::ResizeFailed)?;
                return Err(collaborator_error("data-plane", "resize")(err));
            }
        }

        let resized = match self
            .volumes
            .transit_with(&volume.id, VolumeEvent::ResizeSucceeded, |v| {
                commit_plan(v, plan);
                Ok(())
            }) {
            Ok(resized) => resized,
            Err(err) => {
                if let Some(pool_id) = &pool_id {
                    self.release_capacity(pool_id, grow).await;
                }
                return Err(err);
            }
        };

        if let Some(pool_id) = &pool_id {
            self.release_capacity(pool_id, plan.shrink_bytes()).await;
        }

        info!(
            volume_id = %volume.id,
            from = plan.current_size_bytes,
            to = plan.new_size_bytes,
            offering = %resized.disk_offering_id,
            "Volume resized"
        );
        Ok(resized)
    }
}

fn commit_plan(volume: &mut Volume, plan: &ResizePlan) {
    volume.size_bytes = plan.new_size_bytes;
    volume.min_iops = plan.new_min_iops;
    volume.max_iops = plan.new_max_iops;
    if let Some(offering_id) = &plan.new_offering_id {
        volume.disk_offering_id = offering_id.clone();
    }
}

fn ensure_accepts(volume: &Volume, event: VolumeEvent) -> Result<()> {
    if !volume.state.accepts(event) {
        return Err(Error::InvalidStateTransition {
            volume_id: volume.id.clone(),
            state: volume.state,
            event,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::testing::{Harness, GIB};
    use crate::error::AllocationErrorKind;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn migrate(volume: &Volume, pool: &str) -> MigrateVolumeRequest {
        MigrateVolumeRequest {
            volume_id: volume.id.clone(),
            destination_pool_id: pool.into(),
            new_offering_id: None,
        }
    }

    #[tokio::test]
    async fn test_migration_lifecycle_releases_ticket() {
        let h = Harness::with_ceiling(1).await;
        let volume = h.ready_volume("plain", None).await;
        assert_eq!(volume.pool_id.as_deref(), Some("hdd-1"));

        let migrating = h.orchestrator.migrate_volume(migrate(&volume, "ssd-1")).await.unwrap();
        assert_eq!(migrating.state, VolumeState::Migrating);
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 1);
        assert_eq!(h.memory.capacity.reserved("ssd-1"), 10 * GIB);
        assert_eq!(
            h.memory.data_plane.migration_target(&volume.id).await.as_deref(),
            Some("ssd-1")
        );

        let done = h
            .orchestrator
            .complete_migration(
                &volume.id,
                MigrationOutcome::Succeeded {
                    path: Some("ssd-1/moved".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.state, VolumeState::Ready);
        assert_eq!(done.pool_id.as_deref(), Some("ssd-1"));
        assert_eq!(done.path.as_deref(), Some("ssd-1/moved"));
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 0);
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 0);
        assert_eq!(h.memory.capacity.reserved("ssd-1"), 10 * GIB);

        // A second completion has nothing to complete
        let err = h
            .orchestrator
            .complete_migration(&volume.id, MigrationOutcome::Failed { reason: "late".into() })
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidStateTransition { state: VolumeState::Ready, .. });
    }

    #[tokio::test]
    async fn test_failed_migration_releases_everything() {
        let h = Harness::with_ceiling(1).await;
        let volume = h.ready_volume("plain", None).await;

        h.orchestrator.migrate_volume(migrate(&volume, "ssd-1")).await.unwrap();
        let back = h.orchestrator.cancel_migration(&volume.id).await.unwrap();

        assert_eq!(back.state, VolumeState::Ready);
        assert_eq!(back.pool_id.as_deref(), Some("hdd-1"));
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 0);
        assert_eq!(h.memory.capacity.reserved("ssd-1"), 0);
    }

    #[tokio::test]
    async fn test_rejected_job_rolls_back_and_releases() {
        let h = Harness::with_ceiling(1).await;
        let volume = h.ready_volume("plain", None).await;
        h.memory.data_plane.faults().fail("migrate", 1);

        let err = h.orchestrator.migrate_volume(migrate(&volume, "ssd-1")).await.unwrap_err();
        assert_matches!(err, Error::ExternalCollaboratorFailure { .. });
        assert_eq!(h.orchestrator.get_volume(&volume.id).unwrap().state, VolumeState::Ready);
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 0);
        assert_eq!(h.memory.capacity.reserved("ssd-1"), 0);
    }

    #[tokio::test]
    async fn test_ceiling_one_two_concurrent_migrations() {
        let h = Harness::with_ceiling(1).await;
        let a = h.ready_volume("plain", None).await;
        let b = h.ready_volume("plain", None).await;

        let (ra, rb) = tokio::join!(
            h.orchestrator.migrate_volume(migrate(&a, "ssd-1")),
            h.orchestrator.migrate_volume(migrate(&b, "ssd-2")),
        );

        let declined = [&ra, &rb]
            .iter()
            .filter(|r| matches!(r, Err(Error::MigrationAdmissionDeclined { .. })))
            .count();
        assert_eq!(declined, 1);
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 1);

        // The declined volume is untouched
        let loser = if ra.is_err() { &a } else { &b };
        assert_eq!(h.orchestrator.get_volume(&loser.id).unwrap().state, VolumeState::Ready);
    }

    #[tokio::test]
    async fn test_ceiling_never_exceeded_under_load() {
        let h = Harness::with_ceiling(2).await;
        let mut volumes = Vec::new();
        for _ in 0..8 {
            volumes.push(h.ready_volume("plain", None).await);
        }

        let tasks: Vec<_> = volumes
            .iter()
            .map(|v| {
                let orchestrator = Arc::clone(&h.orchestrator);
                let request = migrate(v, "ssd-1");
                tokio::spawn(async move { orchestrator.migrate_volume(request).await })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(err) => assert_matches!(err, Error::MigrationAdmissionDeclined { .. }),
            }
        }
        assert_eq!(admitted, 2);
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 2);
    }

    #[tokio::test]
    async fn test_unlimited_ceiling_never_declines() {
        let h = Harness::new().await;
        for _ in 0..5 {
            let volume = h.ready_volume("plain", None).await;
            h.orchestrator.migrate_volume(migrate(&volume, "ssd-1")).await.unwrap();
        }
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 5);
        assert_eq!(h.orchestrator.list_migrations().len(), 5);
    }

    #[tokio::test]
    async fn test_migration_placement_checks() {
        let h = Harness::new().await;
        let ssd = h.ready_volume("ssd", None).await;

        let err = h.orchestrator.migrate_volume(migrate(&ssd, "hdd-1")).await.unwrap_err();
        assert_eq!(err.allocation_kind(), Some(AllocationErrorKind::Placement));

        let err = h.orchestrator.migrate_volume(migrate(&ssd, "remote-1")).await.unwrap_err();
        assert_eq!(err.allocation_kind(), Some(AllocationErrorKind::Placement));

        let err = h
            .orchestrator
            .migrate_volume(migrate(&ssd, ssd.pool_id.as_deref().unwrap()))
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidParameter(_));
    }

    #[tokio::test]
    async fn test_privileged_transition_releases_ticket() {
        let h = Harness::with_ceiling(1).await;
        let volume = h.ready_volume("plain", None).await;
        h.orchestrator.migrate_volume(migrate(&volume, "ssd-1")).await.unwrap();

        h.orchestrator
            .state_transit_to(&volume.id, VolumeEvent::MigrateFailed)
            .await
            .unwrap();
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 0);
        assert!(h.orchestrator.list_migrations().is_empty());
    }

    #[tokio::test]
    async fn test_resize_grows_and_reserves() {
        let h = Harness::new().await;
        let volume = h.ready_custom_volume(20 * GIB).await;

        let resized = h
            .orchestrator
            .resize_volume(ResizeVolumeRequest {
                volume_id: volume.id.clone(),
                new_size_bytes: Some(50 * GIB),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resized.size_bytes, 50 * GIB);
        assert_eq!(resized.state, VolumeState::Ready);
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 50 * GIB);
        assert_eq!(
            h.memory.data_plane.backing(&volume.id).await.unwrap().size_bytes,
            50 * GIB
        );
    }

    #[tokio::test]
    async fn test_resize_out_of_range_leaves_size() {
        let h = Harness::new().await;
        let volume = h.ready_custom_volume(20 * GIB).await;

        let err = h
            .orchestrator
            .resize_volume(ResizeVolumeRequest {
                volume_id: volume.id.clone(),
                new_size_bytes: Some(2000 * GIB),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.allocation_kind(), Some(AllocationErrorKind::Sizing));
        assert_eq!(h.orchestrator.get_volume(&volume.id).unwrap().size_bytes, 20 * GIB);
    }

    #[tokio::test]
    async fn test_shrink_needs_acknowledgement() {
        let h = Harness::new().await;
        let volume = h.ready_custom_volume(20 * GIB).await;

        let err = h
            .orchestrator
            .resize_volume(ResizeVolumeRequest {
                volume_id: volume.id.clone(),
                new_size_bytes: Some(10 * GIB),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::DestructiveOperationRejected { .. });

        let shrunk = h
            .orchestrator
            .resize_volume(ResizeVolumeRequest {
                volume_id: volume.id.clone(),
                new_size_bytes: Some(10 * GIB),
                shrink_ok: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(shrunk.size_bytes, 10 * GIB);
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 10 * GIB);
    }

    #[tokio::test]
    async fn test_resize_failure_rolls_back() {
        let h = Harness::new().await;
        let volume = h.ready_custom_volume(20 * GIB).await;
        h.memory.data_plane.faults().fail("resize", 1);

        assert!(h
            .orchestrator
            .resize_volume(ResizeVolumeRequest {
                volume_id: volume.id.clone(),
                new_size_bytes: Some(30 * GIB),
                ..Default::default()
            })
            .await
            .is_err());

        let volume = h.orchestrator.get_volume(&volume.id).unwrap();
        assert_eq!(volume.state, VolumeState::Ready);
        assert_eq!(volume.size_bytes, 20 * GIB);
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 20 * GIB);
    }

    #[tokio::test]
    async fn test_resize_allocated_volume_updates_record() {
        let h = Harness::new().await;
        let volume = h.alloc("custom", Some(20 * GIB)).await;

        let resized = h
            .orchestrator
            .resize_volume(ResizeVolumeRequest {
                volume_id: volume.id.clone(),
                new_size_bytes: Some(40 * GIB),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resized.state, VolumeState::Allocated);
        assert_eq!(resized.size_bytes, 40 * GIB);
    }

    #[tokio::test]
    async fn test_change_offering_to_compatible_tags() {
        let h = Harness::new().await;
        // "ssd" offering lands on ssd-2, which declares {ssd, fast}
        let volume = h.ready_volume("ssd", None).await;
        assert_eq!(volume.pool_id.as_deref(), Some("ssd-2"));

        let changed = h
            .orchestrator
            .change_disk_offering_for_volume(ChangeOfferingRequest {
                volume_id: volume.id.clone(),
                new_offering_id: "ssd-fast".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(changed.disk_offering_id, "ssd-fast");
        assert_eq!(changed.pool_id.as_deref(), Some("ssd-2"));
        assert_eq!(changed.state, VolumeState::Ready);
    }

    #[tokio::test]
    async fn test_change_offering_incompatible_without_auto_migrate() {
        let h = Harness::new().await;
        let volume = h.ready_volume("hdd", None).await;

        let err = h
            .orchestrator
            .change_disk_offering_for_volume(ChangeOfferingRequest {
                volume_id: volume.id.clone(),
                new_offering_id: "ssd".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.allocation_kind(), Some(AllocationErrorKind::Placement));

        let volume = h.orchestrator.get_volume(&volume.id).unwrap();
        assert_eq!(volume.disk_offering_id, "hdd");
        assert_eq!(volume.state, VolumeState::Ready);
    }

    #[tokio::test]
    async fn test_change_offering_with_auto_migrate() {
        let h = Harness::with_ceiling(1).await;
        let volume = h.ready_volume("hdd", None).await;

        let migrating = h
            .orchestrator
            .change_disk_offering_for_volume(ChangeOfferingRequest {
                volume_id: volume.id.clone(),
                new_offering_id: "ssd-large".into(),
                auto_migrate: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(migrating.state, VolumeState::Migrating);
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 1);

        let done = h
            .orchestrator
            .complete_migration(&volume.id, MigrationOutcome::Succeeded { path: None })
            .await
            .unwrap();
        assert_eq!(done.state, VolumeState::Ready);
        assert_eq!(done.pool_id.as_deref(), Some("ssd-2"));
        assert_eq!(done.disk_offering_id, "ssd-large");
        assert_eq!(done.size_bytes, 20 * GIB);
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 0);
        assert_eq!(h.memory.capacity.reserved("ssd-2"), 20 * GIB);
    }

    #[tokio::test]
    async fn test_failed_follow_up_resize_keeps_source_record() {
        let h = Harness::with_ceiling(1).await;
        let volume = h.ready_volume("hdd", None).await;
        assert_eq!(volume.pool_id.as_deref(), Some("hdd-1"));

        h.orchestrator
            .change_disk_offering_for_volume(ChangeOfferingRequest {
                volume_id: volume.id.clone(),
                new_offering_id: "ssd-large".into(),
                auto_migrate: true,
                ..Default::default()
            })
            .await
            .unwrap();
        h.memory.data_plane.faults().fail("resize", 1);

        let err = h
            .orchestrator
            .complete_migration(&volume.id, MigrationOutcome::Succeeded { path: None })
            .await
            .unwrap_err();
        assert_matches!(err, Error::ExternalCollaboratorFailure { .. });

        let after = h.orchestrator.get_volume(&volume.id).unwrap();
        assert_eq!(after.state, VolumeState::Ready);
        assert_eq!(after.pool_id.as_deref(), Some("hdd-1"));
        assert_eq!(after.disk_offering_id, "hdd");
        assert_eq!(after.size_bytes, 10 * GIB);
        assert_eq!(h.orchestrator.migrations_in_flight("ds-2"), 0);
        assert_eq!(h.memory.capacity.reserved("hdd-1"), 10 * GIB);
        assert_eq!(h.memory.capacity.reserved("ssd-2"), 0);
    }
}
