//! Capacity & Resize Validator
//!
//! Validates a requested size/IOPS/offering change against the offering
//! bounds, the shrink acknowledgement, tag placement and pool capacity,
//! and turns it into a [`ResizePlan`]. Validation never mutates anything.

use super::selector::{PoolRequirements, PoolSelector};
use super::tags::pool_supports_offering;
use crate::domain::model::{DiskOffering, StoragePool, Volume};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Request / Plan
// =============================================================================

/// A size/IOPS/offering change to validate
#[derive(Debug, Clone, Default)]
pub struct ResizeRequest<'a> {
    pub new_size_bytes: Option<u64>,
    pub new_min_iops: Option<u64>,
    pub new_max_iops: Option<u64>,
    pub new_offering: Option<&'a DiskOffering>,
    /// Plan a migration when the current pool lacks the new offering's tags
    pub auto_migrate: bool,
    /// Shrinking was acknowledged by the caller
    pub shrink_ok: bool,
}

/// Migration that has to complete before the resize is applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub destination_pool_id: String,
    pub datastore_id: String,
}

/// Validated change, consumed by the orchestrator and the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizePlan {
    pub volume_id: String,
    pub current_size_bytes: u64,
    pub new_size_bytes: u64,
    pub new_min_iops: Option<u64>,
    pub new_max_iops: Option<u64>,
    /// Set when the offering changes
    pub new_offering_id: Option<String>,
    /// Set when the volume has to move first
    pub migration: Option<MigrationStep>,
}

impl ResizePlan {
    /// Bytes the volume grows by
    pub fn grow_bytes(&self) -> u64 {
        self.new_size_bytes.saturating_sub(self.current_size_bytes)
    }

    /// Bytes the volume shrinks by
    pub fn shrink_bytes(&self) -> u64 {
        self.current_size_bytes.saturating_sub(self.new_size_bytes)
    }

    /// Whether the data plane has to touch the volume
    pub fn changes_size(&self) -> bool {
        self.new_size_bytes != self.current_size_bytes
    }

    pub fn requires_migration(&self) -> bool {
        self.migration.is_some()
    }

    /// The same plan with the migration already carried out
    pub fn after_migration(&self) -> Self {
        Self {
            migration: None,
            ..self.clone()
        }
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Stateless resize validator
pub struct ResizeValidator;

impl ResizeValidator {
    /// Validate a change against the volume, its pool and candidate pools.
    ///
    /// Checks run in a fixed order: size bounds, shrink acknowledgement,
    /// IOPS bounds, tag placement (planning a migration when allowed), and
    /// finally free capacity.
    pub fn validate(
        volume: &Volume,
        current_offering: &DiskOffering,
        current_pool: Option<&StoragePool>,
        request: &ResizeRequest<'_>,
        candidates: &[StoragePool],
    ) -> Result<ResizePlan> {
        let target_offering = request.new_offering.unwrap_or(current_offering);

        let new_size = match request.new_size_bytes {
            Some(size) => size,
            None if request.new_offering.is_some() && !target_offering.custom_size => {
                target_offering.size_bytes
            }
            None => volume.size_bytes,
        };

        // (a) offering-defined size bounds
        validate_size(target_offering, new_size, request.new_size_bytes, volume.size_bytes)?;

        // (b) shrink needs an explicit acknowledgement
        if new_size < volume.size_bytes && !request.shrink_ok {
            return Err(Error::DestructiveOperationRejected {
                volume_id: volume.id.clone(),
                reason: format!(
                    "shrinking from {} to {} bytes may truncate data; shrink must be acknowledged",
                    volume.size_bytes, new_size
                ),
            });
        }

        validate_iops(target_offering, request.new_min_iops, request.new_max_iops)?;
        let iops_requested = request.new_min_iops.is_some() || request.new_max_iops.is_some();
        let (new_min_iops, new_max_iops) = if iops_requested {
            (request.new_min_iops, request.new_max_iops)
        } else if request.new_offering.is_some() && !target_offering.custom_iops {
            (target_offering.min_iops, target_offering.max_iops)
        } else {
            (volume.min_iops, volume.max_iops)
        };

        // (c)/(d) tag placement against the current pool
        let mut migration = None;
        if let (Some(new_offering), Some(pool)) = (request.new_offering, current_pool) {
            if !pool_supports_offering(pool, new_offering) {
                if !request.auto_migrate {
                    return Err(Error::placement(format!(
                        "pool {} does not support the tags of offering {}; migration required",
                        pool.id, new_offering.id
                    )));
                }

                let requirements = PoolRequirements {
                    offering: new_offering,
                    required_bytes: new_size,
                    zone_id: Some(volume.zone_id.as_str()),
                    exclude_pool: Some(pool.id.as_str()),
                };
                let destination = PoolSelector::select(&requirements, candidates).ok_or_else(|| {
                    Error::placement(format!(
                        "no pool in zone {} supports offering {} with {} free bytes",
                        volume.zone_id, new_offering.id, new_size
                    ))
                })?;

                migration = Some(MigrationStep {
                    destination_pool_id: destination.id.clone(),
                    datastore_id: destination.datastore_id.clone(),
                });
            }
        }

        // (e) destination capacity covers the growth
        if migration.is_none() {
            if let Some(pool) = current_pool {
                let grow = new_size.saturating_sub(volume.size_bytes);
                if grow > pool.available_bytes {
                    return Err(Error::capacity(format!(
                        "pool {} has {} free bytes, resize needs {}",
                        pool.id, pool.available_bytes, grow
                    )));
                }
            }
        }

        Ok(ResizePlan {
            volume_id: volume.id.clone(),
            current_size_bytes: volume.size_bytes,
            new_size_bytes: new_size,
            new_min_iops,
            new_max_iops,
            new_offering_id: request.new_offering.map(|o| o.id.clone()),
            migration,
        })
    }
}

/// Size check shared by allocation and resize
fn validate_size(
    offering: &DiskOffering,
    size: u64,
    requested: Option<u64>,
    current: u64,
) -> Result<()> {
    if size == 0 {
        return Err(Error::sizing("volume size must be greater than zero"));
    }

    match offering.size_range() {
        Some((min, max)) => {
            if size < min || size > max {
                return Err(Error::sizing(format!(
                    "size {} bytes is outside the range [{}, {}] of offering {}",
                    size, min, max, offering.id
                )));
            }
        }
        None => {
            if let Some(requested) = requested {
                if requested != offering.size_bytes && requested != current {
                    return Err(Error::sizing(format!(
                        "offering {} has a fixed size of {} bytes; change the offering to resize",
                        offering.id, offering.size_bytes
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Resolve the size of a new volume from its offering and the requested size
pub fn resolve_allocation_size(offering: &DiskOffering, requested: Option<u64>) -> Result<u64> {
    if offering.custom_size {
        let size = requested.ok_or_else(|| {
            Error::sizing(format!("offering {} is custom-sized; a size is required", offering.id))
        })?;
        validate_size(offering, size, Some(size), size)?;
        return Ok(size);
    }

    if let Some(size) = requested {
        if size != offering.size_bytes {
            return Err(Error::sizing(format!(
                "offering {} has a fixed size of {} bytes",
                offering.id, offering.size_bytes
            )));
        }
    }
    validate_size(offering, offering.size_bytes, None, offering.size_bytes)?;
    Ok(offering.size_bytes)
}

/// Check requested IOPS against the offering
pub fn validate_iops(
    offering: &DiskOffering,
    min_iops: Option<u64>,
    max_iops: Option<u64>,
) -> Result<()> {
    if min_iops.is_none() && max_iops.is_none() {
        return Ok(());
    }

    if !offering.custom_iops {
        return Err(Error::sizing(format!(
            "offering {} does not allow custom IOPS",
            offering.id
        )));
    }

    if let (Some(min), Some(max)) = (min_iops, max_iops) {
        if min > max {
            return Err(Error::sizing(format!(
                "min IOPS {} exceeds max IOPS {}",
                min, max
            )));
        }
    }

    for value in [min_iops, max_iops].into_iter().flatten() {
        if offering.min_iops.is_some_and(|lo| value < lo)
            || offering.max_iops.is_some_and(|hi| value > hi)
        {
            return Err(Error::sizing(format!(
                "IOPS {} is outside the bounds of offering {}",
                value, offering.id
            )));
        }
    }

    Ok(())
}
