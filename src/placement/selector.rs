//! Pool Selection
//!
//! Picks a destination pool for a volume: compatible tags, same zone,
//! enough free bytes. Among the survivors the pool with the most free
//! space wins, with the pool id as a stable tie-breaker.

use super::tags::pool_supports_offering;
use crate::domain::model::{DiskOffering, StoragePool};

/// What a destination pool has to satisfy
#[derive(Debug, Clone)]
pub struct PoolRequirements<'a> {
    pub offering: &'a DiskOffering,
    pub required_bytes: u64,
    /// Restrict to this zone
    pub zone_id: Option<&'a str>,
    /// Never pick this pool (the volume's current one)
    pub exclude_pool: Option<&'a str>,
}

/// Stateless pool selector
pub struct PoolSelector;

impl PoolSelector {
    /// All pools meeting the requirements, best first
    pub fn rank<'p>(
        requirements: &PoolRequirements<'_>,
        candidates: &'p [StoragePool],
    ) -> Vec<&'p StoragePool> {
        let mut eligible: Vec<&StoragePool> = candidates
            .iter()
            .filter(|pool| Some(pool.id.as_str()) != requirements.exclude_pool)
            .filter(|pool| {
                requirements
                    .zone_id
                    .map_or(true, |zone| pool.zone_id == zone)
            })
            .filter(|pool| pool.available_bytes >= requirements.required_bytes)
            .filter(|pool| pool_supports_offering(pool, requirements.offering))
            .collect();

        eligible.sort_by(|a, b| {
            b.available_bytes
                .cmp(&a.available_bytes)
                .then_with(|| a.id.cmp(&b.id))
        });

        eligible
    }

    /// Best pool meeting the requirements
    pub fn select<'p>(
        requirements: &PoolRequirements<'_>,
        candidates: &'p [StoragePool],
    ) -> Option<&'p StoragePool> {
        Self::rank(requirements, candidates).into_iter().next()
    }
}
