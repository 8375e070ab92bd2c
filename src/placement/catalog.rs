//! Storage Catalog
//!
//! Disk offerings and storage pools known to the orchestrator. Pool free
//! capacity held here is a snapshot; the authoritative count lives with the
//! capacity accounting collaborator and is copied in before validation.

use crate::domain::model::{DiskOffering, StoragePool};
use crate::error::{Error, Result};
use dashmap::DashMap;
use tracing::debug;

/// Concurrent catalog of offerings and pools
#[derive(Debug, Default)]
pub struct StorageCatalog {
    offerings: DashMap<String, DiskOffering>,
    pools: DashMap<String, StoragePool>,
}

impl StorageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Offerings
    // =========================================================================

    /// Register or replace an offering
    pub fn add_offering(&self, offering: DiskOffering) {
        debug!(offering_id = %offering.id, tags = ?offering.tags, "Registered disk offering");
        self.offerings.insert(offering.id.clone(), offering);
    }

    pub fn offering(&self, offering_id: &str) -> Result<DiskOffering> {
        self.offerings
            .get(offering_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::OfferingNotFound {
                offering_id: offering_id.to_string(),
            })
    }

    pub fn offerings(&self) -> Vec<DiskOffering> {
        let mut offerings: Vec<DiskOffering> =
            self.offerings.iter().map(|e| e.value().clone()).collect();
        offerings.sort_by(|a, b| a.id.cmp(&b.id));
        offerings
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Register or replace a pool
    pub fn add_pool(&self, pool: StoragePool) {
        debug!(
            pool_id = %pool.id,
            datastore_id = %pool.datastore_id,
            capacity = pool.capacity_bytes,
            "Registered storage pool"
        );
        self.pools.insert(pool.id.clone(), pool);
    }

    pub fn pool(&self, pool_id: &str) -> Result<StoragePool> {
        self.pools
            .get(pool_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::PoolNotFound {
                pool_id: pool_id.to_string(),
            })
    }

    /// All pools, ordered by id
    pub fn pools(&self) -> Vec<StoragePool> {
        let mut pools: Vec<StoragePool> = self.pools.iter().map(|e| e.value().clone()).collect();
        pools.sort_by(|a, b| a.id.cmp(&b.id));
        pools
    }

    /// Pools in one zone, ordered by id
    pub fn pools_in_zone(&self, zone_id: &str) -> Vec<StoragePool> {
        self.pools()
            .into_iter()
            .filter(|pool| pool.zone_id == zone_id)
            .collect()
    }

    /// Record a fresh free-capacity reading for a pool
    pub fn set_available(&self, pool_id: &str, available_bytes: u64) -> Result<()> {
        let mut pool = self.pools.get_mut(pool_id).ok_or_else(|| Error::PoolNotFound {
            pool_id: pool_id.to_string(),
        })?;
        pool.available_bytes = available_bytes.min(pool.capacity_bytes);
        Ok(())
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_not_found() {
        let catalog = StorageCatalog::new();
        catalog.add_offering(DiskOffering::fixed("small", 10));
        catalog.add_pool(StoragePool::new("p1", "ds-1", "zone-a", 100));

        assert_eq!(catalog.offering("small").unwrap().size_bytes, 10);
        assert!(catalog.offering("large").unwrap_err().is_not_found());
        assert!(catalog.pool("p2").unwrap_err().is_not_found());
    }

    #[test]
    fn test_pools_in_zone_sorted() {
        let catalog = StorageCatalog::new();
        catalog.add_pool(StoragePool::new("p3", "ds-1", "zone-a", 100));
        catalog.add_pool(StoragePool::new("p1", "ds-1", "zone-a", 100));
        catalog.add_pool(StoragePool::new("p2", "ds-2", "zone-b", 100));

        let ids: Vec<String> = catalog.pools_in_zone("zone-a").into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["p1", "p3"]);
        assert_eq!(catalog.pool_count(), 3);
    }

    #[test]
    fn test_set_available_clamped_to_capacity() {
        let catalog = StorageCatalog::new();
        catalog.add_pool(StoragePool::new("p1", "ds-1", "zone-a", 100));

        catalog.set_available("p1", 40).unwrap();
        assert_eq!(catalog.pool("p1").unwrap().available_bytes, 40);

        catalog.set_available("p1", 500).unwrap();
        assert_eq!(catalog.pool("p1").unwrap().available_bytes, 100);
    }
}
