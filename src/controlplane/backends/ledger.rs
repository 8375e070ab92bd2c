//! In-Memory Capacity Ledger
//!
//! Authoritative byte reservations per pool. `reserve` re-checks free
//! capacity under the pool's entry lock, so two racing allocations can
//! never both take the last bytes.

use super::faults::FaultPlan;
use crate::domain::model::StoragePool;
use crate::domain::ports::CapacityAccounting;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

const COLLABORATOR: &str = "capacity-accounting";

#[derive(Debug, Clone, Copy)]
struct PoolUsage {
    capacity_bytes: u64,
    reserved_bytes: u64,
}

/// Capacity ledger kept in process memory
#[derive(Debug, Default)]
pub struct InMemoryCapacityLedger {
    pools: DashMap<String, PoolUsage>,
    faults: FaultPlan,
}

impl InMemoryCapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Bytes currently reserved on a pool
    pub fn reserved(&self, pool_id: &str) -> u64 {
        self.pools
            .get(pool_id)
            .map(|usage| usage.reserved_bytes)
            .unwrap_or(0)
    }
}

#[async_trait]
impl CapacityAccounting for InMemoryCapacityLedger {
    async fn track_pool(&self, pool: &StoragePool) -> Result<()> {
        let reserved_bytes = pool.capacity_bytes.saturating_sub(pool.available_bytes);
        self.pools
            .entry(pool.id.clone())
            .and_modify(|usage| usage.capacity_bytes = pool.capacity_bytes)
            .or_insert(PoolUsage {
                capacity_bytes: pool.capacity_bytes,
                reserved_bytes,
            });
        Ok(())
    }

    async fn reserve(&self, pool_id: &str, bytes: u64) -> Result<()> {
        self.faults.check(COLLABORATOR, "reserve")?;

        let mut usage = self.pools.get_mut(pool_id).ok_or_else(|| Error::PoolNotFound {
            pool_id: pool_id.to_string(),
        })?;

        let free = usage.capacity_bytes.saturating_sub(usage.reserved_bytes);
        if bytes > free {
            return Err(Error::capacity(format!(
                "pool {} has {} free bytes, {} requested",
                pool_id, free, bytes
            )));
        }
        usage.reserved_bytes += bytes;

        debug!(pool_id, bytes, reserved = usage.reserved_bytes, "Reserved pool capacity");
        Ok(())
    }

    async fn release(&self, pool_id: &str, bytes: u64) -> Result<()> {
        self.faults.check(COLLABORATOR, "release")?;

        let mut usage = self.pools.get_mut(pool_id).ok_or_else(|| Error::PoolNotFound {
            pool_id: pool_id.to_string(),
        })?;
        usage.reserved_bytes = usage.reserved_bytes.saturating_sub(bytes);

        debug!(pool_id, bytes, reserved = usage.reserved_bytes, "Released pool capacity");
        Ok(())
    }

    async fn available(&self, pool_id: &str) -> Result<u64> {
        self.pools
            .get(pool_id)
            .map(|usage| usage.capacity_bytes.saturating_sub(usage.reserved_bytes))
            .ok_or_else(|| Error::PoolNotFound {
                pool_id: pool_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reserve_and_release() {
        let ledger = InMemoryCapacityLedger::new();
        ledger
            .track_pool(&StoragePool::new("p1", "ds-1", "zone-a", 100))
            .await
            .unwrap();

        ledger.reserve("p1", 60).await.unwrap();
        assert_eq!(ledger.available("p1").await.unwrap(), 40);
        assert_eq!(
            ledger.reserve("p1", 41).await.unwrap_err().allocation_kind(),
            Some(crate::error::AllocationErrorKind::Capacity)
        );

        ledger.release("p1", 60).await.unwrap();
        assert_eq!(ledger.available("p1").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_racing_reservations_never_overcommit() {
        let ledger = Arc::new(InMemoryCapacityLedger::new());
        ledger
            .track_pool(&StoragePool::new("p1", "ds-1", "zone-a", 10))
            .await
            .unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move { ledger.reserve("p1", 1).await.is_ok() })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
        assert_eq!(ledger.reserved("p1"), 10);
    }
}
