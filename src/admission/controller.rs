//! Migration Admission Controller
//!
//! Bounds the number of concurrent migrations targeting each datastore.
//! Counters are per-datastore atomics inside a concurrent map; admission is
//! a single compare-and-swap on one counter, so no lock ever spans two
//! datastores and a declined caller never blocks.

use crate::error::{Error, Result};
use crate::metrics::OrchestratorMetrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Ceiling value meaning "no limit"
pub const UNLIMITED: u64 = 0;

/// Per-datastore migration admission
#[derive(Debug)]
pub struct MigrationAdmissionController {
    /// Maximum migrations per datastore, 0 = unlimited
    ceiling: AtomicU64,
    /// Outstanding tickets per datastore
    in_flight: DashMap<String, Arc<AtomicU64>>,
    metrics: Option<Arc<OrchestratorMetrics>>,
}

impl MigrationAdmissionController {
    /// Create a controller with the given ceiling
    pub fn new(ceiling: u64) -> Arc<Self> {
        Arc::new(Self {
            ceiling: AtomicU64::new(ceiling),
            in_flight: DashMap::new(),
            metrics: None,
        })
    }

    /// Create a controller reporting to `metrics`
    pub fn with_metrics(ceiling: u64, metrics: Arc<OrchestratorMetrics>) -> Arc<Self> {
        Arc::new(Self {
            ceiling: AtomicU64::new(ceiling),
            in_flight: DashMap::new(),
            metrics: Some(metrics),
        })
    }

    /// Current ceiling
    pub fn ceiling(&self) -> u64 {
        self.ceiling.load(Ordering::Acquire)
    }

    /// Change the ceiling; outstanding tickets are not revoked
    pub fn set_ceiling(&self, ceiling: u64) {
        let previous = self.ceiling.swap(ceiling, Ordering::AcqRel);
        if previous != ceiling {
            info!(previous, ceiling, "Migration admission ceiling changed");
        }
    }

    /// Outstanding tickets for a datastore
    pub fn in_flight(&self, datastore_id: &str) -> u64 {
        self.in_flight
            .get(datastore_id)
            .map(|counter| counter.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Admit one migration onto `datastore_id` or decline without blocking
    pub fn try_acquire(self: &Arc<Self>, datastore_id: &str) -> Result<AdmissionTicket> {
        let counter = self.counter(datastore_id);
        let ceiling = self.ceiling();

        let admitted = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (ceiling == UNLIMITED || current < ceiling).then_some(current + 1)
        });

        match admitted {
            Ok(previous) => {
                debug!(datastore_id, in_flight = previous + 1, ceiling, "Migration admitted");
                if let Some(metrics) = &self.metrics {
                    metrics.record_admission(datastore_id, true);
                    metrics.set_in_flight(datastore_id, previous + 1);
                }
                Ok(AdmissionTicket {
                    controller: Arc::clone(self),
                    datastore_id: datastore_id.to_string(),
                    acquired_at: Utc::now(),
                    released: false,
                })
            }
            Err(current) => {
                info!(datastore_id, in_flight = current, ceiling, "Migration admission declined");
                if let Some(metrics) = &self.metrics {
                    metrics.record_admission(datastore_id, false);
                }
                Err(Error::MigrationAdmissionDeclined {
                    datastore_id: datastore_id.to_string(),
                    in_flight: current,
                    ceiling,
                })
            }
        }
    }

    /// Release a ticket
    pub fn release(&self, ticket: AdmissionTicket) {
        ticket.release();
    }

    fn counter(&self, datastore_id: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.in_flight.get(datastore_id) {
            return Arc::clone(counter.value());
        }
        Arc::clone(
            self.in_flight
                .entry(datastore_id.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .value(),
        )
    }

    fn decrement(&self, datastore_id: &str) {
        let counter = self.counter(datastore_id);
        let previous = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            })
            .unwrap_or(0);
        let remaining = previous.saturating_sub(1);

        debug!(datastore_id, in_flight = remaining, "Migration admission released");
        if let Some(metrics) = &self.metrics {
            metrics.set_in_flight(datastore_id, remaining);
        }
    }
}

// =============================================================================
// Ticket
// =============================================================================

/// Proof of admission for one migration attempt.
///
/// Releasing consumes the ticket. A ticket dropped without an explicit
/// release is released on drop, so every exit path gives the slot back
/// exactly once.
#[derive(Debug)]
pub struct AdmissionTicket {
    controller: Arc<MigrationAdmissionController>,
    datastore_id: String,
    acquired_at: DateTime<Utc>,
    released: bool,
}

impl AdmissionTicket {
    pub fn datastore_id(&self) -> &str {
        &self.datastore_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Give the slot back
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.decrement(&self.datastore_id);
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Barrier;

    #[test]
    fn test_ceiling_declines_excess() {
        let controller = MigrationAdmissionController::new(2);

        let first = controller.try_acquire("ds-1").unwrap();
        let second = controller.try_acquire("ds-1").unwrap();
        let err = controller.try_acquire("ds-1").unwrap_err();
        assert_matches!(
            err,
            Error::MigrationAdmissionDeclined { in_flight: 2, ceiling: 2, .. }
        );

        // Other datastores have their own budget
        let other = controller.try_acquire("ds-2").unwrap();
        assert_eq!(controller.in_flight("ds-2"), 1);

        controller.release(first);
        assert_eq!(controller.in_flight("ds-1"), 1);
        let third = controller.try_acquire("ds-1").unwrap();

        drop((second, third, other));
        assert_eq!(controller.in_flight("ds-1"), 0);
        assert_eq!(controller.in_flight("ds-2"), 0);
    }

    #[test]
    fn test_unlimited_never_declines() {
        let controller = MigrationAdmissionController::new(UNLIMITED);
        let tickets: Vec<_> = (0..500)
            .map(|_| controller.try_acquire("ds-1").unwrap())
            .collect();
        assert_eq!(controller.in_flight("ds-1"), 500);
        drop(tickets);
        assert_eq!(controller.in_flight("ds-1"), 0);
    }

    #[test]
    fn test_release_exactly_once() {
        let controller = MigrationAdmissionController::new(1);
        let ticket = controller.try_acquire("ds-1").unwrap();
        assert_eq!(ticket.datastore_id(), "ds-1");

        // Explicit release followed by the implicit drop must count once
        ticket.release();
        assert_eq!(controller.in_flight("ds-1"), 0);

        let ticket = controller.try_acquire("ds-1").unwrap();
        drop(ticket);
        assert_eq!(controller.in_flight("ds-1"), 0);
    }

    #[test]
    fn test_ceiling_updatable_at_runtime() {
        let controller = MigrationAdmissionController::new(1);
        let held = controller.try_acquire("ds-1").unwrap();
        assert!(controller.try_acquire("ds-1").is_err());

        controller.set_ceiling(3);
        let more: Vec<_> = (0..2).map(|_| controller.try_acquire("ds-1").unwrap()).collect();
        assert!(controller.try_acquire("ds-1").is_err());

        // Lowering does not revoke outstanding tickets
        controller.set_ceiling(1);
        assert_eq!(controller.in_flight("ds-1"), 3);
        drop(more);
        assert!(controller.try_acquire("ds-1").is_err());
        drop(held);
        assert!(controller.try_acquire("ds-1").is_ok());
    }

    #[test]
    fn test_concurrent_acquire_respects_ceiling() {
        const CEILING: u64 = 3;
        const THREADS: usize = 16;

        let controller = MigrationAdmissionController::new(CEILING);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let controller = Arc::clone(&controller);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    controller.try_acquire("ds-1").ok()
                })
            })
            .collect();

        let tickets: Vec<AdmissionTicket> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(tickets.len() as u64, CEILING);
        assert_eq!(controller.in_flight("ds-1"), CEILING);
        drop(tickets);
        assert_eq!(controller.in_flight("ds-1"), 0);
    }

    #[test]
    fn test_metrics_reported() {
        let metrics = Arc::new(OrchestratorMetrics::new().unwrap());
        let controller = MigrationAdmissionController::with_metrics(1, Arc::clone(&metrics));

        let _ticket = controller.try_acquire("ds-1").unwrap();
        let _ = controller.try_acquire("ds-1");

        assert_eq!(metrics.admission_count("ds-1", true), 1);
        assert_eq!(metrics.admission_count("ds-1", false), 1);
    }
}
