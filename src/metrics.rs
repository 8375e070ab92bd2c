//! Orchestrator Metrics
//!
//! Prometheus counters and gauges for lifecycle transitions and migration
//! admission. Each orchestrator owns its own registry so that several
//! instances (tests, embedded use) never collide on metric names.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Metric handles for one orchestrator instance
#[derive(Clone)]
pub struct OrchestratorMetrics {
    registry: Registry,
    /// Committed transitions by event
    transitions: IntCounterVec,
    /// Rejected transitions by event
    rejected_transitions: IntCounterVec,
    /// Admission decisions by datastore and outcome
    admissions: IntCounterVec,
    /// Migrations currently holding a ticket, by datastore
    migrations_in_flight: IntGaugeVec,
    /// Snapshot replica outcomes by result
    replications: IntCounterVec,
}

impl std::fmt::Debug for OrchestratorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorMetrics").finish_non_exhaustive()
    }
}

impl OrchestratorMetrics {
    /// Create and register all metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let transitions = IntCounterVec::new(
            Opts::new(
                "volume_orchestrator_transitions_total",
                "Committed volume state transitions",
            ),
            &["event"],
        )
        .map_err(metrics_error)?;
        let rejected_transitions = IntCounterVec::new(
            Opts::new(
                "volume_orchestrator_rejected_transitions_total",
                "Volume events rejected by the state machine",
            ),
            &["event"],
        )
        .map_err(metrics_error)?;
        let admissions = IntCounterVec::new(
            Opts::new(
                "volume_orchestrator_migration_admissions_total",
                "Migration admission decisions",
            ),
            &["datastore", "outcome"],
        )
        .map_err(metrics_error)?;
        let migrations_in_flight = IntGaugeVec::new(
            Opts::new(
                "volume_orchestrator_migrations_in_flight",
                "Migrations holding an admission ticket",
            ),
            &["datastore"],
        )
        .map_err(metrics_error)?;
        let replications = IntCounterVec::new(
            Opts::new(
                "volume_orchestrator_snapshot_replications_total",
                "Snapshot zone replication outcomes",
            ),
            &["result"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(transitions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(rejected_transitions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(admissions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(migrations_in_flight.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(replications.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            transitions,
            rejected_transitions,
            admissions,
            migrations_in_flight,
            replications,
        })
    }

    pub fn record_transition(&self, event: &str) {
        self.transitions.with_label_values(&[event]).inc();
    }

    pub fn record_rejected_transition(&self, event: &str) {
        self.rejected_transitions.with_label_values(&[event]).inc();
    }

    pub fn record_admission(&self, datastore_id: &str, admitted: bool) {
        let outcome = if admitted { "admitted" } else { "declined" };
        self.admissions
            .with_label_values(&[datastore_id, outcome])
            .inc();
    }

    pub fn set_in_flight(&self, datastore_id: &str, in_flight: u64) {
        self.migrations_in_flight
            .with_label_values(&[datastore_id])
            .set(in_flight as i64);
    }

    pub fn record_replication(&self, succeeded: bool) {
        let result = if succeeded { "replicated" } else { "failed" };
        self.replications.with_label_values(&[result]).inc();
    }

    /// Number of committed transitions for an event
    pub fn transition_count(&self, event: &str) -> u64 {
        self.transitions.with_label_values(&[event]).get()
    }

    /// Number of admission decisions with the given outcome
    pub fn admission_count(&self, datastore_id: &str, admitted: bool) -> u64 {
        let outcome = if admitted { "admitted" } else { "declined" };
        self.admissions
            .with_label_values(&[datastore_id, outcome])
            .get()
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics are not UTF-8: {}", e)))
    }

    /// Content type of [`encode`](Self::encode) output
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

fn metrics_error(err: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = OrchestratorMetrics::new().unwrap();
        let b = OrchestratorMetrics::new().unwrap();

        a.record_transition("DestroyRequested");
        assert_eq!(a.transition_count("DestroyRequested"), 1);
        assert_eq!(b.transition_count("DestroyRequested"), 0);
    }

    #[test]
    fn test_encode_contains_admissions() {
        let metrics = OrchestratorMetrics::new().unwrap();
        metrics.record_admission("ds-1", true);
        metrics.record_admission("ds-1", false);
        metrics.set_in_flight("ds-1", 1);

        let text = metrics.encode().unwrap();
        assert!(text.contains("volume_orchestrator_migration_admissions_total"));
        assert!(text.contains("outcome=\"declined\""));
        assert!(text.contains("volume_orchestrator_migrations_in_flight{datastore=\"ds-1\"} 1"));
        assert_eq!(metrics.admission_count("ds-1", false), 1);
    }
}
