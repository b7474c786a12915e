//! Reconciliation metrics
//!
//! Counters are created from an OpenTelemetry [`Meter`] and handed to the
//! controller through its context. Without an installed meter provider the
//! global meter is a no-op, so tests and local runs need no setup.
//!
//! Registration with an exporter is left to the embedding binary.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

/// Counters recorded by the reconciler and the rollout monitor
#[derive(Clone)]
pub struct ReconcileMetrics {
    resources_generated: Counter<u64>,
    retries: Counter<u64>,
    synchronizations: Counter<u64>,
    rollouts_complete: Counter<u64>,
}

impl ReconcileMetrics {
    /// Build counters on the given meter
    pub fn new(meter: &Meter) -> Self {
        Self {
            resources_generated: meter
                .u64_counter("keel_resources_generated_total")
                .with_description("Operations applied by successful rollouts")
                .with_unit("{operations}")
                .build(),
            retries: meter
                .u64_counter("keel_reconcile_retries_total")
                .with_description("Rollouts interrupted by a transient failure")
                .with_unit("{retries}")
                .build(),
            synchronizations: meter
                .u64_counter("keel_synchronizations_total")
                .with_description("Reconciliations by resulting synchronization state")
                .with_unit("{reconciliations}")
                .build(),
            rollouts_complete: meter
                .u64_counter("keel_rollouts_complete_total")
                .with_description("Rollouts observed to completion")
                .with_unit("{rollouts}")
                .build(),
        }
    }

    /// Build counters on the global `keel` meter
    pub fn from_global() -> Self {
        Self::new(&global::meter("keel"))
    }

    /// Count operations applied for a Source kind
    pub fn record_resources_generated(&self, kind: &str, count: usize) {
        self.resources_generated
            .add(count as u64, &[KeyValue::new("kind", kind.to_string())]);
    }

    /// Count a transient execution failure
    pub fn record_retry(&self, kind: &str) {
        self.retries
            .add(1, &[KeyValue::new("kind", kind.to_string())]);
    }

    /// Count a reconciliation that ended in `state`
    pub fn record_synchronization(&self, kind: &str, state: &str) {
        self.synchronizations.add(
            1,
            &[
                KeyValue::new("kind", kind.to_string()),
                KeyValue::new("state", state.to_string()),
            ],
        );
    }

    /// Count a completed rollout
    pub fn record_rollout_complete(&self, kind: &str) {
        self.rollouts_complete
            .add(1, &[KeyValue::new("kind", kind.to_string())]);
    }
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self::from_global()
    }
}
