//! Prometheus metrics for the run controller
//!
//! # Metrics Exposed
//!
//! - `hodei_run_reconciles_total{result}` - Reconcile passes by outcome
//! - `hodei_run_transitions_total{state}` - JobRun state transitions observed
//! - `hodei_run_admission_rejections_total` - Runs held back by admission
//! - `hodei_run_pod_revivals_total` - Worker Pods revived after going missing

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub state: String,
}

/// Controller metrics, cheap to clone and share across workers
#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    reconciles_total: Family<ResultLabels, Counter>,
    transitions_total: Family<StateLabels, Counter>,
    admission_rejections_total: Counter,
    pod_revivals_total: Counter,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register all metrics with a Prometheus registry
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "hodei_run_reconciles",
            "Reconcile passes by outcome",
            self.reconciles_total.clone(),
        );
        registry.register(
            "hodei_run_transitions",
            "JobRun state transitions observed",
            self.transitions_total.clone(),
        );
        registry.register(
            "hodei_run_admission_rejections",
            "Runs held back by admission control",
            self.admission_rejections_total.clone(),
        );
        registry.register(
            "hodei_run_pod_revivals",
            "Worker Pods revived after going missing",
            self.pod_revivals_total.clone(),
        );
    }

    pub fn observe_reconcile(&self, result: &'static str) {
        self.reconciles_total
            .get_or_create(&ResultLabels { result })
            .inc();
    }

    pub fn observe_transition(&self, state: impl ToString) {
        self.transitions_total
            .get_or_create(&StateLabels {
                state: state.to_string(),
            })
            .inc();
    }

    pub fn observe_admission_rejection(&self) {
        self.admission_rejections_total.inc();
    }

    pub fn observe_pod_revival(&self) {
        self.pod_revivals_total.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_count() {
        let metrics = ControllerMetrics::new();
        let mut registry = Registry::default();
        metrics.register(&mut registry);

        metrics.observe_reconcile("ok");
        metrics.observe_reconcile("ok");
        metrics.observe_reconcile("error");
        metrics.observe_admission_rejection();

        assert_eq!(
            metrics
                .reconciles_total
                .get_or_create(&ResultLabels { result: "ok" })
                .get(),
            2
        );
        assert_eq!(metrics.admission_rejections_total.get(), 1);
    }
}
