//! Configuration Data Transfer Objects (DTOs)
//!
//! This module defines the immutable configuration DTO consumed by the run
//! controller. It is loaded once at startup and passed to every component
//! via dependency injection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Configuration DTO for the run controller
///
/// This is the single source of truth for controller behavior. Durations are
/// expressed in seconds so the YAML stays free of format ambiguity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// Namespace the JobRun resources live in
    pub job_run_namespace: String,

    /// Namespace worker Pods are created in, on every target cluster
    pub pod_namespace: String,

    /// Global cap on concurrently Pending runs; 0 disables the cap
    pub max_concurrency: u32,

    /// Size of the reconcile worker pool
    pub worker_count: usize,

    /// Default cap on Pod revivals per run; overridable per JobRun
    pub max_revivals: u32,

    /// Deadline for a scheduled Pod to leave the Pending phase (seconds)
    pub pod_pending_timeout_secs: u64,

    /// Deadline for a Running Pod to finish (seconds)
    pub pod_running_timeout_secs: u64,

    /// Deadline for an unscheduled Pod to be placed on a node (seconds)
    pub pod_unscheduled_timeout_secs: u64,

    /// Map a Pod that failed with reason `Terminated` to Failure (test
    /// outcome) instead of Error (infrastructure outcome)
    pub terminated_pod_is_failure: bool,

    /// Job URL template with `{name}`, `{job}`, `{state}`, `{build_id}` and
    /// `{type}` placeholders; empty disables URL stamping
    pub job_url_template: String,

    /// Additional equality label selector for Pod events, e.g. "team=infra"
    pub pod_label_selector: String,

    /// Per-queue capacities: -1 = unlimited, 0 = blocked, n = cap
    pub job_queue_capacities: HashMap<String, i64>,

    /// Target cluster alias table; the `default` alias is always present
    pub clusters: HashMap<String, ClusterConfig>,
}

/// Connection settings for one target cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Path to a kubeconfig file; None means in-cluster configuration
    pub kubeconfig_path: Option<PathBuf>,

    /// Kubeconfig context to use; None means current-context
    pub context: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let mut clusters = HashMap::new();
        clusters.insert("default".to_string(), ClusterConfig::default());

        Self {
            job_run_namespace: "hodei-runs".to_string(),
            pod_namespace: "hodei-run-pods".to_string(),
            max_concurrency: 0,
            worker_count: 20,
            max_revivals: 3,
            pod_pending_timeout_secs: 10 * 60,
            pod_running_timeout_secs: 48 * 60 * 60,
            pod_unscheduled_timeout_secs: 5 * 60,
            terminated_pod_is_failure: true,
            job_url_template: String::new(),
            pod_label_selector: String::new(),
            job_queue_capacities: HashMap::new(),
            clusters,
        }
    }
}

impl ControllerConfig {
    /// Capacity for a queue name; None when the queue has no configured cap
    pub fn queue_capacity(&self, queue: &str) -> Option<i64> {
        self.job_queue_capacities.get(queue).copied()
    }
}
