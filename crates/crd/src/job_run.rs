//! JobRun CRD - driven by the run controller through the Pod lifecycle

use crate::labels::DEFAULT_CLUSTER_ALIAS;
use crate::states::{ExecutionAgent, JobRunState, JobRunType};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PodSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// JobRun CRD - one invocation of a CI job, executed as a worker Pod
#[derive(CustomResource, Clone, Debug, Deserialize, JsonSchema, Serialize)]
#[kube(
    group = "run.hodei.io",
    version = "v1alpha1",
    kind = "JobRun",
    namespaced,
    status = "JobRunStatus",
    shortname = "jr"
)]
#[serde(rename_all = "camelCase")]
pub struct JobRunSpec {
    /// Agent in charge of execution; only `kubernetes` is handled here
    #[serde(default)]
    pub agent: ExecutionAgent,

    /// Job name (required)
    pub job: String,

    /// Kind of job this run was produced from
    #[serde(rename = "type")]
    pub job_type: JobRunType,

    /// Target cluster alias; empty means the default cluster
    #[serde(default)]
    pub cluster: String,

    /// Maximum number of concurrent runs of this job; 0 means unlimited
    #[serde(default)]
    pub max_concurrency: u32,

    /// Optional queue this run counts against; empty means no queue
    #[serde(default)]
    pub job_queue_name: String,

    /// Pod template for the worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "pod_spec_schema")]
    pub pod_spec: Option<PodSpec>,

    /// Per-run overrides for the pod timeouts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutOverrides>,

    /// Source refs; presubmit runs carry the pulls under test
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<Refs>,

    /// Treat an evicted worker Pod as an error instead of reviving it
    #[serde(default)]
    pub error_on_eviction: bool,

    /// Override for the configured maximum number of Pod revivals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_revivals: Option<u32>,
}

// The embedded PodSpec is passed through to the cluster untouched; its schema
// is too large to inline in the CRD.
fn pod_spec_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    }))
    .unwrap()
}

/// Per-run timeout overrides, taking precedence over the controller config
#[derive(Debug, Clone, Default, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_pending_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_running_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_unscheduled_timeout_secs: Option<u64>,
}

/// Source refs a run is built from
#[derive(Debug, Clone, Default, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Refs {
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub base_ref: String,
    #[serde(default)]
    pub base_sha: String,
    /// Pull requests under test; empty for non-presubmit runs
    #[serde(default)]
    pub pulls: Vec<Pull>,
}

/// One pull request under test
#[derive(Debug, Clone, Default, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pull {
    pub number: u64,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub sha: String,
}

/// JobRunStatus defines the observed state of a JobRun
#[derive(Debug, Clone, Default, Deserialize, JsonSchema, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobRunStatus {
    #[serde(default)]
    pub state: JobRunState,

    /// Name of the worker Pod on the target cluster; empty while none exists
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,

    /// Build id minted from the tot service, or recovered from the Pod
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_id: String,

    /// Rendered job URL; refreshed on every transition out of Triggered
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Set exactly once, on the Triggered → Pending edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_time: Option<DateTime<Utc>>,

    /// Non-nil for every terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Times the worker Pod was recreated after going missing
    #[serde(default)]
    pub pod_revival_count: u32,

    /// Human readable summary of the last transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl JobRun {
    /// Current state; `Scheduling` when the status subresource is absent
    pub fn state(&self) -> JobRunState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// A run is complete once its completion time is recorded
    pub fn complete(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.completion_time.is_some())
            .unwrap_or(false)
    }

    /// Cluster alias this run targets; empty resolves to the default alias
    pub fn effective_cluster(&self) -> &str {
        if self.spec.cluster.is_empty() {
            DEFAULT_CLUSTER_ALIAS
        } else {
            &self.spec.cluster
        }
    }

    /// Mutable status, initializing the subresource if it was never written
    pub fn status_mut(&mut self) -> &mut JobRunStatus {
        self.status.get_or_insert_with(JobRunStatus::default)
    }

    /// Pull numbers from the refs, sorted; the presubmit duplicate key
    pub fn pull_numbers(&self) -> Vec<u64> {
        let mut numbers: Vec<u64> = self
            .spec
            .refs
            .as_ref()
            .map(|refs| refs.pulls.iter().map(|p| p.number).collect())
            .unwrap_or_default();
        numbers.sort_unstable();
        numbers
    }

    /// Creation timestamp of the resource; missing timestamps sort first
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }
}
