//! Event demux
//!
//! Filters JobRun and Pod watch events down to the ones this controller
//! owns, and maps a Pod event back to the owning JobRun key.

use hodei_run_crd::{ExecutionAgent, JobRun, JobRunState, CREATED_BY_LABEL, JOB_RUN_ID_LABEL};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Accept a JobRun event: kubernetes agent, out of the Scheduling staging
/// state, and not yet complete.
pub fn wants_job_run(run: &JobRun) -> bool {
    run.spec.agent == ExecutionAgent::Kubernetes
        && run.state() != JobRunState::Scheduling
        && !run.complete()
}

/// Accept a Pod event: created by this controller and matching the
/// operator-supplied additional selector.
pub fn wants_pod(pod: &Pod, selector: &LabelSelector) -> bool {
    let Some(labels) = pod.metadata.labels.as_ref() else {
        return false;
    };
    if labels.get(CREATED_BY_LABEL).map(String::as_str) != Some("true") {
        return false;
    }
    selector.matches(labels)
}

/// Key of the JobRun owning a Pod: the ownership label when present, the
/// Pod name otherwise (the two are equal for Pods this controller created).
pub fn job_run_key_for_pod(pod: &Pod) -> String {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(JOB_RUN_ID_LABEL))
        .cloned()
        .unwrap_or_else(|| pod.name_any())
}

/// Equality label selector parsed from "key=value,key2=value2"
#[derive(Debug, Clone, Default)]
pub struct LabelSelector {
    pairs: Vec<(String, String)>,
}

impl LabelSelector {
    /// Parse an operator-supplied selector string; empty selects everything
    pub fn parse(selector: &str) -> Result<Self, String> {
        let mut pairs = Vec::new();
        for term in selector.split(',') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let Some((key, value)) = term.split_once('=') else {
                return Err(format!("Invalid selector term: {term:?}"));
            };
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(Self { pairs })
    }

    pub fn matches(&self, labels: &std::collections::BTreeMap<String, String>) -> bool {
        self.pairs
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}
