//! Worker Pod construction
//!
//! Turns a JobRun into the Pod submitted to its target cluster: metadata,
//! ownership labels, and the env vars the job tooling reads.

use hodei_run_crd::{
    sanitize_label_value, JobRun, BUILD_ID_ENV, BUILD_ID_LABEL, CREATED_BY_LABEL,
    JOB_NAME_ANNOTATION, JOB_NAME_LABEL, JOB_RUN_ID_LABEL,
};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PodBuildError {
    /// The producer created a kubernetes run without a pod template; this is
    /// a user-fatal condition recorded on the JobRun
    #[error("JobRun does not carry a pod spec")]
    MissingPodSpec,
}

/// Builds worker Pods for one pod namespace
#[derive(Debug, Clone)]
pub struct PodFactory {
    pod_namespace: String,
}

impl PodFactory {
    pub fn new(pod_namespace: impl Into<String>) -> Self {
        Self {
            pod_namespace: pod_namespace.into(),
        }
    }

    /// Build the worker Pod for a run.
    ///
    /// The Pod name equals the JobRun name, which is what ties the two
    /// together across reconciles; labels carry the same linkage for the
    /// event demux.
    pub fn build_pod(&self, run: &JobRun, build_id: &str) -> Result<Pod, PodBuildError> {
        let template = run
            .spec
            .pod_spec
            .as_ref()
            .ok_or(PodBuildError::MissingPodSpec)?;
        let name = run.name_any();

        let mut spec: PodSpec = template.clone();
        // Workers run to completion exactly once; retries are modeled as
        // revivals of fresh Pods, never kubelet-level restarts.
        spec.restart_policy = Some("Never".to_string());
        for container in spec.containers.iter_mut() {
            stamp_env(container, run, build_id);
        }
        for container in spec.init_containers.iter_mut().flatten() {
            stamp_env(container, run, build_id);
        }

        let mut labels = BTreeMap::new();
        labels.insert(CREATED_BY_LABEL.to_string(), "true".to_string());
        labels.insert(JOB_RUN_ID_LABEL.to_string(), name.clone());
        labels.insert(
            JOB_NAME_LABEL.to_string(),
            sanitize_label_value(&run.spec.job),
        );
        labels.insert(BUILD_ID_LABEL.to_string(), build_id.to_string());

        let mut annotations = BTreeMap::new();
        annotations.insert(JOB_NAME_ANNOTATION.to_string(), run.spec.job.clone());

        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.pod_namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        })
    }
}

fn stamp_env(container: &mut Container, run: &JobRun, build_id: &str) {
    let stamps = [
        (BUILD_ID_ENV, build_id.to_string()),
        ("JOB_NAME", run.spec.job.clone()),
        ("JOB_TYPE", run.spec.job_type.to_string()),
        ("JOB_RUN_ID", run.name_any()),
    ];
    let env = container.env.get_or_insert_with(Vec::new);
    for (name, value) in stamps {
        if env.iter().any(|e| e.name == name) {
            continue;
        }
        env.push(EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::triggered_run;

    #[test]
    fn test_build_pod_stamps_metadata_and_env() {
        let run = triggered_run("blabla", "boop");
        let pod = PodFactory::new("pods").build_pod(&run, "0987654321").unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("blabla"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("pods"));

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(CREATED_BY_LABEL).unwrap(), "true");
        assert_eq!(labels.get(JOB_RUN_ID_LABEL).unwrap(), "blabla");
        assert_eq!(labels.get(BUILD_ID_LABEL).unwrap(), "0987654321");

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let env = spec.containers[0].env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "BUILD_ID"
            && e.value.as_deref() == Some("0987654321")));
        assert!(env.iter().any(|e| e.name == "JOB_NAME"));
    }

    #[test]
    fn test_build_pod_keeps_caller_env() {
        let mut run = triggered_run("r", "j");
        run.spec
            .pod_spec
            .as_mut()
            .unwrap()
            .containers[0]
            .env = Some(vec![EnvVar {
            name: "BUILD_ID".to_string(),
            value: Some("mine".to_string()),
            ..Default::default()
        }]);
        let pod = PodFactory::new("pods").build_pod(&run, "123").unwrap();
        let env = pod.spec.unwrap().containers[0].env.clone().unwrap();
        let build_ids: Vec<_> = env.iter().filter(|e| e.name == "BUILD_ID").collect();
        assert_eq!(build_ids.len(), 1);
        assert_eq!(build_ids[0].value.as_deref(), Some("mine"));
    }

    #[test]
    fn test_build_pod_without_template_fails() {
        let mut run = triggered_run("r", "j");
        run.spec.pod_spec = None;
        assert!(matches!(
            PodFactory::new("pods").build_pod(&run, "123"),
            Err(PodBuildError::MissingPodSpec)
        ));
    }
}
