//! The JobRun state machine
//!
//! One reconcile drives one JobRun. Dispatch is on the status state:
//! Triggered runs are admitted and get their worker Pod, Pending runs follow
//! the Pod through its phases, Aborted runs are completed once their Pod is
//! confirmed gone, and terminal runs only ever release their Pod.
//!
//! A reconcile is synchronous per call; concurrency comes from the worker
//! pool, and any error returned here is retried by the queue with backoff.

use crate::admission;
use crate::clock::Clock;
use crate::duplicates;
use crate::metrics::ControllerMetrics;
use crate::pod_factory::PodFactory;
use crate::pod_view::{ClusterViews, PodView, PodViewError};
use crate::store::JobRunStore;
use crate::timeouts::{TimeoutCategory, TimeoutPolicy, TimeoutVerdict};
use crate::tot::BuildIdMinter;
use crate::url::render_job_url;
use chrono::Duration as ChronoDuration;
use hodei_run_crd::{
    ExecutionAgent, JobRun, JobRunState, JobRunType, BUILD_ID_ENV, BUILD_ID_LABEL,
};
use hodei_run_shared::{ControllerConfig, ControllerError, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pod status reason reported for evicted workers
const EVICTED: &str = "Evicted";
/// Pod status reason when the node went away underneath the worker
const NODE_LOST: &str = "NodeLost";
/// Pod status reason when the node terminated the worker
const TERMINATED: &str = "Terminated";

/// Re-check cadence for a run held back by admission control
const ADMISSION_REQUEUE: Duration = Duration::from_secs(60);
/// Re-check cadence while waiting for the pod informer to catch up
const POD_MISSING_REQUEUE: Duration = Duration::from_secs(10);
/// How long a Pending run tolerates a missing Pod before reviving it
const POD_MISSING_GRACE_SECS: i64 = 60;

pub struct Reconciler {
    store: Arc<dyn JobRunStore>,
    clusters: ClusterViews,
    minter: Arc<dyn BuildIdMinter>,
    pod_factory: PodFactory,
    config: Arc<ControllerConfig>,
    clock: Arc<dyn Clock>,
    metrics: ControllerMetrics,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn JobRunStore>,
        clusters: ClusterViews,
        minter: Arc<dyn BuildIdMinter>,
        config: Arc<ControllerConfig>,
        clock: Arc<dyn Clock>,
        metrics: ControllerMetrics,
    ) -> Self {
        let pod_factory = PodFactory::new(config.pod_namespace.clone());
        Self {
            store,
            clusters,
            minter,
            pod_factory,
            config,
            clock,
            metrics,
        }
    }

    /// Reconcile one JobRun by name. Returns the delay after which the run
    /// wants to be looked at again, when a deadline is pending.
    pub async fn reconcile(&self, name: &str) -> Result<Option<Duration>> {
        let Some(mut run) = self.store.get(name).await? else {
            return Ok(None);
        };
        if run.spec.agent != ExecutionAgent::Kubernetes {
            return Ok(None);
        }

        if run.spec.job_type == JobRunType::Presubmit && !run.complete() {
            duplicates::terminate_dupes(self.store.as_ref(), &run, self.clock.now()).await?;
            // The pass above may have aborted this very run.
            let Some(reloaded) = self.store.get(name).await? else {
                return Ok(None);
            };
            run = reloaded;
        }

        match run.state() {
            JobRunState::Scheduling => Ok(None),
            JobRunState::Triggered => self.sync_triggered(&mut run).await,
            JobRunState::Pending => self.sync_pending(&mut run).await,
            JobRunState::Aborted if !run.complete() => self.sync_aborted(&mut run).await,
            _ => self.sync_terminal(&run).await,
        }
    }

    // =========================================================================
    // Triggered
    // =========================================================================

    async fn sync_triggered(&self, run: &mut JobRun) -> Result<Option<Duration>> {
        let snapshot = self.store.list().await?;
        if !admission::can_execute(run, &snapshot, &self.config) {
            debug!(run = %run.name_any(), "Run held back by admission control");
            self.metrics.observe_admission_rejection();
            return Ok(Some(ADMISSION_REQUEUE));
        }

        let alias = run.effective_cluster().to_string();
        let Some(pods) = self.clusters.view(&alias) else {
            self.complete(run, JobRunState::Error, format!("Unknown cluster alias {alias:?}."));
            self.store.update_status(run).await?;
            return Ok(None);
        };

        let pod_name = run.name_any();
        match pods.get(&pod_name).await.map_err(into_controller_error)? {
            Some(pod) => {
                // A previous pass created the Pod but never recorded it;
                // adopt it instead of erroring on AlreadyExists.
                debug!(run = %pod_name, cluster = %alias, "Adopting existing worker pod");
                let status = run.status_mut();
                status.pod_name = pod_name.clone();
                if status.build_id.is_empty() {
                    if let Some(id) = build_id_from_pod(&pod) {
                        status.build_id = id;
                    }
                }
            }
            None => {
                let build_id = self.minter.mint(&run.spec.job).await.map_err(|err| {
                    ControllerError::BuildId {
                        job: run.spec.job.clone(),
                        message: err.to_string(),
                    }
                })?;
                let pod = match self.pod_factory.build_pod(run, &build_id) {
                    Ok(pod) => pod,
                    Err(err) => {
                        self.complete(
                            run,
                            JobRunState::Error,
                            format!("Job cannot be processed: {err}."),
                        );
                        self.store.update_status(run).await?;
                        return Ok(None);
                    }
                };
                match pods.create(pod).await {
                    Ok(_) => {}
                    Err(err) if err.is_user_fatal() => {
                        warn!(run = %pod_name, error = %err, "Pod rejected by the cluster");
                        self.complete(
                            run,
                            JobRunState::Error,
                            format!("Job cannot be processed: {err}."),
                        );
                        self.store.update_status(run).await?;
                        return Ok(None);
                    }
                    Err(err) => return Err(into_controller_error(err)),
                }
                let status = run.status_mut();
                status.build_id = build_id;
                status.pod_name = pod_name.clone();
            }
        }

        let now = self.clock.now();
        let status = run.status_mut();
        status.state = JobRunState::Pending;
        if status.start_time.is_none() {
            status.start_time = Some(now);
        }
        if status.pending_time.is_none() {
            status.pending_time = Some(now);
        }
        status.description = "Job pod created.".to_string();
        self.refresh_url(run);
        self.store.update_status(run).await?;
        self.metrics.observe_transition(JobRunState::Pending);
        info!(run = %pod_name, cluster = %alias, "Run transitioned to pending");
        Ok(None)
    }

    // =========================================================================
    // Pending
    // =========================================================================

    async fn sync_pending(&self, run: &mut JobRun) -> Result<Option<Duration>> {
        let now = self.clock.now();
        let alias = run.effective_cluster().to_string();
        let Some(pods) = self.clusters.view(&alias) else {
            self.complete(run, JobRunState::Error, format!("Unknown cluster alias {alias:?}."));
            self.store.update_status(run).await?;
            return Ok(None);
        };

        let pod_name = pod_name_for(run);
        let Some(pod) = pods.get(&pod_name).await.map_err(into_controller_error)? else {
            return self.handle_missing_pod(run, now).await;
        };

        // A deletion observed before the Pod reached a terminal phase means
        // the worker is being torn down underneath us.
        if pod.metadata.deletion_timestamp.is_some() && !pod_phase_is_terminal(&pod) {
            if pod_reason(&pod) == NODE_LOST {
                // Let the Pod finalize fully; the next pass revives the run.
                pods.strip_finalizers(&pod_name)
                    .await
                    .map_err(into_controller_error)?;
                return Ok(Some(POD_MISSING_REQUEUE));
            }
            pods.strip_finalizers(&pod_name)
                .await
                .map_err(into_controller_error)?;
            self.complete(run, JobRunState::Error, "Job pod was deleted unexpectedly.");
            self.store.update_status(run).await?;
            return Ok(None);
        }

        match pod_phase(&pod) {
            "Succeeded" => {
                // A succeeded Pod with restarted containers hides an earlier
                // in-place failure; that is an infrastructure outcome.
                if has_restarted_containers(&pod) {
                    self.complete(
                        run,
                        JobRunState::Error,
                        "Job pod succeeded, but one or more containers had restarted.",
                    );
                } else {
                    // A clean success clears the description
                    self.complete(run, JobRunState::Success, "");
                }
                self.store.update_status(run).await?;
                Ok(None)
            }
            "Failed" => self.handle_failed_pod(run, &pod, pods.as_ref()).await,
            "Unknown" => {
                // The kubelet lost track of the worker. Delete the Pod and
                // let the next pass handle it as missing.
                pods.strip_finalizers(&pod_name)
                    .await
                    .map_err(into_controller_error)?;
                pods.delete(&pod_name).await.map_err(into_controller_error)?;
                Ok(Some(POD_MISSING_REQUEUE))
            }
            "Running" => {
                let before = run.status.clone();
                {
                    let status = run.status_mut();
                    if status.pending_time.is_none() {
                        status.pending_time = Some(now);
                    }
                    if status.build_id.is_empty() {
                        if let Some(id) = build_id_from_pod(&pod) {
                            status.build_id = id;
                        }
                    }
                }
                let policy = TimeoutPolicy::resolve(&self.config, run);
                match policy.evaluate(&pod, now) {
                    TimeoutVerdict::Expired { .. } => {
                        pods.strip_finalizers(&pod_name)
                            .await
                            .map_err(into_controller_error)?;
                        pods.delete(&pod_name).await.map_err(into_controller_error)?;
                        self.complete(
                            run,
                            JobRunState::Aborted,
                            "Job ran past its running deadline and was aborted.",
                        );
                        self.store.update_status(run).await?;
                        Ok(None)
                    }
                    TimeoutVerdict::Fresh { requeue_after } => {
                        self.refresh_url(run);
                        if run.status != before {
                            self.store.update_status(run).await?;
                        }
                        Ok(Some(to_std(requeue_after)))
                    }
                }
            }
            // Pod phase Pending (or not reported yet)
            _ => {
                let policy = TimeoutPolicy::resolve(&self.config, run);
                match policy.evaluate(&pod, now) {
                    TimeoutVerdict::Expired { category } => {
                        pods.strip_finalizers(&pod_name)
                            .await
                            .map_err(into_controller_error)?;
                        pods.delete(&pod_name).await.map_err(into_controller_error)?;
                        let description = match category {
                            TimeoutCategory::Unscheduled => {
                                "Pod could not be scheduled in time and was deleted."
                            }
                            _ => "Pod hit the pending deadline and was deleted.",
                        };
                        self.complete(run, JobRunState::Error, description);
                        self.store.update_status(run).await?;
                        Ok(None)
                    }
                    TimeoutVerdict::Fresh { requeue_after } => Ok(Some(to_std(requeue_after))),
                }
            }
        }
    }

    /// The Pod of a Pending run is gone. Within the grace window that is
    /// most likely informer lag; past it the run is revived onto a fresh
    /// Pod, counted against the revival budget.
    async fn handle_missing_pod(
        &self,
        run: &mut JobRun,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Option<Duration>> {
        let pending_since = run
            .status
            .as_ref()
            .and_then(|s| s.pending_time)
            .or_else(|| run.created_at())
            .unwrap_or(now);
        if now - pending_since < ChronoDuration::seconds(POD_MISSING_GRACE_SECS) {
            return Ok(Some(POD_MISSING_REQUEUE));
        }

        if run.status.as_ref().map(|s| s.pod_revival_count).unwrap_or(0)
            >= effective_max_revivals(run, &self.config)
        {
            self.complete(
                run,
                JobRunState::Error,
                "Job pod disappeared and the revival budget is exhausted.",
            );
            self.store.update_status(run).await?;
            return Ok(None);
        }

        warn!(run = %run.name_any(), "Worker pod went missing; reviving the run");
        let status = run.status_mut();
        status.pod_revival_count += 1;
        status.state = JobRunState::Triggered;
        status.pod_name.clear();
        status.description = "Job pod went missing; starting a new pod.".to_string();
        self.store.update_status(run).await?;
        self.metrics.observe_pod_revival();
        Ok(None)
    }

    async fn handle_failed_pod(
        &self,
        run: &mut JobRun,
        pod: &Pod,
        pods: &dyn PodView,
    ) -> Result<Option<Duration>> {
        match pod_reason(pod) {
            EVICTED => {
                let revival_count = run
                    .status
                    .as_ref()
                    .map(|s| s.pod_revival_count)
                    .unwrap_or(0);
                if run.spec.error_on_eviction {
                    self.complete(run, JobRunState::Error, "Job pod was evicted by the cluster.");
                    self.store.update_status(run).await?;
                    return Ok(None);
                }
                if revival_count >= effective_max_revivals(run, &self.config) {
                    self.complete(
                        run,
                        JobRunState::Error,
                        "Job pod was evicted and the revival budget is exhausted.",
                    );
                    self.store.update_status(run).await?;
                    return Ok(None);
                }
                // Delete the evicted Pod; the missing-pod path revives the
                // run and charges the revival budget.
                let pod_name = pod.name_any();
                pods.strip_finalizers(&pod_name)
                    .await
                    .map_err(into_controller_error)?;
                pods.delete(&pod_name).await.map_err(into_controller_error)?;
                info!(run = %run.name_any(), "Deleted evicted worker pod");
                Ok(Some(POD_MISSING_REQUEUE))
            }
            TERMINATED => {
                // Node-level termination; kept as a test failure behind the
                // config toggle.
                let state = if self.config.terminated_pod_is_failure {
                    JobRunState::Failure
                } else {
                    JobRunState::Error
                };
                self.complete(run, state, "Job pod was terminated by the cluster.");
                self.store.update_status(run).await?;
                Ok(None)
            }
            _ => {
                self.complete(run, JobRunState::Failure, "Job failed.");
                self.store.update_status(run).await?;
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Aborted and terminal states
    // =========================================================================

    /// An Aborted run is only marked complete once its Pod is confirmed
    /// gone; a stubborn Pod keeps the run in aborted-pending-cleanup and the
    /// delete error goes back to the queue.
    async fn sync_aborted(&self, run: &mut JobRun) -> Result<Option<Duration>> {
        let alias = run.effective_cluster().to_string();
        let pods = self
            .clusters
            .view(&alias)
            .ok_or(ControllerError::UnknownCluster { alias })?;

        let pod_name = pod_name_for(run);
        if pods
            .get(&pod_name)
            .await
            .map_err(into_controller_error)?
            .is_some()
        {
            pods.strip_finalizers(&pod_name)
                .await
                .map_err(into_controller_error)?;
            pods.delete(&pod_name).await.map_err(into_controller_error)?;
        }

        let now = self.clock.now();
        let status = run.status_mut();
        status.completion_time = Some(now);
        if status.description.is_empty() {
            status.description = "Job was aborted.".to_string();
        }
        self.refresh_url(run);
        self.store.update_status(run).await?;
        Ok(None)
    }

    /// Terminal runs never change state again; the only duty left is making
    /// sure the worker Pod has been asked to go away.
    async fn sync_terminal(&self, run: &JobRun) -> Result<Option<Duration>> {
        let Some(pods) = self.clusters.view(run.effective_cluster()) else {
            return Ok(None);
        };
        let pod_name = pod_name_for(run);
        match pods.get(&pod_name).await {
            Ok(Some(pod)) if pod.metadata.deletion_timestamp.is_none() => {
                if let Err(err) = pods.strip_finalizers(&pod_name).await {
                    debug!(run = %run.name_any(), error = %err, "Best-effort finalizer strip failed");
                    return Ok(None);
                }
                if let Err(err) = pods.delete(&pod_name).await {
                    debug!(run = %run.name_any(), error = %err, "Best-effort pod delete failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                debug!(run = %run.name_any(), error = %err, "Best-effort pod lookup failed");
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn complete(&self, run: &mut JobRun, state: JobRunState, description: impl Into<String>) {
        let now = self.clock.now();
        let status = run.status_mut();
        status.state = state;
        status.completion_time = Some(now);
        status.description = description.into();
        self.refresh_url(run);
        self.metrics.observe_transition(state);
    }

    fn refresh_url(&self, run: &mut JobRun) {
        let url = render_job_url(&self.config.job_url_template, run);
        if !url.is_empty() {
            run.status_mut().url = url;
        }
    }
}

fn pod_name_for(run: &JobRun) -> String {
    let status_name = run
        .status
        .as_ref()
        .map(|s| s.pod_name.as_str())
        .unwrap_or("");
    if status_name.is_empty() {
        run.name_any()
    } else {
        status_name.to_string()
    }
}

fn effective_max_revivals(run: &JobRun, config: &ControllerConfig) -> u32 {
    run.spec.max_revivals.unwrap_or(config.max_revivals)
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

fn pod_reason(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.reason.as_deref())
        .unwrap_or("")
}

fn pod_phase_is_terminal(pod: &Pod) -> bool {
    matches!(pod_phase(pod), "Succeeded" | "Failed")
}

/// A last termination state on any container means the Pod failed earlier
/// and got restarted in place before succeeding.
fn has_restarted_containers(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    status
        .container_statuses
        .iter()
        .flatten()
        .chain(status.init_container_statuses.iter().flatten())
        .any(|cs| {
            cs.last_state
                .as_ref()
                .map(|s| s.terminated.is_some())
                .unwrap_or(false)
        })
}

/// Recover a lost build id from the Pod: label first, then the BUILD_ID env
/// var of the first container.
fn build_id_from_pod(pod: &Pod) -> Option<String> {
    if let Some(id) = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(BUILD_ID_LABEL))
    {
        if !id.is_empty() {
            return Some(id.clone());
        }
    }
    pod.spec
        .as_ref()?
        .containers
        .first()?
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == BUILD_ID_ENV)
        .and_then(|e| e.value.clone())
}

fn into_controller_error(err: PodViewError) -> ControllerError {
    match err {
        PodViewError::Api(api) => ControllerError::KubeApi(api),
        rejected => ControllerError::Infrastructure {
            message: rejected.to_string(),
        },
    }
}

fn to_std(duration: ChronoDuration) -> Duration {
    duration.to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{pod_with_labels, pod_with_phase};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, EnvVar,
    };

    #[test]
    fn test_build_id_recovery_prefers_label() {
        let pod = pod_with_labels("p", &[(BUILD_ID_LABEL, "42")]);
        assert_eq!(build_id_from_pod(&pod), Some("42".to_string()));
    }

    #[test]
    fn test_build_id_recovery_falls_back_to_env() {
        let mut pod = pod_with_labels("p", &[(BUILD_ID_LABEL, "")]);
        pod.spec.as_mut().unwrap().containers[0].env = Some(vec![EnvVar {
            name: BUILD_ID_ENV.to_string(),
            value: Some("0987654321".to_string()),
            ..Default::default()
        }]);
        assert_eq!(build_id_from_pod(&pod), Some("0987654321".to_string()));
    }

    #[test]
    fn test_restarted_container_detection() {
        let mut pod = pod_with_phase("p", "Succeeded");
        assert!(!has_restarted_containers(&pod));

        pod.status.as_mut().unwrap().container_statuses = Some(vec![ContainerStatus {
            last_state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated::default()),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        assert!(has_restarted_containers(&pod));
    }
}
