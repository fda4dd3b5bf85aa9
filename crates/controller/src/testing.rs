//! Test support: in-memory doubles for the controller seams
//!
//! Mirrors the platform's in-memory repositories: unit and integration
//! tests drive the real reconciler against these instead of an apiserver.

use crate::clock::Clock;
use crate::pod_view::{PodView, PodViewError, PodViewResult};
use crate::store::JobRunStore;
use crate::tot::{BuildIdError, BuildIdMinter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hodei_run_crd::JobRun;
use hodei_run_shared::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::core::ErrorResponse;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

// =============================================================================
// JobRun store
// =============================================================================

/// In-memory JobRun store tracking which runs had their status patched
#[derive(Default)]
pub struct InMemoryJobRunStore {
    runs: Mutex<HashMap<String, JobRun>>,
    patched: Mutex<Vec<String>>,
}

impl InMemoryJobRunStore {
    pub async fn insert(&self, run: JobRun) {
        self.runs.lock().await.insert(run.name_any(), run);
    }

    /// Names of runs whose status was patched, in order
    pub async fn patched(&self) -> Vec<String> {
        self.patched.lock().await.clone()
    }

    pub async fn all(&self) -> Vec<JobRun> {
        self.runs.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobRunStore for InMemoryJobRunStore {
    async fn get(&self, name: &str) -> Result<Option<JobRun>> {
        Ok(self.runs.lock().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<JobRun>> {
        Ok(self.runs.lock().await.values().cloned().collect())
    }

    async fn update_status(&self, run: &JobRun) -> Result<()> {
        let name = run.name_any();
        let mut runs = self.runs.lock().await;
        if let Some(stored) = runs.get_mut(&name) {
            stored.status = run.status.clone();
        } else {
            runs.insert(name.clone(), run.clone());
        }
        self.patched.lock().await.push(name);
        Ok(())
    }
}

// =============================================================================
// Pod view
// =============================================================================

/// Error injected into a fake Pod view call
#[derive(Debug, Clone)]
pub enum FailSpec {
    /// Rejection the reconciler must treat as user-fatal
    Rejected { code: u16, reason: String },
    /// Transient apiserver failure
    Transient { message: String },
}

impl FailSpec {
    pub fn rejected(code: u16, reason: &str) -> Self {
        FailSpec::Rejected {
            code,
            reason: reason.to_string(),
        }
    }

    pub fn transient(message: &str) -> Self {
        FailSpec::Transient {
            message: message.to_string(),
        }
    }

    fn to_error(&self) -> PodViewError {
        match self {
            FailSpec::Rejected { code, reason } => PodViewError::Rejected {
                code: *code,
                reason: reason.clone(),
                message: format!("synthetic {reason}"),
            },
            FailSpec::Transient { message } => PodViewError::Api(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: message.clone(),
                reason: "InternalError".to_string(),
                code: 500,
            })),
        }
    }
}

#[derive(Default)]
struct PodViewState {
    pods: HashMap<String, Pod>,
    deleted: Vec<String>,
    create_error: Option<FailSpec>,
    delete_error: Option<FailSpec>,
}

/// In-memory Pod view for one fake cluster.
///
/// Deletes fail while the Pod still carries any finalizer, which is how the
/// tests enforce that the controller always strips its finalizers before
/// deleting. A Pod with a deletion timestamp finalizes (disappears) the
/// moment its last finalizer is stripped.
#[derive(Default)]
pub struct InMemoryPodView {
    state: Mutex<PodViewState>,
}

impl InMemoryPodView {
    pub async fn insert_pod(&self, pod: Pod) {
        let name = pod.name_any();
        self.state.lock().await.pods.insert(name, pod);
    }

    pub async fn set_create_error(&self, spec: Option<FailSpec>) {
        self.state.lock().await.create_error = spec;
    }

    pub async fn set_delete_error(&self, spec: Option<FailSpec>) {
        self.state.lock().await.delete_error = spec;
    }

    pub async fn pod(&self, name: &str) -> Option<Pod> {
        self.state.lock().await.pods.get(name).cloned()
    }

    pub async fn pod_count(&self) -> usize {
        self.state.lock().await.pods.len()
    }

    pub async fn deleted(&self) -> Vec<String> {
        self.state.lock().await.deleted.clone()
    }
}

#[async_trait]
impl PodView for InMemoryPodView {
    async fn get(&self, name: &str) -> PodViewResult<Option<Pod>> {
        Ok(self.state.lock().await.pods.get(name).cloned())
    }

    async fn create(&self, pod: Pod) -> PodViewResult<Pod> {
        let mut state = self.state.lock().await;
        if let Some(spec) = &state.create_error {
            return Err(spec.to_error());
        }
        let name = pod.name_any();
        if state.pods.contains_key(&name) {
            return Err(PodViewError::Rejected {
                code: 409,
                reason: "AlreadyExists".to_string(),
                message: format!("pod {name} already exists"),
            });
        }
        state.pods.insert(name, pod.clone());
        Ok(pod)
    }

    async fn delete(&self, name: &str) -> PodViewResult<()> {
        let mut state = self.state.lock().await;
        if let Some(spec) = &state.delete_error {
            return Err(spec.to_error());
        }
        let Some(pod) = state.pods.get(name) else {
            // NotFound deletes are a success to the controller
            return Ok(());
        };
        let finalizers = pod
            .metadata
            .finalizers
            .as_ref()
            .map(|f| f.len())
            .unwrap_or(0);
        if finalizers > 0 {
            return Err(PodViewError::Api(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("pod {name} still has finalizers"),
                reason: "Conflict".to_string(),
                code: 409,
            })));
        }
        state.pods.remove(name);
        state.deleted.push(name.to_string());
        Ok(())
    }

    async fn strip_finalizers(&self, name: &str) -> PodViewResult<()> {
        let mut state = self.state.lock().await;
        let Some(pod) = state.pods.get_mut(name) else {
            return Ok(());
        };
        if let Some(finalizers) = pod.metadata.finalizers.as_mut() {
            finalizers.retain(|f| !f.starts_with(hodei_run_crd::FINALIZER_PREFIX));
        }
        let finalized = pod.metadata.deletion_timestamp.is_some()
            && pod
                .metadata
                .finalizers
                .as_ref()
                .map(|f| f.is_empty())
                .unwrap_or(true);
        if finalized {
            state.pods.remove(name);
        }
        Ok(())
    }
}

// =============================================================================
// Build-id minter and clock
// =============================================================================

/// Minter vending a fixed id, with optional failure injection
pub struct FixedBuildIdMinter {
    id: String,
    calls: AtomicUsize,
    error: StdMutex<Option<String>>,
}

impl FixedBuildIdMinter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            calls: AtomicUsize::new(0),
            error: StdMutex::new(None),
        }
    }

    pub fn fail_with(&self, message: &str) {
        *self.error.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildIdMinter for FixedBuildIdMinter {
    async fn mint(&self, _job: &str) -> std::result::Result<String, BuildIdError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.error.lock().unwrap().clone() {
            return Err(BuildIdError::Status {
                status: 503,
                body: message,
            });
        }
        Ok(self.id.clone())
    }
}

/// Clock pinned to an instant the test controls
pub struct FixedClock {
    now: StdMutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub mod fixtures {
    use chrono::{DateTime, Utc};
    use hodei_run_crd::{
        ExecutionAgent, JobRun, JobRunSpec, JobRunState, JobRunStatus, JobRunType, Pull, Refs,
    };
    use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    /// Worker pod namespace used across fixtures
    pub const POD_NAMESPACE: &str = "hodei-run-pods";

    pub fn base_run(name: &str, job: &str, job_type: JobRunType) -> JobRun {
        let mut run = JobRun::new(
            name,
            JobRunSpec {
                agent: ExecutionAgent::Kubernetes,
                job: job.to_string(),
                job_type,
                cluster: String::new(),
                max_concurrency: 0,
                job_queue_name: String::new(),
                pod_spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "test".to_string(),
                        env: Some(Vec::new()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                timeouts: None,
                refs: None,
                error_on_eviction: false,
                max_revivals: None,
            },
        );
        run.metadata = ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("hodei-runs".to_string()),
            uid: Some(format!("uid-{name}")),
            creation_timestamp: Some(Time(Utc::now())),
            ..Default::default()
        };
        run
    }

    pub fn triggered_run(name: &str, job: &str) -> JobRun {
        let mut run = base_run(name, job, JobRunType::Periodic);
        run.status = Some(JobRunStatus {
            state: JobRunState::Triggered,
            ..Default::default()
        });
        run
    }

    pub fn run_created_at(name: &str, job: &str, created: DateTime<Utc>) -> JobRun {
        let mut run = triggered_run(name, job);
        run.metadata.creation_timestamp = Some(Time(created));
        run
    }

    pub fn pending_run(name: &str, job: &str, queue: &str) -> JobRun {
        let mut run = base_run(name, job, JobRunType::Periodic);
        run.spec.job_queue_name = queue.to_string();
        run.status = Some(JobRunStatus {
            state: JobRunState::Pending,
            pod_name: name.to_string(),
            pending_time: Some(Utc::now()),
            start_time: Some(Utc::now()),
            ..Default::default()
        });
        run
    }

    pub fn presubmit_run(
        name: &str,
        job: &str,
        pulls: &[u64],
        state: JobRunState,
        start_time: Option<DateTime<Utc>>,
    ) -> JobRun {
        let mut run = base_run(name, job, JobRunType::Presubmit);
        run.spec.refs = Some(Refs {
            org: "fejtaverse".to_string(),
            repo: "spoon".to_string(),
            pulls: pulls
                .iter()
                .map(|number| Pull {
                    number: *number,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        });
        run.status = Some(JobRunStatus {
            state,
            start_time,
            ..Default::default()
        });
        run
    }

    pub fn pod_with_phase(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(POD_NAMESPACE.to_string()),
                creation_timestamp: Some(Time(Utc::now())),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "test".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    pub fn pod_created_at(
        name: &str,
        phase: &str,
        created: DateTime<Utc>,
        start_time: Option<DateTime<Utc>>,
    ) -> Pod {
        let mut pod = pod_with_phase(name, phase);
        pod.metadata.creation_timestamp = Some(Time(created));
        pod.status.as_mut().unwrap().start_time = start_time.map(Time);
        pod
    }

    pub fn pod_with_labels(name: &str, labels: &[(&str, &str)]) -> Pod {
        let mut pod = pod_with_phase(name, "Running");
        pod.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        pod
    }

    pub fn failed_pod(name: &str, reason: &str) -> Pod {
        let mut pod = pod_with_phase(name, "Failed");
        pod.status.as_mut().unwrap().reason = Some(reason.to_string());
        pod
    }
}
