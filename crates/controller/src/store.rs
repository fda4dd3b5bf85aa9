//! JobRun store
//!
//! The reconciler, the admission controller, and the duplicate terminator
//! all read JobRuns through this seam; status writes go through the same
//! one. The production implementation talks to the apiserver, the tests use
//! the in-memory store from `testing`.

use async_trait::async_trait;
use hodei_run_crd::JobRun;
use hodei_run_shared::{ControllerError, Result};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;

#[async_trait]
pub trait JobRunStore: Send + Sync {
    /// Fetch one run by name; None when it no longer exists
    async fn get(&self, name: &str) -> Result<Option<JobRun>>;

    /// List every run in the controller namespace
    async fn list(&self) -> Result<Vec<JobRun>>;

    /// Persist the status subresource of a run
    async fn update_status(&self, run: &JobRun) -> Result<()>;
}

/// Store backed by the apiserver
pub struct ApiJobRunStore {
    runs: Api<JobRun>,
}

impl ApiJobRunStore {
    pub fn new(client: kube::Client, job_run_namespace: &str) -> Self {
        Self {
            runs: Api::namespaced(client, job_run_namespace),
        }
    }
}

#[async_trait]
impl JobRunStore for ApiJobRunStore {
    async fn get(&self, name: &str) -> Result<Option<JobRun>> {
        self.runs
            .get_opt(name)
            .await
            .map_err(ControllerError::from)
    }

    async fn list(&self) -> Result<Vec<JobRun>> {
        let runs = self.runs.list(&ListParams::default()).await?;
        Ok(runs.items)
    }

    async fn update_status(&self, run: &JobRun) -> Result<()> {
        let patch = serde_json::json!({ "status": run.status });
        self.runs
            .patch_status(&run.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
