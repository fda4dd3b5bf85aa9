//! Per-cluster typed access to worker Pods
//!
//! Every target cluster is reached through its own `PodView`. The map of
//! alias → view is built once at startup; the `default` alias is a
//! guaranteed member and is consulted whenever a JobRun leaves its cluster
//! field empty.

use async_trait::async_trait;
use hodei_run_crd::FINALIZER_PREFIX;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors from Pod reads and writes against one cluster
#[derive(Error, Debug)]
pub enum PodViewError {
    /// The apiserver rejected the Pod for a reason retrying cannot fix
    /// (422 Invalid, 403 Forbidden, 409 AlreadyExists)
    #[error("Pod rejected by the cluster ({code} {reason}): {message}")]
    Rejected {
        code: u16,
        reason: String,
        message: String,
    },

    #[error(transparent)]
    Api(#[from] kube::Error),
}

impl PodViewError {
    /// True when the error must complete the JobRun as Error instead of
    /// being retried
    pub fn is_user_fatal(&self) -> bool {
        matches!(self, PodViewError::Rejected { .. })
    }

    fn classify(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if matches!(ae.code, 403 | 409 | 422) => PodViewError::Rejected {
                code: ae.code,
                reason: ae.reason,
                message: ae.message,
            },
            other => PodViewError::Api(other),
        }
    }
}

pub type PodViewResult<T> = std::result::Result<T, PodViewError>;

/// Typed Pod operations against a single target cluster.
///
/// All operations are idempotent at the system level: `get` maps NotFound to
/// `None` and `delete` treats NotFound as success, so a reconcile can always
/// be replayed.
#[async_trait]
pub trait PodView: Send + Sync {
    async fn get(&self, name: &str) -> PodViewResult<Option<Pod>>;

    async fn create(&self, pod: Pod) -> PodViewResult<Pod>;

    async fn delete(&self, name: &str) -> PodViewResult<()>;

    /// Remove every finalizer under the controller's prefix so a deletion
    /// initiated by the controller cannot be blocked by its own reporters
    async fn strip_finalizers(&self, name: &str) -> PodViewResult<()>;
}

/// PodView backed by a kube client for one cluster
pub struct KubePodView {
    pods: Api<Pod>,
}

impl KubePodView {
    pub fn new(client: kube::Client, pod_namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client, pod_namespace),
        }
    }
}

#[async_trait]
impl PodView for KubePodView {
    async fn get(&self, name: &str) -> PodViewResult<Option<Pod>> {
        self.pods.get_opt(name).await.map_err(PodViewError::from)
    }

    async fn create(&self, pod: Pod) -> PodViewResult<Pod> {
        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(PodViewError::classify)
    }

    async fn delete(&self, name: &str) -> PodViewResult<()> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn strip_finalizers(&self, name: &str) -> PodViewResult<()> {
        let Some(pod) = self.get(name).await? else {
            return Ok(());
        };
        let Some(finalizers) = pod.metadata.finalizers.as_ref() else {
            return Ok(());
        };

        let retained: Vec<String> = finalizers
            .iter()
            .filter(|f| !f.starts_with(FINALIZER_PREFIX))
            .cloned()
            .collect();
        if retained.len() == finalizers.len() {
            return Ok(());
        }

        debug!(pod = name, "Stripping controller finalizers");
        let patch = serde_json::json!({ "metadata": { "finalizers": retained } });
        self.pods
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Map of cluster alias → Pod view, shared across reconcile workers
#[derive(Clone)]
pub struct ClusterViews {
    views: Arc<HashMap<String, Arc<dyn PodView>>>,
}

impl ClusterViews {
    /// Build the alias table. The caller must include the `default` alias;
    /// the configuration layer guarantees it.
    pub fn new(views: HashMap<String, Arc<dyn PodView>>) -> Self {
        Self {
            views: Arc::new(views),
        }
    }

    /// Resolve an alias to its view; unknown aliases are an operator or
    /// producer mistake surfaced by the reconciler
    pub fn view(&self, alias: &str) -> Option<Arc<dyn PodView>> {
        self.views.get(alias).cloned()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.views.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("synthetic {reason}"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_user_fatal_classification() {
        for (code, reason) in [(403, "Forbidden"), (409, "AlreadyExists"), (422, "Invalid")] {
            let err = PodViewError::classify(api_error(code, reason));
            assert!(err.is_user_fatal(), "{code} should be user fatal");
        }
    }

    #[test]
    fn test_transient_errors_stay_retryable() {
        let err = PodViewError::classify(api_error(500, "InternalError"));
        assert!(!err.is_user_fatal());
        let err = PodViewError::classify(api_error(404, "NotFound"));
        assert!(!err.is_user_fatal());
    }
}
