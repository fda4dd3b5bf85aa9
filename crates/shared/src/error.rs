use crate::config::ConfigError;
use thiserror::Error;

/// Errors surfaced by the run controller to the work queue.
///
/// Anything that reaches the queue as an `Err` is retried with exponential
/// backoff; user-fatal conditions never become a `ControllerError`, they are
/// recorded on the JobRun status instead.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Unknown cluster alias: {alias}")]
    UnknownCluster { alias: String },

    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    #[error("Failed to mint build id for job {job}: {message}")]
    BuildId { job: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Infrastructure error: {message}")]
    Infrastructure { message: String },
}

pub type Result<T> = std::result::Result<T, ControllerError>;
