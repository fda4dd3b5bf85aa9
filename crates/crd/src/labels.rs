//! Labels, annotations, and finalizers recognized on worker Pods

/// Cluster alias that must always be present in the alias table
pub const DEFAULT_CLUSTER_ALIAS: &str = "default";

/// Marks Pods created by this controller; the pod event predicate requires it
pub const CREATED_BY_LABEL: &str = "created-by-hodei";

/// Name of the owning JobRun; event demux maps Pod events through it
pub const JOB_RUN_ID_LABEL: &str = "run.hodei.io/id";

/// Job name, sanitized to label constraints; the full value lives in the
/// annotation of the same name
pub const JOB_NAME_LABEL: &str = "run.hodei.io/job";

/// Annotation carrying the untruncated job name
pub const JOB_NAME_ANNOTATION: &str = "run.hodei.io/job";

/// Build id stamped on the Pod; the recovery source when the status lost it
pub const BUILD_ID_LABEL: &str = "run.hodei.io/build-id";

/// Env var carrying the build id inside worker containers
pub const BUILD_ID_ENV: &str = "BUILD_ID";

/// Finalizers under this prefix (e.g. the log reporter's) are stripped by
/// the controller before any deletion it initiates
pub const FINALIZER_PREFIX: &str = "run.hodei.io/";

/// Finalizer placed by the log reporter sidecar machinery
pub const LOG_REPORTER_FINALIZER: &str = "run.hodei.io/log-reporter";

const MAX_LABEL_LEN: usize = 63;

/// Coerce an arbitrary string into a valid label value.
///
/// Invalid characters become `_`, the value is truncated to 63 characters,
/// and leading/trailing non-alphanumerics are trimmed. Values that need this
/// treatment are mirrored untouched in an annotation.
pub fn sanitize_label_value(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if out.len() > MAX_LABEL_LEN {
        out.truncate(MAX_LABEL_LEN);
    }

    let trimmed: &str = out.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_passthrough() {
        assert_eq!(sanitize_label_value("test-bazel-build"), "test-bazel-build");
    }

    #[test]
    fn test_sanitize_replaces_invalid_chars() {
        assert_eq!(sanitize_label_value("org/repo:job"), "org_repo_job");
    }

    #[test]
    fn test_sanitize_truncates_to_label_limit() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_label_value(&long).len(), 63);
    }

    #[test]
    fn test_sanitize_trims_non_alphanumeric_edges() {
        assert_eq!(sanitize_label_value("--job--"), "job");
        assert_eq!(sanitize_label_value("..."), "");
    }
}
