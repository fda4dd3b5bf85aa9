//! Configuration validation

use super::dto::ControllerConfig;
use super::error::{ConfigError, Result};

/// Validate a loaded controller configuration
///
/// Rejects configurations the controller could not run with; defaults are
/// applied by the loader before validation, so everything here is a hard
/// operator mistake.
pub fn validate_controller_config(config: &ControllerConfig) -> Result<()> {
    if config.job_run_namespace.is_empty() {
        return Err(invalid("job_run_namespace", "must not be empty"));
    }
    if config.pod_namespace.is_empty() {
        return Err(invalid("pod_namespace", "must not be empty"));
    }
    if config.worker_count == 0 {
        return Err(invalid("worker_count", "must be at least 1"));
    }
    if config.pod_pending_timeout_secs == 0 {
        return Err(invalid("pod_pending_timeout_secs", "must be positive"));
    }
    if config.pod_running_timeout_secs == 0 {
        return Err(invalid("pod_running_timeout_secs", "must be positive"));
    }
    if config.pod_unscheduled_timeout_secs == 0 {
        return Err(invalid("pod_unscheduled_timeout_secs", "must be positive"));
    }
    if config.clusters.keys().any(|alias| alias.is_empty()) {
        return Err(invalid("clusters", "cluster aliases must not be empty"));
    }
    match config.clusters.get("default") {
        None => {
            return Err(invalid("clusters", "the default alias must be present"));
        }
        // The default alias is the cluster the controller itself runs
        // against; it always uses the ambient configuration.
        Some(default_cluster)
            if default_cluster.kubeconfig_path.is_some() || default_cluster.context.is_some() =>
        {
            return Err(invalid(
                "clusters",
                "the default alias cannot be redefined with a kubeconfig or context",
            ));
        }
        Some(_) => {}
    }
    if config
        .job_queue_capacities
        .values()
        .any(|capacity| *capacity < -1)
    {
        return Err(invalid(
            "job_queue_capacities",
            "capacities below -1 have no meaning",
        ));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_controller_config(&ControllerConfig::default()).is_ok());
    }

    #[test]
    fn test_empty_namespace_rejected() {
        let mut config = ControllerConfig::default();
        config.pod_namespace.clear();
        assert!(validate_controller_config(&config).is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = ControllerConfig::default();
        config.worker_count = 0;
        assert!(validate_controller_config(&config).is_err());
    }

    #[test]
    fn test_missing_default_cluster_rejected() {
        let mut config = ControllerConfig::default();
        config.clusters.remove("default");
        assert!(validate_controller_config(&config).is_err());
    }

    #[test]
    fn test_redefined_default_cluster_rejected() {
        let mut config = ControllerConfig::default();
        config.clusters.insert(
            "default".to_string(),
            ClusterConfig {
                kubeconfig_path: Some("/etc/hodei/other.kubeconfig".into()),
                context: None,
            },
        );
        assert!(validate_controller_config(&config).is_err());

        let mut config = ControllerConfig::default();
        config.clusters.insert(
            "default".to_string(),
            ClusterConfig {
                kubeconfig_path: None,
                context: Some("other".to_string()),
            },
        );
        assert!(validate_controller_config(&config).is_err());
    }

    #[test]
    fn test_nonsense_queue_capacity_rejected() {
        let mut config = ControllerConfig::default();
        config
            .job_queue_capacities
            .insert("queue".to_string(), -2);
        assert!(validate_controller_config(&config).is_err());
    }
}
