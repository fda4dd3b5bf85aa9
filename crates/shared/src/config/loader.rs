//! Configuration loader
//!
//! Loads the controller configuration from a YAML file, falls back to the
//! built-in defaults when no file is given, and always validates the result.

use std::path::PathBuf;

use super::dto::{ClusterConfig, ControllerConfig};
use super::error::{ConfigError, Result};
use super::validator::validate_controller_config;

/// Configuration loader
///
/// # Example
///
/// ```ignore
/// use hodei_run_shared::config::ConfigLoader;
///
/// let loader = ConfigLoader::new(Some("/etc/hodei/run-controller.yaml".into()));
/// let config = loader.load()?;
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Optional path to the YAML configuration file
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new ConfigLoader
    ///
    /// With `None` the built-in defaults are used, which is what the tests
    /// and local development rely on.
    pub fn new(config_path: Option<PathBuf>) -> Self {
        Self { config_path }
    }

    /// Load and validate the controller configuration
    pub fn load(&self) -> Result<ControllerConfig> {
        let mut config = match &self.config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::FileRead {
                        path: path.clone(),
                        source,
                    }
                })?;
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            None => ControllerConfig::default(),
        };

        // The default alias is a guaranteed member of the cluster table.
        config
            .clusters
            .entry("default".to_string())
            .or_insert_with(ClusterConfig::default);

        validate_controller_config(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_defaults_without_file() {
        let config = ConfigLoader::new(None).load().unwrap();
        assert_eq!(config.worker_count, 20);
        assert_eq!(config.max_revivals, 3);
        assert!(config.clusters.contains_key("default"));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile_path("run-controller-test.yaml");
        write!(
            file.1,
            "job_run_namespace: runs\n\
             pod_namespace: pods\n\
             max_concurrency: 21\n\
             job_queue_capacities:\n  gpu: 5\n  blocked: 0\n\
             clusters:\n  trusted: {{}}\n"
        )
        .unwrap();

        let config = ConfigLoader::new(Some(file.0.clone())).load().unwrap();
        std::fs::remove_file(&file.0).ok();

        assert_eq!(config.job_run_namespace, "runs");
        assert_eq!(config.max_concurrency, 21);
        assert_eq!(config.queue_capacity("gpu"), Some(5));
        assert_eq!(config.queue_capacity("blocked"), Some(0));
        assert_eq!(config.queue_capacity("unknown"), None);
        // The default alias is inserted even when the file omits it
        assert!(config.clusters.contains_key("default"));
        assert!(config.clusters.contains_key("trusted"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = ConfigLoader::new(Some("/nonexistent/run.yaml".into()))
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    fn tempfile_path(name: &str) -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("{}-{}", std::process::id(), name));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
