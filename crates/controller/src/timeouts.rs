//! Pod timeout evaluation
//!
//! Resolves the effective deadline per category (run override → controller
//! config) and measures a Pod against it. "Unscheduled" is measured from Pod
//! creation while the Pod has no start time; "Pending" and "Running" are
//! measured from the Pod start time.

use chrono::{DateTime, Duration, Utc};
use hodei_run_crd::JobRun;
use hodei_run_shared::ControllerConfig;
use k8s_openapi::api::core::v1::Pod;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCategory {
    Pending,
    Running,
    Unscheduled,
}

/// Outcome of measuring a Pod against its deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutVerdict {
    /// Still within the deadline; re-check after the remaining time
    Fresh { requeue_after: Duration },
    /// The deadline of the given category has passed
    Expired { category: TimeoutCategory },
}

/// Effective deadlines for one JobRun
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pending: Duration,
    running: Duration,
    unscheduled: Duration,
}

impl TimeoutPolicy {
    /// Resolve deadlines for a run: per-run override first, then the
    /// controller configuration (which already carries the built-in
    /// defaults).
    pub fn resolve(config: &ControllerConfig, run: &JobRun) -> Self {
        let overrides = run.spec.timeouts.as_ref();
        let pick = |o: Option<u64>, fallback: u64| {
            Duration::seconds(o.unwrap_or(fallback) as i64)
        };
        Self {
            pending: pick(
                overrides.and_then(|t| t.pod_pending_timeout_secs),
                config.pod_pending_timeout_secs,
            ),
            running: pick(
                overrides.and_then(|t| t.pod_running_timeout_secs),
                config.pod_running_timeout_secs,
            ),
            unscheduled: pick(
                overrides.and_then(|t| t.pod_unscheduled_timeout_secs),
                config.pod_unscheduled_timeout_secs,
            ),
        }
    }

    /// Measure a Pod against the category that currently applies.
    ///
    /// Pods in phase `Pending` without a start time count as unscheduled;
    /// everything else is measured from the Pod start time, falling back to
    /// the creation timestamp when the kubelet never reported one.
    pub fn evaluate(&self, pod: &Pod, now: DateTime<Utc>) -> TimeoutVerdict {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("");
        let start_time = pod.status.as_ref().and_then(|s| s.start_time.as_ref());

        let (category, deadline, since) = if phase == "Running" {
            let since = start_time
                .map(|t| t.0)
                .or_else(|| pod.metadata.creation_timestamp.as_ref().map(|t| t.0));
            (TimeoutCategory::Running, self.running, since.unwrap_or(now))
        } else if let Some(start) = start_time {
            (TimeoutCategory::Pending, self.pending, start.0)
        } else {
            let created = pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or(now);
            (TimeoutCategory::Unscheduled, self.unscheduled, created)
        };

        let age = now - since;
        if age >= deadline {
            TimeoutVerdict::Expired { category }
        } else {
            TimeoutVerdict::Fresh {
                requeue_after: std::cmp::max(deadline - age, Duration::zero()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{pod_created_at, pod_with_phase, triggered_run};
    use hodei_run_crd::TimeoutOverrides;

    fn config() -> ControllerConfig {
        ControllerConfig {
            pod_pending_timeout_secs: 3600,
            pod_running_timeout_secs: 7200,
            pod_unscheduled_timeout_secs: 300,
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn test_override_takes_precedence_over_config() {
        let mut run = triggered_run("r", "j");
        run.spec.timeouts = Some(TimeoutOverrides {
            pod_pending_timeout_secs: Some(7200),
            ..Default::default()
        });
        let policy = TimeoutPolicy::resolve(&config(), &run);
        assert_eq!(policy.pending, Duration::seconds(7200));
        // The other categories still come from the configuration
        assert_eq!(policy.running, Duration::seconds(7200));
        assert_eq!(policy.unscheduled, Duration::seconds(300));
    }

    #[test]
    fn test_unscheduled_pod_measured_from_creation() {
        let now = Utc::now();
        let run = triggered_run("r", "j");
        let policy = TimeoutPolicy::resolve(&config(), &run);

        let young = pod_created_at("p", "Pending", now - Duration::seconds(1), None);
        match policy.evaluate(&young, now) {
            TimeoutVerdict::Fresh { requeue_after } => {
                assert_eq!(requeue_after, Duration::seconds(299));
            }
            verdict => panic!("expected fresh, got {verdict:?}"),
        }

        let stale = pod_created_at("p", "Pending", now - Duration::seconds(301), None);
        assert_eq!(
            policy.evaluate(&stale, now),
            TimeoutVerdict::Expired {
                category: TimeoutCategory::Unscheduled
            }
        );
    }

    #[test]
    fn test_pending_pod_measured_from_start_time() {
        let now = Utc::now();
        let policy = TimeoutPolicy::resolve(&config(), &triggered_run("r", "j"));
        let pod = pod_created_at(
            "p",
            "Pending",
            now - Duration::hours(2),
            Some(now - Duration::hours(1)),
        );
        assert_eq!(
            policy.evaluate(&pod, now),
            TimeoutVerdict::Expired {
                category: TimeoutCategory::Pending
            }
        );
    }

    #[test]
    fn test_running_pod_requeue_is_remaining_time() {
        let now = Utc::now();
        let policy = TimeoutPolicy::resolve(&config(), &triggered_run("r", "j"));
        let pod = pod_created_at(
            "p",
            "Running",
            now - Duration::hours(1),
            Some(now - Duration::hours(1)),
        );
        match policy.evaluate(&pod, now) {
            TimeoutVerdict::Fresh { requeue_after } => {
                assert_eq!(requeue_after, Duration::hours(1));
            }
            verdict => panic!("expected fresh, got {verdict:?}"),
        }
    }

    #[test]
    fn test_running_pod_past_deadline_expires() {
        let now = Utc::now();
        let policy = TimeoutPolicy::resolve(&config(), &triggered_run("r", "j"));
        let mut pod = pod_with_phase("p", "Running");
        pod.status.as_mut().unwrap().start_time =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                now - Duration::hours(2),
            ));
        assert_eq!(
            policy.evaluate(&pod, now),
            TimeoutVerdict::Expired {
                category: TimeoutCategory::Running
            }
        );
    }
}
