//! Admission control for Triggered runs
//!
//! A Triggered run may move to Pending only when the per-job cap, the queue
//! capacity, and the global cap all allow it. Two reconciles racing on two
//! candidates must agree on who wins, so Triggered peers are ranked by the
//! total order (creation timestamp, uid): strictly older wins, equal
//! timestamps fall back to the lexicographically smaller uid.

use crate::pending::PendingCounts;
use hodei_run_crd::{ExecutionAgent, JobRun, JobRunState};
use hodei_run_shared::ControllerConfig;
use kube::ResourceExt;
use tracing::debug;

/// Decide whether a Triggered run may start now.
///
/// `runs` is a snapshot of the store taken by the caller; the candidate
/// itself is filtered out by uid, so it may appear in the snapshot.
pub fn can_execute(run: &JobRun, runs: &[JobRun], config: &ControllerConfig) -> bool {
    let counts = PendingCounts::from_runs(runs);

    if run.spec.max_concurrency > 0 {
        let pending = counts.pending_for_job(&run.spec.job);
        let older = runs
            .iter()
            .filter(|other| other.spec.job == run.spec.job)
            .filter(|other| loses_tiebreak_to(run, other))
            .count();
        if pending + older >= run.spec.max_concurrency as usize {
            debug!(
                run = %run.name_any(),
                job = %run.spec.job,
                pending,
                older_triggered = older,
                max_concurrency = run.spec.max_concurrency,
                "Job concurrency cap reached"
            );
            return false;
        }
    }

    if !run.spec.job_queue_name.is_empty() {
        // A queue without a configured capacity is unbounded.
        if let Some(capacity) = config.queue_capacity(&run.spec.job_queue_name) {
            if capacity == 0 {
                return false;
            }
            if capacity > 0 {
                let pending = counts.pending_in_queue(&run.spec.job_queue_name);
                let older = runs
                    .iter()
                    .filter(|other| other.spec.job_queue_name == run.spec.job_queue_name)
                    .filter(|other| loses_tiebreak_to(run, other))
                    .count();
                if pending + older >= capacity as usize {
                    debug!(
                        run = %run.name_any(),
                        queue = %run.spec.job_queue_name,
                        pending,
                        older_triggered = older,
                        capacity,
                        "Queue capacity reached"
                    );
                    return false;
                }
            }
        }
    }

    if config.max_concurrency > 0 && counts.pending_total() >= config.max_concurrency as usize {
        debug!(
            run = %run.name_any(),
            pending_total = counts.pending_total(),
            max_concurrency = config.max_concurrency,
            "Global concurrency cap reached"
        );
        return false;
    }

    true
}

/// True when `other` is a Triggered peer that outranks the candidate.
fn loses_tiebreak_to(candidate: &JobRun, other: &JobRun) -> bool {
    if other.uid() == candidate.uid() {
        return false;
    }
    if other.spec.agent != ExecutionAgent::Kubernetes {
        return false;
    }
    if other.state() != JobRunState::Triggered || other.complete() {
        return false;
    }
    match (other.created_at(), candidate.created_at()) {
        (Some(o), Some(c)) if o != c => o < c,
        (None, Some(_)) => true,
        (Some(_), None) => false,
        // Identical or both missing creation timestamps: the smaller uid wins
        _ => other.uid() < candidate.uid(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{pending_run, run_created_at, triggered_run};
    use chrono::{Duration, Utc};

    fn config() -> ControllerConfig {
        ControllerConfig::default()
    }

    #[test]
    fn test_max_concurrency_zero_always_runs() {
        let run = triggered_run("candidate", "my-job");
        assert!(can_execute(&run, &[], &config()));
    }

    #[test]
    fn test_pending_exceeds_max_concurrency() {
        let mut run = triggered_run("candidate", "my-job");
        run.spec.max_concurrency = 10;
        let peers: Vec<_> = (0..10)
            .map(|i| pending_run(&format!("my-job-{i}"), "my-job", ""))
            .collect();
        assert!(!can_execute(&run, &peers, &config()));
    }

    #[test]
    fn test_pending_plus_older_triggered_reaches_cap() {
        let now = Utc::now();
        let mut run = run_created_at("candidate", "my-job", now);
        run.spec.max_concurrency = 10;
        let mut peers: Vec<_> = (0..9)
            .map(|i| pending_run(&format!("my-job-{i}"), "my-job", ""))
            .collect();
        peers.push(run_created_at("older", "my-job", now - Duration::hours(1)));
        assert!(!can_execute(&run, &peers, &config()));
    }

    #[test]
    fn test_newer_triggered_peers_do_not_count() {
        let now = Utc::now();
        let mut run = run_created_at("candidate", "my-job", now - Duration::hours(1));
        run.spec.max_concurrency = 1;
        let peers = vec![run_created_at("newer", "my-job", now)];
        assert!(can_execute(&run, &peers, &config()));
    }

    #[test]
    fn test_completed_peers_do_not_count() {
        let now = Utc::now();
        let mut run = run_created_at("candidate", "my-job", now);
        run.spec.max_concurrency = 2;
        let mut done = run_created_at("done", "my-job", now - Duration::hours(2));
        done.status_mut().completion_time = Some(now);
        let peers = vec![done, pending_run("my-job-0", "my-job", "")];
        assert!(can_execute(&run, &peers, &config()));
    }

    #[test]
    fn test_equal_creation_breaks_tie_by_uid() {
        let now = Utc::now();
        let mut first = run_created_at("first", "my-job", now);
        first.metadata.uid = Some("aaaa".to_string());
        first.spec.max_concurrency = 1;
        let mut second = run_created_at("second", "my-job", now);
        second.metadata.uid = Some("bbbb".to_string());
        second.spec.max_concurrency = 1;

        // The same snapshot must admit exactly one of the two.
        let snapshot = vec![first.clone(), second.clone()];
        assert!(can_execute(&first, &snapshot, &config()));
        assert!(!can_execute(&second, &snapshot, &config()));
    }

    #[test]
    fn test_queue_capacity_zero_never_runs() {
        let mut run = triggered_run("candidate", "my-job");
        run.spec.job_queue_name = "queue".to_string();
        let mut config = config();
        config.job_queue_capacities.insert("queue".to_string(), 0);
        assert!(!can_execute(&run, &[], &config));
    }

    #[test]
    fn test_queue_capacity_minus_one_always_runs() {
        let mut run = triggered_run("candidate", "my-job");
        run.spec.job_queue_name = "queue".to_string();
        let mut config = config();
        config.job_queue_capacities.insert("queue".to_string(), -1);
        let peers: Vec<_> = (0..50)
            .map(|i| pending_run(&format!("q-{i}"), "other-job", "queue"))
            .collect();
        assert!(can_execute(&run, &peers, &config));
    }

    #[test]
    fn test_queue_capacity_spans_jobs() {
        let mut run = run_created_at("candidate", "my-job", Utc::now());
        run.spec.max_concurrency = 100;
        run.spec.job_queue_name = "queue".to_string();
        let mut config = config();
        config.job_queue_capacities.insert("queue".to_string(), 10);
        let peers: Vec<_> = (0..10)
            .map(|i| pending_run(&format!("q-{i}"), "other-job", "queue"))
            .collect();
        assert!(!can_execute(&run, &peers, &config));
    }

    #[test]
    fn test_global_cap_only_applies_when_positive() {
        let run = triggered_run("candidate", "my-job");
        let peers: Vec<_> = (0..20)
            .map(|i| pending_run(&format!("p-{i}"), "other-job", ""))
            .collect();

        let mut capped = config();
        capped.max_concurrency = 20;
        assert!(!can_execute(&run, &peers, &capped));

        let mut roomy = config();
        roomy.max_concurrency = 21;
        assert!(can_execute(&run, &peers, &roomy));

        // 0 disables the global cap entirely
        assert!(can_execute(&run, &peers, &config()));
    }
}
