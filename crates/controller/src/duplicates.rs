//! Presubmit duplicate termination
//!
//! For presubmit runs, only the newest active run per (job, pull set) key
//! proceeds; every other active run sharing the key is driven to Aborted.
//! Completed duplicates are history and stay untouched.

use crate::store::JobRunStore;
use chrono::{DateTime, Utc};
use hodei_run_crd::{ExecutionAgent, JobRun, JobRunState, JobRunType};
use hodei_run_shared::Result;
use kube::ResourceExt;
use tracing::info;

/// Abort every active presubmit run superseded by a newer one on the same
/// (job, pull set) key as `run`. Called on every reconcile of a presubmit
/// run, so a single pass per run converges the whole group.
pub async fn terminate_dupes(
    store: &dyn JobRunStore,
    run: &JobRun,
    now: DateTime<Utc>,
) -> Result<()> {
    if run.spec.job_type != JobRunType::Presubmit || run.complete() {
        return Ok(());
    }

    let pulls = run.pull_numbers();
    let mut group: Vec<JobRun> = store
        .list()
        .await?
        .into_iter()
        .filter(|other| other.spec.agent == ExecutionAgent::Kubernetes)
        .filter(|other| other.spec.job_type == JobRunType::Presubmit)
        .filter(|other| !other.complete() && !other.state().is_terminal())
        .filter(|other| other.spec.job == run.spec.job && other.pull_numbers() == pulls)
        .collect();

    if group.len() < 2 {
        return Ok(());
    }

    // Newest start time survives; a missing start time sorts oldest.
    group.sort_by_key(|r| r.status.as_ref().and_then(|s| s.start_time));
    let survivor = group.pop().map(|r| r.name_any()).unwrap_or_default();

    for mut superseded in group {
        info!(
            run = %superseded.name_any(),
            job = %superseded.spec.job,
            survivor = %survivor,
            "Aborting superseded presubmit run"
        );
        let status = superseded.status_mut();
        status.state = JobRunState::Aborted;
        status.completion_time = Some(now);
        status.description = format!("Superseded by {}.", survivor);
        store.update_status(&superseded).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::presubmit_run;
    use crate::testing::InMemoryJobRunStore;
    use chrono::Duration;

    #[tokio::test]
    async fn test_terminates_all_but_newest() {
        let now = Utc::now();
        let store = InMemoryJobRunStore::default();
        store
            .insert(presubmit_run(
                "newest",
                "j1",
                &[100],
                JobRunState::Pending,
                Some(now - Duration::minutes(1)),
            ))
            .await;
        store
            .insert(presubmit_run(
                "old",
                "j1",
                &[100],
                JobRunState::Triggered,
                Some(now - Duration::hours(1)),
            ))
            .await;
        store
            .insert(presubmit_run(
                "older",
                "j1",
                &[100],
                JobRunState::Triggered,
                Some(now - Duration::hours(2)),
            ))
            .await;
        let mut complete = presubmit_run(
            "complete",
            "j1",
            &[100],
            JobRunState::Success,
            Some(now - Duration::hours(3)),
        );
        complete.status_mut().completion_time = Some(now);
        store.insert(complete).await;

        for name in ["newest", "old", "older", "complete"] {
            let run = store.get(name).await.unwrap().unwrap();
            terminate_dupes(&store, &run, now).await.unwrap();
        }

        let mut patched = store.patched().await;
        patched.sort();
        assert_eq!(patched, vec!["old".to_string(), "older".to_string()]);

        for name in ["old", "older"] {
            let run = store.get(name).await.unwrap().unwrap();
            assert_eq!(run.state(), JobRunState::Aborted);
            assert!(run.complete());
            assert!(run.status.unwrap().description.contains("newest"));
        }
        let newest = store.get("newest").await.unwrap().unwrap();
        assert_eq!(newest.state(), JobRunState::Pending);
        let complete = store.get("complete").await.unwrap().unwrap();
        assert_eq!(complete.state(), JobRunState::Success);
    }

    #[tokio::test]
    async fn test_distinct_pull_sets_are_distinct_keys() {
        let now = Utc::now();
        let store = InMemoryJobRunStore::default();
        store
            .insert(presubmit_run(
                "pr100",
                "j1",
                &[100],
                JobRunState::Triggered,
                Some(now - Duration::hours(1)),
            ))
            .await;
        store
            .insert(presubmit_run(
                "pr200",
                "j1",
                &[200],
                JobRunState::Triggered,
                Some(now - Duration::minutes(1)),
            ))
            .await;

        let run = store.get("pr100").await.unwrap().unwrap();
        terminate_dupes(&store, &run, now).await.unwrap();

        assert!(store.patched().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_presubmit_runs_are_ignored() {
        let now = Utc::now();
        let store = InMemoryJobRunStore::default();
        let mut run = presubmit_run("batch", "j1", &[], JobRunState::Triggered, Some(now));
        run.spec.job_type = JobRunType::Batch;
        store.insert(run.clone()).await;
        terminate_dupes(&store, &run, now).await.unwrap();
        assert!(store.patched().await.is_empty());
    }
}
