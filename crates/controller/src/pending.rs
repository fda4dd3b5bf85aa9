//! Pending-count indexes
//!
//! Counts of Pending runs bucketed by job name and by queue name, rebuilt
//! from the store at decision time. Stale reads can only over-count: a run
//! enters Pending through the same reconcile path that rebuilds the index,
//! so an under-count is impossible and a spurious rejection heals on the
//! next reconcile.

use hodei_run_crd::{ExecutionAgent, JobRun, JobRunState};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PendingCounts {
    by_job: HashMap<String, usize>,
    by_queue: HashMap<String, usize>,
    total: usize,
}

impl PendingCounts {
    /// Build the index from a snapshot of the store
    pub fn from_runs<'a>(runs: impl IntoIterator<Item = &'a JobRun>) -> Self {
        let mut counts = PendingCounts::default();
        for run in runs {
            if run.spec.agent != ExecutionAgent::Kubernetes {
                continue;
            }
            if run.state() != JobRunState::Pending {
                continue;
            }
            counts.total += 1;
            *counts.by_job.entry(run.spec.job.clone()).or_default() += 1;
            if !run.spec.job_queue_name.is_empty() {
                *counts
                    .by_queue
                    .entry(run.spec.job_queue_name.clone())
                    .or_default() += 1;
            }
        }
        counts
    }

    pub fn pending_for_job(&self, job: &str) -> usize {
        self.by_job.get(job).copied().unwrap_or(0)
    }

    pub fn pending_in_queue(&self, queue: &str) -> usize {
        self.by_queue.get(queue).copied().unwrap_or(0)
    }

    pub fn pending_total(&self) -> usize {
        self.total
    }
}
