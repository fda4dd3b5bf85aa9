//! Watch wiring and the reconcile worker pool
//!
//! Watch streams on JobRuns and on Pods (one per target cluster) feed keys
//! into the deduplicating work queue; a pool of workers drains it through
//! the reconciler. A key is processed by one worker at a time, full
//! parallelism applies across keys.

use crate::demux::{self, LabelSelector};
use crate::metrics::ControllerMetrics;
use crate::queue::{Outcome, WorkQueue};
use crate::reconciler::Reconciler;
use futures::TryStreamExt;
use hodei_run_crd::JobRun;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, watcher::Event};
use kube::Api;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct Runner {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    metrics: ControllerMetrics,
    pod_selector: LabelSelector,
    worker_count: usize,
}

impl Runner {
    pub fn new(
        reconciler: Arc<Reconciler>,
        metrics: ControllerMetrics,
        pod_selector: LabelSelector,
        worker_count: usize,
    ) -> Self {
        Self {
            reconciler,
            queue: WorkQueue::new(),
            metrics,
            pod_selector,
            worker_count,
        }
    }

    /// Spawn the watch streams and the worker pool. Tasks run until the
    /// shutdown signal flips; watch streams that fail are logged and retried
    /// by respawning on the next event cycle.
    pub fn spawn(
        &self,
        job_runs: Api<JobRun>,
        cluster_pods: HashMap<String, Api<Pod>>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(self.spawn_job_run_watch(job_runs, shutdown.clone()));
        for (alias, pods) in cluster_pods {
            handles.push(self.spawn_pod_watch(alias, pods, shutdown.clone()));
        }
        for worker in 0..self.worker_count {
            handles.push(self.spawn_worker(worker, shutdown.clone()));
        }
        handles
    }

    fn spawn_job_run_watch(
        &self,
        job_runs: Api<JobRun>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            loop {
                let stream = watcher(job_runs.clone(), watcher::Config::default());
                let watch = stream.try_for_each(|event| {
                    let queue = Arc::clone(&queue);
                    async move {
                        match event {
                            Event::Applied(run) | Event::Deleted(run) => {
                                enqueue_job_run(&queue, &run).await;
                            }
                            Event::Restarted(runs) => {
                                for run in runs {
                                    enqueue_job_run(&queue, &run).await;
                                }
                            }
                        }
                        Ok(())
                    }
                });
                tokio::select! {
                    result = watch => {
                        if let Err(err) = result {
                            warn!(error = %err, "JobRun watch failed; restarting");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("JobRun watch stopping");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_pod_watch(
        &self,
        alias: String,
        pods: Api<Pod>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let selector = self.pod_selector.clone();
        tokio::spawn(async move {
            loop {
                let stream = watcher(pods.clone(), watcher::Config::default());
                let watch = stream.try_for_each(|event| {
                    let queue = Arc::clone(&queue);
                    let selector = selector.clone();
                    async move {
                        match event {
                            Event::Applied(pod) | Event::Deleted(pod) => {
                                enqueue_pod(&queue, &pod, &selector).await;
                            }
                            Event::Restarted(pods) => {
                                for pod in pods {
                                    enqueue_pod(&queue, &pod, &selector).await;
                                }
                            }
                        }
                        Ok(())
                    }
                });
                tokio::select! {
                    result = watch => {
                        if let Err(err) = result {
                            warn!(cluster = %alias, error = %err, "Pod watch failed; restarting");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!(cluster = %alias, "Pod watch stopping");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_worker(&self, worker: usize, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let reconciler = Arc::clone(&self.reconciler);
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            loop {
                let key = tokio::select! {
                    key = queue.next() => key,
                    _ = shutdown.changed() => {
                        info!(worker, "Reconcile worker stopping");
                        return;
                    }
                };

                match reconciler.reconcile(&key).await {
                    Ok(Some(delay)) => {
                        metrics.observe_reconcile("requeue");
                        queue.finish(&key, Outcome::RequeueAfter(delay)).await;
                    }
                    Ok(None) => {
                        metrics.observe_reconcile("ok");
                        queue.finish(&key, Outcome::Done).await;
                    }
                    Err(err) => {
                        metrics.observe_reconcile("error");
                        let backoff = queue.finish(&key, Outcome::Failed).await;
                        error!(
                            run = %key,
                            error = %err,
                            backoff_ms = backoff.map(|d| d.as_millis() as u64).unwrap_or(0),
                            "Reconcile failed"
                        );
                    }
                }
            }
        })
    }
}

async fn enqueue_job_run(queue: &WorkQueue, run: &JobRun) {
    if !demux::wants_job_run(run) {
        return;
    }
    if let Some(name) = run.metadata.name.as_deref() {
        queue.enqueue(name).await;
    }
}

async fn enqueue_pod(queue: &WorkQueue, pod: &Pod, selector: &LabelSelector) {
    if !demux::wants_pod(pod, selector) {
        return;
    }
    queue.enqueue(demux::job_run_key_for_pod(pod)).await;
}
