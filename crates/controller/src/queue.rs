//! Deduplicating work queue
//!
//! Reconcile requests are keyed by JobRun name. The queue guarantees that a
//! key is processed by at most one worker at a time: a key enqueued while in
//! flight is marked dirty and handed out again once the current pass
//! finishes. Failed passes are re-enqueued with exponential backoff, delayed
//! requeues land after their deadline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How a reconcile pass ended, from the queue's point of view
#[derive(Debug)]
pub enum Outcome {
    /// Pass finished; nothing more to do until the next event
    Done,
    /// Pass finished but wants to run again after the delay
    RequeueAfter(Duration),
    /// Pass failed; retry with backoff
    Failed,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
}

/// Work queue shared by the event demux and the reconcile workers
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue a key. Duplicates of an already queued key collapse; keys in
    /// flight are re-delivered after their current pass.
    pub async fn enqueue(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock().await;
        if state.in_flight.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Enqueue a key once the delay has passed
    pub fn enqueue_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let queue = Arc::clone(self);
        let key = key.into();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key).await;
        });
    }

    /// Next key to process; waits until one is ready and marks it in flight
    pub async fn next(&self) -> String {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Report the outcome of a pass; returns the backoff applied on failure
    pub async fn finish(self: &Arc<Self>, key: &str, outcome: Outcome) -> Option<Duration> {
        let (redeliver, delay) = {
            let mut state = self.state.lock().await;
            state.in_flight.remove(key);
            let redeliver = state.dirty.remove(key);
            let delay = match &outcome {
                Outcome::Done => {
                    state.failures.remove(key);
                    None
                }
                Outcome::RequeueAfter(delay) => {
                    state.failures.remove(key);
                    Some(*delay)
                }
                Outcome::Failed => {
                    let attempts = state.failures.entry(key.to_string()).or_insert(0);
                    *attempts += 1;
                    Some(backoff(*attempts))
                }
            };
            (redeliver, delay)
        };

        // A dirty key saw new events mid-pass and goes straight back in;
        // that supersedes any computed delay.
        if redeliver {
            self.enqueue(key).await;
            return None;
        }
        if let Some(delay) = delay {
            self.enqueue_after(key, delay);
        }
        delay
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.state.lock().await.ready.len()
    }
}

fn backoff(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE.saturating_mul(1u32 << exp);
    std::cmp::min(delay, BACKOFF_CAP)
}
