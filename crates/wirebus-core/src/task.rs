//! Handler task supervision.
//!
//! Every spawned business-handler task is recorded here so shutdown can
//! enumerate and cancel outstanding work. The alternative (untracked
//! spawn-and-forget) makes the "zero active tasks after stop" invariant
//! untestable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Tracks in-flight spawned tasks and supports bounded-grace cancellation.
#[derive(Default)]
pub struct TaskSupervisor {
    tasks: Arc<DashMap<u64, JoinHandle<()>>>,
    seq: AtomicU64,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a tracked task. The entry removes itself on completion.
    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);
        let handle = tokio::spawn(async move {
            fut.await;
            tasks.remove(&id);
        });
        self.tasks.insert(id, handle);
        // The task may have completed between spawn and insert; drop the
        // stale entry so `active()` does not over-report.
        if self.tasks.get(&id).map(|h| h.is_finished()).unwrap_or(false) {
            self.tasks.remove(&id);
        }
    }

    /// Number of tasks still in flight.
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Wait up to `grace` for tasks to finish on their own, then abort the
    /// rest. Returns the number of force-aborted tasks.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        while self.active() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
        }

        let leftover: Vec<u64> = self.tasks.iter().map(|e| *e.key()).collect();
        let mut aborted = 0;
        for id in leftover {
            if let Some((_, handle)) = self.tasks.remove(&id) {
                if !handle.is_finished() {
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "handler tasks aborted after grace period");
        }
        aborted
    }
}
