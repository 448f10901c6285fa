//! Pool of workers sharing one queue.

use crate::queue::Queue;
use crate::worker::Worker;
use fleetd_core::Environment;
use fleetd_core::settings::QueueSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Running workers plus the lease reaper that hands out jobs whose worker
/// disappeared.
pub struct WorkerPool {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    size: usize,
}

impl WorkerPool {
    /// Start `settings.workers` workers. Each worker id is prefixed with
    /// `name` so claims can be traced back to the process.
    pub fn start(
        name: &str,
        queue: Arc<dyn Queue>,
        env: Arc<Environment>,
        settings: &QueueSettings,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let size = settings.workers.max(1);

        for n in 0..size {
            let worker = Worker::new(format!("{name}-{n}"), queue.clone(), env.clone(), settings);
            let shutdown = shutdown.clone();
            tracker.spawn(async move { worker.run(shutdown).await });
        }

        tracker.spawn(reap_stale(
            queue,
            settings.lease_timeout,
            shutdown.clone(),
        ));
        tracker.close();

        info!(workers = size, "Started worker pool");
        Self {
            shutdown,
            tracker,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Token that stops the pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every worker and wait for running jobs to complete.
    pub async fn shutdown(self) {
        info!("Stopping worker pool");
        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Worker pool stopped");
    }
}

async fn reap_stale(queue: Arc<dyn Queue>, lease: Duration, shutdown: CancellationToken) {
    let period = (lease / 2).max(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        if let Err(e) = queue.release_stale(lease).await {
            warn!(error = %e, "Failed to release stale jobs");
        }
    }
}
