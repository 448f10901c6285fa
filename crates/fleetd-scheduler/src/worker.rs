//! Worker that processes jobs from the queue.

use crate::queue::{Dispatch, Queue};
use fleetd_core::settings::QueueSettings;
use fleetd_core::{Environment, Error, JobContext, JobId};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A worker that claims and executes jobs.
pub struct Worker {
    id: String,
    queue: Arc<dyn Queue>,
    env: Arc<Environment>,
    poll_interval: Duration,
    job_timeout: Option<Duration>,
    heartbeat_interval: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn Queue>,
        env: Arc<Environment>,
        settings: &QueueSettings,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            env,
            poll_interval: settings.poll_interval,
            job_timeout: settings.job_timeout,
            heartbeat_interval: (settings.lease_timeout / 3).max(Duration::from_millis(10)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the worker loop until `shutdown` is cancelled. A job that is
    /// running at shutdown is cancelled and still completed.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, "Starting worker");

        while !shutdown.is_cancelled() {
            match self.queue.next(&self.id).await {
                Ok(Some(dispatch)) => self.execute(dispatch, &shutdown).await,
                Ok(None) => self.idle(&shutdown, self.poll_interval).await,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    self.idle(&shutdown, self.poll_interval * 5).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn idle(&self, shutdown: &CancellationToken, period: Duration) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sleep(period) => {}
        }
    }

    /// Run one dispatched job to completion and persist its final state.
    pub async fn execute(&self, dispatch: Dispatch, shutdown: &CancellationToken) {
        let Dispatch { mut job, cancel } = dispatch;
        let job_id = job.id().clone();
        let job_type = job.job_type().name.clone();
        info!(worker_id = %self.id, job_id = %job_id, job_type = %job_type, "Claimed job");

        let token = shutdown.child_token();
        let mut ctx = JobContext::new(token.clone()).with_environment(self.env.clone());
        if let Some(timeout) = self.job_timeout {
            ctx = ctx.with_timeout(timeout);
        }

        let watch = tokio::spawn(watch_claim(
            self.queue.clone(),
            job_id.clone(),
            self.id.clone(),
            cancel,
            token.clone(),
            self.heartbeat_interval,
        ));

        job.base_mut().mark_started(self.id.clone());
        if let Err(panic) = AssertUnwindSafe(job.run(&ctx)).catch_unwind().await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            job.base_mut()
                .add_error(Error::Internal(format!("job panicked: {message}")));
        }
        watch.abort();

        if !job.is_complete() {
            job.base_mut()
                .add_error(Error::Internal("job returned without completing".to_string()));
            job.base_mut().mark_complete();
        }

        let errors = job.status().errors.len();
        match job.error() {
            Ok(()) => info!(worker_id = %self.id, job_id = %job_id, job_type = %job_type, "Job completed"),
            Err(e) => warn!(worker_id = %self.id, job_id = %job_id, job_type = %job_type, errors, error = %e, "Job completed with errors"),
        }

        match self.queue.complete(&self.id, job.as_ref()).await {
            Ok(()) => {}
            Err(Error::Conflict(_)) => {
                warn!(worker_id = %self.id, job_id = %job_id, "Lease was lost, discarding result");
            }
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to persist job completion");
            }
        }
    }
}

/// Renews the lease on a running job and relays queue-side cancellation into
/// its context. A lost lease cancels the job, since another worker may
/// already own it.
async fn watch_claim(
    queue: Arc<dyn Queue>,
    job_id: JobId,
    worker_id: String,
    cancel: CancellationToken,
    token: CancellationToken,
    period: Duration,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = cancel.cancelled() => {
                token.cancel();
                return;
            }
            _ = sleep(period) => {}
        }

        match queue.heartbeat(&job_id, &worker_id).await {
            Ok(()) => {}
            Err(e) if matches!(e, Error::Conflict(_)) || e.is_not_found() => {
                warn!(worker_id = %worker_id, job_id = %job_id, error = %e, "Lost lease on running job");
                token.cancel();
                return;
            }
            Err(e) => warn!(worker_id = %worker_id, job_id = %job_id, error = %e, "Failed to renew lease"),
        }
    }
}
