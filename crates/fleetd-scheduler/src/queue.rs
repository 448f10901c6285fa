//! Job queue.
//!
//! The queue owns persisted [`JobRecord`]s. Dispatching rebuilds a job from its
//! record through the [`JobRegistry`](fleetd_core::registry::JobRegistry).
//! A worker holds a lease on each job it claims and renews it with
//! [`Queue::heartbeat`] while the job runs.

mod local;
mod postgres;

pub use local::LocalQueue;
pub use postgres::PgQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetd_core::job::{Job, JobRecord};
use fleetd_core::{Error, JobId, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Where a job is in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    Claimed,
    Completed,
    Cancelled,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Claimed => "claimed",
            QueueState::Completed => "completed",
            QueueState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueState::Pending),
            "claimed" => Ok(QueueState::Claimed),
            "completed" => Ok(QueueState::Completed),
            "cancelled" => Ok(QueueState::Cancelled),
            other => Err(Error::Deserialization(format!("unknown queue state '{other}'"))),
        }
    }
}

/// A persisted job and its queue bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub record: JobRecord,
    pub state: QueueState,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// A job handed to a worker.
pub struct Dispatch {
    pub job: Box<dyn Job>,
    /// Cancelled when the job is cancelled through [`Queue::cancel`].
    pub cancel: CancellationToken,
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("job_id", self.job.id())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Storage and dispatch of jobs.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Add a job. A job id that is already queued, in any state, is a conflict.
    async fn put(&self, job: &dyn Job) -> Result<()>;

    /// Claim the oldest pending job whose dependency is satisfied, rebuilt and
    /// ready to run.
    async fn next(&self, worker_id: &str) -> Result<Option<Dispatch>>;

    /// Persist the final state of a job dispatched to `worker_id`.
    ///
    /// Fails with [`Error::Conflict`] when the job is no longer claimed by
    /// that worker, so a worker whose lease lapsed cannot overwrite the
    /// result of the worker that claimed the job after it.
    async fn complete(&self, worker_id: &str, job: &dyn Job) -> Result<()>;

    /// Renew the lease `worker_id` holds on a running job. Fails with
    /// [`Error::Conflict`] once the claim has been lost.
    async fn heartbeat(&self, id: &JobId, worker_id: &str) -> Result<()>;

    /// Cancel a job. A pending job is never dispatched; a running job has its
    /// context cancelled and completes through the normal path.
    async fn cancel(&self, id: &JobId) -> Result<()>;

    async fn get(&self, id: &JobId) -> Result<QueueEntry>;

    /// Return jobs whose claim was last renewed longer than `lease` ago to
    /// pending. Returns how many were released.
    async fn release_stale(&self, lease: Duration) -> Result<usize>;
}

/// Complete a record this process cannot rebuild, keeping the error.
///
/// An unknown type, a newer schema version or an unreadable body never
/// becomes runnable, so the record is failed instead of being retried on
/// every poll.
fn fail_record(record: &mut JobRecord, err: Error) {
    warn!(job_id = %record.id, job_type = %record.job_type.name, error = %err, "Failing job that cannot be rebuilt");
    record.status.errors.add(err);
    record.status.in_progress = false;
    record.status.completed = true;
    record.status.completed_at = Some(Utc::now());
}

fn lost_claim(id: &JobId, worker_id: &str) -> Error {
    Error::Conflict(format!("job {id} is no longer claimed by {worker_id}"))
}
