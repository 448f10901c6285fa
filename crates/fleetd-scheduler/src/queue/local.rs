//! In-process job queue.

use async_trait::async_trait;
use chrono::Utc;
use fleetd_core::job::{DependencyState, Job};
use fleetd_core::registry::JobRegistry;
use fleetd_core::{Error, JobId, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Dispatch, Queue, QueueEntry, QueueState, fail_record, lost_claim};

#[derive(Default)]
struct State {
    entries: HashMap<JobId, QueueEntry>,
    /// Insertion order, which is dispatch order.
    order: Vec<JobId>,
    running: HashMap<JobId, CancellationToken>,
}

impl State {
    fn is_complete(&self, id: &JobId) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.state == QueueState::Completed)
    }
}

/// Queue held in memory. Jobs do not survive a restart.
pub struct LocalQueue {
    registry: JobRegistry,
    state: Mutex<State>,
}

impl LocalQueue {
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            registry,
            state: Mutex::new(State::default()),
        }
    }

    /// Number of jobs in the given state.
    pub async fn count(&self, state: QueueState) -> usize {
        self.state
            .lock()
            .await
            .entries
            .values()
            .filter(|e| e.state == state)
            .count()
    }
}

#[async_trait]
impl Queue for LocalQueue {
    async fn put(&self, job: &dyn Job) -> Result<()> {
        let record = job.to_record()?;
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&record.id) {
            return Err(Error::Conflict(format!("job {} is already queued", record.id)));
        }

        debug!(job_id = %record.id, job_type = %record.job_type.name, "Queued job");
        state.order.push(record.id.clone());
        state.entries.insert(
            record.id.clone(),
            QueueEntry {
                record,
                state: QueueState::Pending,
                claimed_by: None,
                claimed_at: None,
            },
        );
        Ok(())
    }

    async fn next(&self, worker_id: &str) -> Result<Option<Dispatch>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut picked = None;
        let mut unrunnable = Vec::new();
        for id in &state.order {
            let Some(entry) = state.entries.get(id) else {
                continue;
            };
            if entry.state != QueueState::Pending {
                continue;
            }
            if entry.record.dependency.state(|dep| state.is_complete(dep)) == DependencyState::Blocked {
                continue;
            }
            match self.registry.rebuild(&entry.record) {
                Ok(job) => {
                    picked = Some((id.clone(), job));
                    break;
                }
                Err(err) => unrunnable.push((id.clone(), err)),
            }
        }

        for (id, err) in unrunnable {
            if let Some(entry) = state.entries.get_mut(&id) {
                fail_record(&mut entry.record, err);
                entry.state = QueueState::Completed;
            }
        }

        let Some((id, job)) = picked else {
            return Ok(None);
        };

        let cancel = CancellationToken::new();
        state.running.insert(id.clone(), cancel.clone());
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.state = QueueState::Claimed;
            entry.claimed_by = Some(worker_id.to_string());
            entry.claimed_at = Some(Utc::now());
        }

        debug!(job_id = %id, worker_id, "Dispatched job");
        Ok(Some(Dispatch { job, cancel }))
    }

    async fn complete(&self, worker_id: &str, job: &dyn Job) -> Result<()> {
        let record = job.to_record()?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let entry = state
            .entries
            .get_mut(&record.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", record.id)))?;
        if entry.state != QueueState::Claimed || entry.claimed_by.as_deref() != Some(worker_id) {
            return Err(lost_claim(&record.id, worker_id));
        }

        state.running.remove(&record.id);
        entry.record = record;
        entry.state = QueueState::Completed;
        Ok(())
    }

    async fn heartbeat(&self, id: &JobId, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        if entry.state != QueueState::Claimed || entry.claimed_by.as_deref() != Some(worker_id) {
            return Err(lost_claim(id, worker_id));
        }
        entry.claimed_at = Some(Utc::now());
        Ok(())
    }

    async fn cancel(&self, id: &JobId) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;

        match entry.state {
            QueueState::Pending => {
                entry.state = QueueState::Cancelled;
                info!(job_id = %id, "Cancelled pending job");
            }
            QueueState::Claimed => {
                if let Some(token) = state.running.get(id) {
                    token.cancel();
                }
                info!(job_id = %id, "Cancelled running job");
            }
            QueueState::Cancelled => {}
            QueueState::Completed => {
                return Err(Error::Conflict(format!("job {id} has already completed")));
            }
        }
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<QueueEntry> {
        self.state
            .lock()
            .await
            .entries
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn release_stale(&self, lease: Duration) -> Result<usize> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::InvalidInput(format!("invalid lease: {e}")))?;
        let cutoff = Utc::now() - lease;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let mut released = Vec::new();
        for (id, entry) in state.entries.iter_mut() {
            if entry.state == QueueState::Claimed && entry.claimed_at.is_some_and(|at| at < cutoff) {
                entry.state = QueueState::Pending;
                entry.claimed_by = None;
                entry.claimed_at = None;
                released.push(id.clone());
            }
        }
        for id in &released {
            if let Some(token) = state.running.remove(id) {
                token.cancel();
            }
            info!(job_id = %id, "Released stale job");
        }
        Ok(released.len())
    }
}
