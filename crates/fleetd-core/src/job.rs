//! Job abstraction.
//!
//! A job is a uniquely identified, resumable unit of asynchronous work. Jobs
//! are persisted as [`JobRecord`]s between dispatches and rebuilt through the
//! [`JobRegistry`](crate::registry::JobRegistry) by whichever worker picks them
//! up, so everything a job needs across a restart must live in its record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catcher::ErrorCollector;
use crate::context::JobContext;
use crate::{Error, JobId, Result};

/// Name and schema version of a job type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobType {
    pub name: String,
    pub version: u32,
}

impl JobType {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// Precondition the queue checks before dispatching a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Dependency {
    /// Always runnable.
    #[default]
    Always,
    /// Runnable once every listed job has completed.
    AfterJobs { ids: Vec<JobId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    Ready,
    Blocked,
}

impl Dependency {
    pub fn state(&self, is_complete: impl Fn(&JobId) -> bool) -> DependencyState {
        match self {
            Dependency::Always => DependencyState::Ready,
            Dependency::AfterJobs { ids } => {
                if ids.iter().all(is_complete) {
                    DependencyState::Ready
                } else {
                    DependencyState::Blocked
                }
            }
        }
    }
}

/// Execution status of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub in_progress: bool,
    pub completed: bool,
    /// Worker currently (or last) executing the job.
    pub owner: Option<String>,
    pub errors: ErrorCollector,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// State shared by every job type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobBase {
    id: JobId,
    job_type: JobType,
    dependency: Dependency,
    status: JobStatus,
    created_at: DateTime<Utc>,
}

impl JobBase {
    pub fn new(job_type: JobType) -> Self {
        Self {
            id: JobId::new(""),
            job_type,
            dependency: Dependency::Always,
            status: JobStatus::default(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<JobId>) {
        self.id = id.into();
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    pub fn set_dependency(&mut self, dependency: Dependency) {
        self.dependency = dependency;
    }

    pub fn status(&self) -> &JobStatus {
        &self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Record that `owner` started executing the job.
    pub fn mark_started(&mut self, owner: impl Into<String>) {
        self.status.in_progress = true;
        self.status.owner = Some(owner.into());
        self.status.started_at = Some(Utc::now());
    }

    /// Mark the job complete. Only the first call has an effect; it returns
    /// whether this call was the one that completed the job.
    pub fn mark_complete(&mut self) -> bool {
        if self.status.completed {
            return false;
        }
        self.status.completed = true;
        self.status.in_progress = false;
        self.status.completed_at = Some(Utc::now());
        true
    }

    pub fn is_complete(&self) -> bool {
        self.status.completed
    }

    pub fn add_error(&mut self, err: impl Into<Error>) {
        self.status.errors.add(err);
    }

    pub fn has_errors(&self) -> bool {
        self.status.errors.has_errors()
    }

    pub fn errors(&self) -> &ErrorCollector {
        &self.status.errors
    }

    /// The job's recorded errors resolved into one outcome.
    pub fn error(&self) -> Result<()> {
        self.status.errors.resolve()
    }

    fn restore(&mut self, record: &JobRecord) {
        self.id = record.id.clone();
        self.dependency = record.dependency.clone();
        self.status = record.status.clone();
        self.created_at = record.created_at;
    }
}

/// Persisted form of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: JobType,
    pub dependency: Dependency,
    pub status: JobStatus,
    /// Job-type specific fields.
    pub body: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A unit of asynchronous work.
#[async_trait]
pub trait Job: Send + Sync {
    fn base(&self) -> &JobBase;

    fn base_mut(&mut self) -> &mut JobBase;

    /// Execute the job. Failures are recorded on the job rather than
    /// returned, and the job must be complete when this returns.
    async fn run(&mut self, ctx: &JobContext);

    /// Serialize the job-specific fields.
    fn body(&self) -> Result<serde_json::Value>;

    /// Restore the job-specific fields from [`Job::body`] output.
    fn load_body(&mut self, body: serde_json::Value) -> Result<()>;

    fn id(&self) -> &JobId {
        self.base().id()
    }

    fn job_type(&self) -> &JobType {
        self.base().job_type()
    }

    fn dependency(&self) -> &Dependency {
        self.base().dependency()
    }

    fn status(&self) -> &JobStatus {
        self.base().status()
    }

    fn is_complete(&self) -> bool {
        self.base().is_complete()
    }

    fn error(&self) -> Result<()> {
        self.base().error()
    }

    fn to_record(&self) -> Result<JobRecord> {
        let base = self.base();
        Ok(JobRecord {
            id: base.id.clone(),
            job_type: base.job_type.clone(),
            dependency: base.dependency.clone(),
            status: base.status.clone(),
            body: self.body()?,
            created_at: base.created_at,
        })
    }
}

/// Load `record` into a freshly constructed job of the same type.
pub(crate) fn restore(job: &mut dyn Job, record: &JobRecord) -> Result<()> {
    job.load_body(record.body.clone())?;
    job.base_mut().restore(record);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_complete_only_once() {
        let mut base = JobBase::new(JobType::new("noop", 0));
        base.mark_started("worker-1");
        assert!(base.status().in_progress);
        assert!(base.mark_complete());
        let first = base.status().completed_at;
        assert!(!base.mark_complete());
        assert_eq!(base.status().completed_at, first);
        assert!(base.is_complete());
        assert!(!base.status().in_progress);
    }

    #[test]
    fn test_errors_resolve_through_base() {
        let mut base = JobBase::new(JobType::new("noop", 0));
        assert!(base.error().is_ok());
        base.add_error(Error::Provider("boom".to_string()));
        assert!(base.has_errors());
        assert!(base.error().unwrap_err().to_string().contains("boom"));
    }

    #[test]
    fn test_dependency_state() {
        let a = JobId::new("a");
        let b = JobId::new("b");
        assert_eq!(Dependency::Always.state(|_| false), DependencyState::Ready);

        let dep = Dependency::AfterJobs {
            ids: vec![a.clone(), b.clone()],
        };
        assert_eq!(dep.state(|id| id == &a), DependencyState::Blocked);
        assert_eq!(dep.state(|_| true), DependencyState::Ready);
    }

    #[test]
    fn test_dependency_serialization() {
        let json = serde_json::to_value(Dependency::Always).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "always" }));

        let dep = Dependency::AfterJobs {
            ids: vec![JobId::new("a")],
        };
        let json = serde_json::to_value(&dep).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "after_jobs", "ids": ["a"] }));
    }
}
