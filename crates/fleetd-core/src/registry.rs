//! Job type registry.
//!
//! Maps a job-type name to a factory so a worker can rebuild a job from its
//! persisted record. The registry is filled by explicit registration calls at
//! start-up and only read afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::job::{self, Job, JobRecord};
use crate::{Error, Result};

/// Builds an empty job of one type.
pub type JobFactory = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;

#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`. Registering a name twice is a conflict.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Job> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::Conflict(format!("job type '{name}' is already registered")));
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// A fresh, empty job of type `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn Job>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::Deserialization(format!("no job type registered under '{name}'"))
        })?;
        Ok(factory())
    }

    /// Rebuild a job from its persisted record.
    ///
    /// Fails when the type is unknown or the record was written by a newer
    /// schema version than the registered one.
    pub fn rebuild(&self, record: &JobRecord) -> Result<Box<dyn Job>> {
        let mut job = self.create(&record.job_type.name)?;

        let registered = job.job_type().version;
        if record.job_type.version > registered {
            return Err(Error::Deserialization(format!(
                "job '{}' has version {} of type '{}', this worker understands up to {}",
                record.id, record.job_type.version, record.job_type.name, registered
            )));
        }

        job::restore(job.as_mut(), record)?;
        Ok(job)
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("types", &self.names())
            .finish()
    }
}
