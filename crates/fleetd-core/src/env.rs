//! Service environment shared by running jobs.

use std::fmt;
use std::sync::Arc;

use crate::cloud::ManagerFactory;
use crate::host::HostStore;
use crate::settings::Settings;

/// Handles to the settings and external systems a job works against.
#[derive(Clone)]
pub struct Environment {
    settings: Arc<Settings>,
    hosts: Arc<dyn HostStore>,
    clouds: Arc<dyn ManagerFactory>,
}

impl Environment {
    pub fn new(
        settings: Arc<Settings>,
        hosts: Arc<dyn HostStore>,
        clouds: Arc<dyn ManagerFactory>,
    ) -> Self {
        Self {
            settings,
            hosts,
            clouds,
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.clone()
    }

    pub fn hosts(&self) -> &dyn HostStore {
        self.hosts.as_ref()
    }

    pub fn clouds(&self) -> &dyn ManagerFactory {
        self.clouds.as_ref()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
