//! Driver for pre-provisioned machines.

use fleetd_core::cloud::CloudManager;

/// Machines that exist outside fleetd's control. They run jobs but cannot
/// have container images built on them.
#[derive(Debug, Clone)]
pub struct StaticManager {
    provider: String,
}

impl StaticManager {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

impl CloudManager for StaticManager {
    fn provider(&self) -> &str {
        &self.provider
    }
}
