//! Cloud provider drivers for fleetd.
//!
//! Provides driver implementations behind the capability traits in
//! `fleetd_core::cloud`:
//! - Docker (container images pulled onto the parent's daemon)
//! - Mock (in-process, for tests and local development)
//! - Static (pre-provisioned machines, no container capability)

pub mod docker;
pub mod mock;
pub mod static_hosts;

pub use docker::DockerManager;
pub use mock::MockManager;
pub use static_hosts::StaticManager;

use async_trait::async_trait;
use fleetd_core::cloud::{CloudManager, ManagerFactory};
use fleetd_core::settings::Settings;
use fleetd_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Resolves provider names to drivers.
///
/// The driver kind comes from the provider's `driver` option and defaults to
/// the provider name. Drivers registered with [`CloudManagers::with_manager`]
/// take precedence over settings.
#[derive(Default)]
pub struct CloudManagers {
    overrides: HashMap<String, Arc<dyn CloudManager>>,
}

impl CloudManagers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always hand out `manager` for `provider`.
    pub fn with_manager(mut self, provider: impl Into<String>, manager: Arc<dyn CloudManager>) -> Self {
        self.overrides.insert(provider.into(), manager);
        self
    }

    fn build(provider: &str, settings: &Settings) -> Result<Arc<dyn CloudManager>> {
        let options = settings.provider(provider)?;
        let driver = options.get("driver").unwrap_or(provider);
        debug!(provider, driver, "Creating cloud manager");

        let manager: Arc<dyn CloudManager> = match driver {
            "docker" => Arc::new(DockerManager::from_settings(options)?),
            "mock" => Arc::new(MockManager::from_settings(options)?),
            "static" => Arc::new(StaticManager::new(provider)),
            other => {
                return Err(Error::Configuration(format!(
                    "unknown driver '{other}' for provider '{provider}'"
                )));
            }
        };
        Ok(manager)
    }
}

#[async_trait]
impl ManagerFactory for CloudManagers {
    async fn get_manager(&self, provider: &str, settings: &Settings) -> Result<Arc<dyn CloudManager>> {
        if let Some(manager) = self.overrides.get(provider) {
            return Ok(manager.clone());
        }
        Self::build(provider, settings)
    }
}
