//! In-process driver for tests and local development.

use async_trait::async_trait;
use fleetd_core::cloud::{CloudManager, ContainerManager};
use fleetd_core::host::Host;
use fleetd_core::settings::ProviderSettings;
use fleetd_core::{Error, JobContext, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Driver whose container builds succeed or fail on demand.
#[derive(Debug)]
pub struct MockManager {
    provider: String,
    fail_builds: AtomicBool,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockManager {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            fail_builds: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Create from the `fail-builds` and `delay-ms` provider options.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let mut manager = Self::new(settings.name.clone());
        if let Some(fail) = settings.get_parsed::<bool>("fail-builds")? {
            manager.set_fail_builds(fail);
        }
        if let Some(ms) = settings.get_parsed::<u64>("delay-ms")? {
            manager.delay = Some(Duration::from_millis(ms));
        }
        Ok(manager)
    }

    /// Every build sleeps for `delay` before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(self) -> Self {
        self.set_fail_builds(true);
        self
    }

    pub fn set_fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    /// Number of build calls received, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CloudManager for MockManager {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn container_manager(&self) -> Option<&dyn ContainerManager> {
        Some(self)
    }
}

#[async_trait]
impl ContainerManager for MockManager {
    async fn build_container_image(
        &self,
        ctx: &JobContext,
        parent: &Host,
        image_url: &str,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!(host_id = %parent.id, image = %image_url, "Mock container build");

        if let Some(delay) = self.delay {
            ctx.run(async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }

        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(Error::Provider(format!(
                "mock build of {image_url} on host {} failed",
                parent.id
            )));
        }
        Ok(())
    }
}
