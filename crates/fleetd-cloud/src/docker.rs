//! Docker driver.
//!
//! Container images are made available on a parent host by pulling them
//! through the Docker daemon running on that host.

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use fleetd_core::cloud::{CloudManager, ContainerManager};
use fleetd_core::host::Host;
use fleetd_core::settings::ProviderSettings;
use fleetd_core::{Error, JobContext, Result};
use futures::StreamExt;
use tracing::{debug, info};

const DEFAULT_API_PORT: u16 = 2376;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Driver talking to the Docker daemon on each parent host.
#[derive(Debug, Clone)]
pub struct DockerManager {
    provider: String,
    api_port: u16,
    timeout_secs: u64,
}

impl DockerManager {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            api_port: DEFAULT_API_PORT,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Create from the `api-port` and `timeout-secs` provider options.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let mut manager = Self::new(settings.name.clone());
        if let Some(port) = settings.get_parsed::<u16>("api-port")? {
            manager.api_port = port;
        }
        if let Some(timeout) = settings.get_parsed::<u64>("timeout-secs")? {
            manager.timeout_secs = timeout;
        }
        Ok(manager)
    }

    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    /// Client for the daemon on `parent`, or the local daemon when the parent
    /// has no DNS name.
    fn client_for(&self, parent: &Host) -> Result<Docker> {
        let docker = match &parent.dns_name {
            Some(dns_name) => Docker::connect_with_http(
                &format!("tcp://{}:{}", dns_name, self.api_port),
                self.timeout_secs,
                bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        };
        docker.map_err(|e| {
            Error::Provider(format!("failed to connect to docker on host {}: {e}", parent.id))
        })
    }

    async fn image_exists(docker: &Docker, image_url: &str) -> Result<bool> {
        match docker.inspect_image(image_url).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(Error::Provider(format!("failed to inspect image {image_url}: {e}"))),
        }
    }

    async fn pull(docker: &Docker, image_url: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image_url.to_string(),
            ..Default::default()
        };

        let mut pull_stream = docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image_url, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(Error::Provider(format!("failed to pull image {image_url}: {e}")));
                }
            }
        }
        Ok(())
    }
}

impl CloudManager for DockerManager {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn container_manager(&self) -> Option<&dyn ContainerManager> {
        Some(self)
    }
}

#[async_trait]
impl ContainerManager for DockerManager {
    async fn build_container_image(
        &self,
        ctx: &JobContext,
        parent: &Host,
        image_url: &str,
    ) -> Result<()> {
        let docker = self.client_for(parent)?;

        ctx.run(async {
            if Self::image_exists(&docker, image_url).await? {
                debug!(host_id = %parent.id, image = %image_url, "Image already present");
                return Ok(());
            }

            info!(host_id = %parent.id, image = %image_url, "Pulling image");
            Self::pull(&docker, image_url).await?;
            info!(host_id = %parent.id, image = %image_url, "Image pulled");
            Ok(())
        })
        .await
    }
}
