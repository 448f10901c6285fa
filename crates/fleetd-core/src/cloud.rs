//! Cloud provider capabilities.
//!
//! A provider driver is obtained as a [`CloudManager`] and narrowed to the
//! capability a piece of work needs. Narrowing fails closed: a driver that does
//! not offer a capability yields [`Error::Unsupported`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::context::JobContext;
use crate::host::Host;
use crate::settings::Settings;
use crate::{Error, Result};

/// Handle to a provider driver.
pub trait CloudManager: Send + Sync {
    /// Name of the provider this driver talks to.
    fn provider(&self) -> &str;

    /// The container image builder capability, if this driver has one.
    fn container_manager(&self) -> Option<&dyn ContainerManager> {
        None
    }
}

/// Drivers that can put container images onto a parent host.
#[async_trait]
pub trait ContainerManager: Send + Sync {
    /// Build or download `image_url` on `parent`, returning once the image is
    /// available there. Not idempotent at the provider; callers bound retries.
    async fn build_container_image(
        &self,
        ctx: &JobContext,
        parent: &Host,
        image_url: &str,
    ) -> Result<()>;
}

/// Narrow a driver to its container image builder.
pub fn as_container_manager(manager: &dyn CloudManager) -> Result<&dyn ContainerManager> {
    manager.container_manager().ok_or_else(|| {
        Error::Unsupported(format!(
            "provider '{}' cannot build container images",
            manager.provider()
        ))
    })
}

/// Resolves provider names to drivers.
#[async_trait]
pub trait ManagerFactory: Send + Sync {
    /// Driver for `provider`, or a configuration error when the provider is
    /// unknown or its settings are invalid.
    async fn get_manager(&self, provider: &str, settings: &Settings)
    -> Result<Arc<dyn CloudManager>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BareMetal;

    impl CloudManager for BareMetal {
        fn provider(&self) -> &str {
            "static"
        }
    }

    struct Builder;

    impl CloudManager for Builder {
        fn provider(&self) -> &str {
            "builder"
        }

        fn container_manager(&self) -> Option<&dyn ContainerManager> {
            Some(self)
        }
    }

    #[async_trait]
    impl ContainerManager for Builder {
        async fn build_container_image(
            &self,
            _ctx: &JobContext,
            _parent: &Host,
            _image_url: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_narrowing_fails_closed() {
        let err = as_container_manager(&BareMetal).err().unwrap();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(err.to_string().contains("static"));
    }

    #[tokio::test]
    async fn test_narrowing_succeeds_for_capable_driver() {
        let manager = as_container_manager(&Builder).unwrap();
        let parent = Host::new("h1", "ubuntu-docker", "builder");
        manager
            .build_container_image(&JobContext::default(), &parent, "alpine:3")
            .await
            .unwrap();
    }
}
