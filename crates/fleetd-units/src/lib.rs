//! Job implementations for fleetd.
//!
//! Every job type in this crate is registered with [`register_all`] so that
//! workers can rebuild it from a persisted record.

pub mod building_container_image;

pub use building_container_image::{
    BUILDING_CONTAINER_IMAGE_JOB_NAME, BuildingContainerImageJob, CONTAINER_BUILD_RETRIES,
};

use fleetd_core::Result;
use fleetd_core::registry::JobRegistry;

/// Register every job type in this crate.
pub fn register_all(registry: &mut JobRegistry) -> Result<()> {
    registry.register(BUILDING_CONTAINER_IMAGE_JOB_NAME, || {
        Box::new(BuildingContainerImageJob::empty())
    })?;
    Ok(())
}
