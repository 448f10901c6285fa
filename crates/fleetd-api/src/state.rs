//! Application state.

use fleetd_core::Environment;
use fleetd_scheduler::Queue;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub env: Arc<Environment>,
    pub queue: Arc<dyn Queue>,
    /// Present when running against PostgreSQL; used by the readiness check.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(env: Arc<Environment>, queue: Arc<dyn Queue>) -> Self {
        Self {
            env,
            queue,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }
}
