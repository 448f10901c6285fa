//! API server for fleetd.
//!
//! Provides the HTTP management API over hosts and queued jobs.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
