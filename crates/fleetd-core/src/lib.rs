//! Core domain types and traits for fleetd.
//!
//! This crate contains:
//! - Identifiers and the common error type
//! - The error collector used to accumulate failures within one job
//! - The job abstraction, execution context and job type registry
//! - Host records and the host store boundary
//! - Cloud provider capability traits
//! - Settings and the environment handle jobs run against

pub mod catcher;
pub mod cloud;
pub mod context;
pub mod env;
pub mod error;
pub mod host;
pub mod id;
pub mod job;
pub mod registry;
pub mod settings;

pub use catcher::{AggregateError, ErrorCollector};
pub use context::JobContext;
pub use env::Environment;
pub use error::{Error, Result, ResultExt};
pub use id::{HostId, JobId};
