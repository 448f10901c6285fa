//! KDL configuration parsing for fleetd.
//!
//! This crate handles parsing of:
//! - Service settings (fleetd.kdl)
//! - Variable interpolation in settings values

pub mod error;
pub mod settings;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use settings::{load_settings, parse_settings};
pub use variables::VariableContext;
