//! Service settings.
//!
//! These are plain values; parsing them from a settings file is the job of the
//! `fleetd-config` crate.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Settings for the whole service.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Database connection. Without one, in-memory stores are used.
    pub database: Option<DatabaseSettings>,
    pub api: ApiSettings,
    pub queue: QueueSettings,
    /// Provider settings keyed by provider name.
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Settings {
    /// Settings for the named provider.
    pub fn provider(&self, name: &str) -> Result<&ProviderSettings> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("no settings for provider '{name}'")))
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub listen: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,
    /// Deadline applied to every job execution.
    pub job_timeout: Option<Duration>,
    /// A claim its worker has not renewed within this window is handed out
    /// again. Must be longer than `job_timeout`.
    pub lease_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(1),
            job_timeout: Some(Duration::from_secs(30 * 60)),
            lease_timeout: Duration::from_secs(45 * 60),
        }
    }
}

/// Free-form options for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSettings {
    pub name: String,
    pub options: BTreeMap<String, String>,
}

impl ProviderSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Parse an option, failing with a configuration error when it is malformed.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|_| {
                    Error::Configuration(format!(
                        "invalid value '{raw}' for '{key}' on provider '{}'",
                        self.name
                    ))
                })
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_provider_is_configuration_error() {
        let settings = Settings::default();
        let err = settings.provider("docker").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_get_parsed() {
        let provider = ProviderSettings::new("docker")
            .with_option("api-port", "2376")
            .with_option("timeout-secs", "soon");
        assert_eq!(provider.get_parsed::<u16>("api-port").unwrap(), Some(2376));
        assert_eq!(provider.get_parsed::<u16>("missing").unwrap(), None);
        assert!(provider.get_parsed::<u64>("timeout-secs").is_err());
    }
}
