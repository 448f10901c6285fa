//! Service settings parsing.
//!
//! ```kdl
//! database url="${env.DATABASE_URL}" max-connections=10
//! api listen="0.0.0.0:3000"
//! queue workers=4 poll-interval-ms=1000 job-timeout-secs=1800 lease-timeout-secs=2700
//! provider "docker" {
//!     api-port 2376
//! }
//! provider "mock"
//! ```

use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};
use fleetd_core::settings::{
    ApiSettings, DatabaseSettings, ProviderSettings, QueueSettings, Settings,
};
use kdl::{KdlDocument, KdlNode, KdlValue};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Read and parse a settings file, interpolating against the process
/// environment.
pub fn load_settings(path: impl AsRef<Path>) -> ConfigResult<Settings> {
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content, &VariableContext::from_process_env())
}

/// Parse settings from KDL text.
pub fn parse_settings(kdl: &str, vars: &VariableContext) -> ConfigResult<Settings> {
    let doc: KdlDocument = kdl.parse()?;

    let mut database = None;
    let mut api = ApiSettings::default();
    let mut queue = QueueSettings::default();
    let mut providers = BTreeMap::new();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => {
                let url = get_string_prop(node, "url", vars)?
                    .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?;
                let max_connections = get_u64_prop(node, "max-connections")?
                    .map(|n| narrow::<u32>(n, "database max-connections"))
                    .transpose()?
                    .unwrap_or(DEFAULT_MAX_CONNECTIONS);
                database = Some(DatabaseSettings {
                    url,
                    max_connections,
                });
            }
            "api" => {
                if let Some(listen) = get_string_prop(node, "listen", vars)? {
                    api.listen = listen;
                }
            }
            "queue" => parse_queue(node, &mut queue)?,
            "provider" => {
                let provider = parse_provider(node, vars)?;
                if providers.contains_key(&provider.name) {
                    return Err(ConfigError::Duplicate(format!("provider '{}'", provider.name)));
                }
                providers.insert(provider.name.clone(), provider);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(Settings {
        database,
        api,
        queue,
        providers,
    })
}

fn parse_queue(node: &KdlNode, queue: &mut QueueSettings) -> ConfigResult<()> {
    if let Some(workers) = get_u64_prop(node, "workers")? {
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        queue.workers = narrow::<usize>(workers, "queue workers")?;
    }
    if let Some(ms) = get_u64_prop(node, "poll-interval-ms")? {
        queue.poll_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = get_u64_prop(node, "job-timeout-secs")? {
        // Zero disables the deadline.
        queue.job_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(secs) = get_u64_prop(node, "lease-timeout-secs")? {
        queue.lease_timeout = Duration::from_secs(secs);
    }
    if let Some(job_timeout) = queue.job_timeout {
        if queue.lease_timeout <= job_timeout {
            return Err(ConfigError::InvalidValue {
                field: "queue lease-timeout-secs".to_string(),
                message: format!(
                    "{}s must be longer than job-timeout-secs ({}s)",
                    queue.lease_timeout.as_secs(),
                    job_timeout.as_secs()
                ),
            });
        }
    }
    Ok(())
}

fn parse_provider(node: &KdlNode, vars: &VariableContext) -> ConfigResult<ProviderSettings> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("provider name".to_string()))?;
    let mut provider = ProviderSettings::new(name);

    // Inline properties: provider "docker" api-port=2376
    for entry in node.entries() {
        if let Some(key) = entry.name() {
            if let Some(value) = render_value(entry.value()) {
                let field = format!("provider {} {}", provider.name, key.value());
                provider
                    .options
                    .insert(key.value().to_string(), interpolate(&value, &field, vars)?);
            }
        }
    }

    // Block form: provider "docker" { api-port 2376 }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            let value = child
                .entries()
                .iter()
                .find(|e| e.name().is_none())
                .and_then(|e| render_value(e.value()));
            if let Some(value) = value {
                let field = format!("provider {} {}", provider.name, key);
                provider.options.insert(key, interpolate(&value, &field, vars)?);
            }
        }
    }

    Ok(provider)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(
    node: &KdlNode,
    name: &str,
    vars: &VariableContext,
) -> ConfigResult<Option<String>> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| interpolate(s, &format!("{} {}", node.name().value(), name), vars))
        .transpose()
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    let field = format!("{} {}", node.name().value(), name);
    let n = value.as_integer().ok_or_else(|| ConfigError::InvalidValue {
        field: field.clone(),
        message: format!("expected an integer, got {value}"),
    })?;
    u64::try_from(n).map(Some).map_err(|_| ConfigError::InvalidValue {
        field,
        message: format!("{n} is out of range"),
    })
}

fn narrow<T: TryFrom<u64>>(n: u64, field: &str) -> ConfigResult<T> {
    T::try_from(n).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{n} is out of range"),
    })
}

fn render_value(value: &KdlValue) -> Option<String> {
    if let Some(s) = value.as_string() {
        return Some(s.to_string());
    }
    if let Some(n) = value.as_integer() {
        return Some(n.to_string());
    }
    if let Some(f) = value.as_float() {
        return Some(f.to_string());
    }
    value.as_bool().map(|b| b.to_string())
}

fn interpolate(raw: &str, field: &str, vars: &VariableContext) -> ConfigResult<String> {
    if let Some(name) = vars.unresolved(raw).into_iter().next() {
        return Err(ConfigError::UnresolvedVariable {
            field: field.to_string(),
            name,
        });
    }
    Ok(vars.interpolate(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_settings() {
        let kdl = r#"
            database url="postgres://${env.PGUSER}@db/fleetd" max-connections=20
            api listen="127.0.0.1:8080"
            queue workers=8 poll-interval-ms=250 job-timeout-secs=600 lease-timeout-secs=900

            provider "docker" {
                api-port 2376
                pull-timeout-secs 900
            }

            provider "mock" fail-builds=#true
        "#;
        let vars = VariableContext::new().with_env("PGUSER", "fleet");

        let settings = parse_settings(kdl, &vars).unwrap();

        let database = settings.database.as_ref().unwrap();
        assert_eq!(database.url, "postgres://fleet@db/fleetd");
        assert_eq!(database.max_connections, 20);
        assert_eq!(settings.api.listen, "127.0.0.1:8080");
        assert_eq!(settings.queue.workers, 8);
        assert_eq!(settings.queue.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.queue.job_timeout, Some(Duration::from_secs(600)));
        assert_eq!(settings.queue.lease_timeout, Duration::from_secs(900));

        let docker = settings.provider("docker").unwrap();
        assert_eq!(docker.get("api-port"), Some("2376"));
        assert_eq!(docker.get_parsed::<u64>("pull-timeout-secs").unwrap(), Some(900));
        assert_eq!(settings.provider("mock").unwrap().get("fail-builds"), Some("true"));
    }

    #[test]
    fn test_defaults_without_sections() {
        let settings = parse_settings("provider \"mock\"", &VariableContext::new()).unwrap();
        assert!(settings.database.is_none());
        assert_eq!(settings.api.listen, "0.0.0.0:3000");
        assert_eq!(settings.queue.workers, 4);
        assert!(settings.providers.contains_key("mock"));
    }

    #[test]
    fn test_zero_job_timeout_disables_deadline() {
        let settings =
            parse_settings("queue job-timeout-secs=0", &VariableContext::new()).unwrap();
        assert_eq!(settings.queue.job_timeout, None);
    }

    #[test]
    fn test_lease_must_outlive_job_timeout() {
        let result = parse_settings(
            "queue job-timeout-secs=1800 lease-timeout-secs=600",
            &VariableContext::new(),
        );
        match result {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "queue lease-timeout-secs")
            }
            other => panic!("expected invalid lease, got {other:?}"),
        }

        // Lowering only the job timeout keeps the default lease valid.
        let settings =
            parse_settings("queue job-timeout-secs=60", &VariableContext::new()).unwrap();
        assert!(settings.queue.lease_timeout > Duration::from_secs(60));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = parse_settings("queue workers=0", &VariableContext::new());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let kdl = r#"
            provider "docker"
            provider "docker"
        "#;
        let result = parse_settings(kdl, &VariableContext::new());
        assert!(matches!(result, Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_database_requires_url() {
        let result = parse_settings("database max-connections=5", &VariableContext::new());
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_unresolved_variable_rejected() {
        let result = parse_settings(
            r#"database url="${env.DATABASE_URL}""#,
            &VariableContext::new(),
        );
        match result {
            Err(ConfigError::UnresolvedVariable { name, .. }) => {
                assert_eq!(name, "env.DATABASE_URL")
            }
            other => panic!("expected unresolved variable error, got {other:?}"),
        }
    }

    #[test]
    fn test_non_integer_rejected() {
        let result = parse_settings(r#"queue workers="many""#, &VariableContext::new());
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
