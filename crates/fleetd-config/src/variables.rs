//! Variable interpolation for settings values.
//!
//! Supports variables like:
//! - `${env.VAR_NAME}` - Environment variable
//! - `${hostname}` - Name of the machine the service runs on
//! - `${NAME}` - Custom variable set by the caller

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Values available for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Custom variables defined by the caller
    pub custom: HashMap<String, String>,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context holding the current process environment.
    pub fn from_process_env() -> Self {
        Self {
            env: std::env::vars().collect(),
            custom: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["env", name] => self.env.get(*name).cloned(),
            ["hostname"] => self
                .custom
                .get("hostname")
                .cloned()
                .or_else(|| self.env.get("HOSTNAME").cloned()),
            [name] => self.custom.get(*name).cloned(),
            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left as
    /// written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Names of the variables in `input` that cannot be resolved.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_variables() {
        let ctx = VariableContext::new()
            .with_env("PGHOST", "db.internal")
            .with_env("PGPORT", "5432");

        let result = ctx.interpolate("postgres://${env.PGHOST}:${env.PGPORT}/fleetd");
        assert_eq!(result, "postgres://db.internal:5432/fleetd");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        let result = ctx.interpolate("Unknown: ${env.NOPE}");
        assert_eq!(result, "Unknown: ${env.NOPE}");
        assert_eq!(ctx.unresolved("${env.NOPE} ${env.ALSO_NOPE}"), vec![
            "env.NOPE".to_string(),
            "env.ALSO_NOPE".to_string()
        ]);
    }

    #[test]
    fn test_hostname_prefers_custom() {
        let ctx = VariableContext::new()
            .with_env("HOSTNAME", "from-env")
            .with_custom("hostname", "from-custom");
        assert_eq!(ctx.interpolate("${hostname}"), "from-custom");

        let ctx = VariableContext::new().with_env("HOSTNAME", "from-env");
        assert_eq!(ctx.interpolate("${hostname}"), "from-env");
    }

    #[test]
    fn test_custom_variables() {
        let ctx = VariableContext::new().with_custom("region", "us-east-1");
        assert_eq!(ctx.interpolate("pool-${region}"), "pool-us-east-1");
    }
}
