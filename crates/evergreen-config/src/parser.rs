//! Configuration parser with environment variable substitution

use crate::{Config, ConfigError, Result};
use regex::Regex;
use service_supervisor::DependencySpec;
use std::collections::HashMap;
use std::path::Path;

/// Parse a YAML configuration file
pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse YAML configuration from a string
pub fn parse_str(content: &str) -> Result<Config> {
    let mut config: Config = serde_yaml::from_str(content)?;
    substitute_config_env(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration
fn validate_config(config: &Config) -> Result<()> {
    for (name, service) in &config.services {
        // Check dependency declarations parse and reference declared services
        for dep in &service.dependencies {
            let spec = DependencySpec::parse(dep).map_err(|e| {
                ConfigError::ValidationError(format!("service '{}': {}", name, e))
            })?;
            if !config.services.contains_key(&spec.name) {
                return Err(ConfigError::ValidationError(format!(
                    "Service '{}' depends on unknown service '{}'",
                    name, spec.name
                )));
            }
        }

        if let Some(service_type) = &service.service_type {
            if !matches!(service_type.as_str(), "external" | "builtin" | "plugin") {
                return Err(ConfigError::ValidationError(format!(
                    "Service '{}' has unknown type '{}'",
                    name, service_type
                )));
            }
        }
    }

    Ok(())
}

/// Substitute environment variables in a string
///
/// Supports `${VAR}` and `${VAR:-default}`. Only environment values go
/// through substitution; lifecycle scripts keep `${...}` for the shell.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let pattern = Regex::new(r"\$\{([^}]+)\}").unwrap();
    let mut unresolved = Vec::new();

    let substituted = pattern.replace_all(input, |caps: &regex::Captures<'_>| {
        let expr = &caps[1];
        match resolve_env_expr(expr) {
            Some(value) => value,
            None => {
                let name = expr.split_once(":-").map(|(n, _)| n).unwrap_or(expr);
                unresolved.push(name.to_string());
                caps[0].to_string()
            }
        }
    });

    if unresolved.is_empty() {
        Ok(substituted.into_owned())
    } else {
        Err(ConfigError::EnvVarNotFound(unresolved.join(", ")))
    }
}

/// Resolve one `NAME` or `NAME:-fallback` expression against the environment
fn resolve_env_expr(expr: &str) -> Option<String> {
    let (name, fallback) = match expr.split_once(":-") {
        Some((name, fallback)) => (name, Some(fallback)),
        None => (expr, None),
    };
    std::env::var(name)
        .ok()
        .or_else(|| fallback.map(str::to_string))
}

fn substitute_env_map(env: &mut HashMap<String, String>) -> Result<()> {
    for value in env.values_mut() {
        *value = substitute_env_vars(value)?;
    }
    Ok(())
}

fn substitute_config_env(config: &mut Config) -> Result<()> {
    substitute_env_map(&mut config.setenv)?;
    for service in config.services.values_mut() {
        substitute_env_map(&mut service.setenv)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_with_default() {
        let result =
            substitute_env_vars("${MISSING_VAR_UNLIKELY_TO_EXIST:-default_value}").unwrap();
        assert_eq!(result, "default_value");
    }

    #[test]
    fn test_env_var_missing_is_error() {
        assert!(matches!(
            substitute_env_vars("${MISSING_VAR_UNLIKELY_TO_EXIST}"),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_env_var_substitution() {
        if let Ok(home) = std::env::var("HOME") {
            let result = substitute_env_vars("prefix-${HOME}-suffix").unwrap();
            assert_eq!(result, format!("prefix-{}-suffix", home));
        }
    }

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
services:
  main:
    dependencies: [svcA, svcB:SOFT]
  svcA:
    lifecycle:
      install: {script: "mkdir -p /tmp/foo", timeout: 30}
      run: "while true; do date; sleep 5; done"
      startup: {script: "./warmup.sh", timeout: 60}
  svcB:
    lifecycle:
      run: "sleep 5"
"#;
        let config = parse_str(yaml).unwrap();
        assert_eq!(config.services.len(), 3);
        let svc_a = &config.services["svcA"];
        assert_eq!(
            svc_a.lifecycle.run.as_ref().unwrap().script,
            "while true; do date; sleep 5; done"
        );
        assert_eq!(svc_a.lifecycle.startup.as_ref().unwrap().timeout, Some(60));
        assert_eq!(config.services["main"].dependencies.len(), 2);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let yaml = r#"
services:
  main:
    dependencies: [ghost]
"#;
        assert!(matches!(
            parse_str(yaml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_bad_dependency_kind_rejected() {
        let yaml = r#"
services:
  main:
    dependencies: ["svcA:MEDIUM"]
  svcA: {}
"#;
        assert!(matches!(
            parse_str(yaml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let yaml = r#"
services:
  main:
    type: container
"#;
        assert!(matches!(
            parse_str(yaml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_setenv_substitution() {
        let yaml = r#"
setenv:
  ROOT_HINT: "${MISSING_VAR_UNLIKELY_TO_EXIST:-/srv}"
services:
  main:
    setenv:
      LOCAL: "${ANOTHER_MISSING_VAR:-fallback}"
    lifecycle:
      run: "echo ${NOT_SUBSTITUTED}"
"#;
        let config = parse_str(yaml).unwrap();
        assert_eq!(config.setenv["ROOT_HINT"], "/srv");
        assert_eq!(config.services["main"].setenv["LOCAL"], "fallback");
        // Scripts keep shell expansions untouched.
        assert_eq!(
            config.services["main"].lifecycle.run.as_ref().unwrap().script,
            "echo ${NOT_SUBSTITUTED}"
        );
    }

    #[test]
    fn test_to_tree_value_shape() {
        let yaml = r#"
services:
  main:
    version: "1.0"
    configuration:
      k: v1
"#;
        let config = parse_str(yaml).unwrap();
        let value = config.to_tree_value().unwrap();
        assert_eq!(value["services"]["main"]["version"], "1.0");
        assert_eq!(value["services"]["main"]["configuration"]["k"], "v1");
    }

    #[test]
    fn test_parse_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        std::fs::write(&path, "services:\n  main:\n    lifecycle:\n      run: \"true\"\n")
            .unwrap();
        let config = parse_file(&path).unwrap();
        assert!(config.services.contains_key("main"));
    }
}
