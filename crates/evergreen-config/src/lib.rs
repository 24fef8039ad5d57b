//! # Evergreen Config
//!
//! YAML input-configuration parser for the Evergreen agent.
//!
//! The input file declares the initial service set:
//!
//! ```yaml
//! services:
//!   main:
//!     dependencies: [svcA, svcB:SOFT]
//!   svcA:
//!     lifecycle:
//!       install: {script: "mkdir -p /tmp/foo", timeout: 30}
//!       run: "while true; do date; sleep 5; done"
//! ```
//!
//! Parsing validates dependency references and kinds, substitutes
//! `${VAR}`/`${VAR:-default}` in environment values, and converts the result
//! into the plain value merged into the configuration tree at launch.

mod parser;

pub use parser::{parse_file, parse_str, substitute_env_vars};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use step_runner::StepSpec;

/// Error types for input-configuration handling
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed YAML
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Conversion to the tree value failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally valid YAML describing an invalid configuration
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A `${VAR}` reference without a value or default
    #[error("environment variable(s) not found: {0}")]
    EnvVarNotFound(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ConfigError>;

/// The parsed input configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Declared services by name
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    /// Process-global environment for every lifecycle step
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub setenv: HashMap<String, String>,
}

/// Declared lifecycle steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Lifecycle {
    /// One-time installation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<StepSpec>,
    /// Bounded warm-up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup: Option<StepSpec>,
    /// Long-lived process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<StepSpec>,
    /// Graceful stop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<StepSpec>,
    /// Best-effort repair before a retry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recover: Option<StepSpec>,
}

impl Lifecycle {
    fn is_empty(&self) -> bool {
        self.install.is_none()
            && self.startup.is_none()
            && self.run.is_none()
            && self.shutdown.is_none()
            && self.recover.is_none()
    }
}

/// One declared service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    /// Execution variant (`external`, `builtin`, `plugin`)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    /// Lifecycle steps
    #[serde(skip_serializing_if = "Lifecycle::is_empty")]
    pub lifecycle: Lifecycle,
    /// `name[:HARD|SOFT]` dependency declarations
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Service-local environment
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub setenv: HashMap<String, String>,
    /// Declared version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Free-form parameter subtree
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<serde_json::Value>,
    /// Accepted alias of `configuration`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl Config {
    /// Convert to the plain value merged into the configuration tree
    ///
    /// `${VAR}` substitution has already happened during parsing.
    pub fn to_tree_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
