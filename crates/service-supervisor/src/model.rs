//! Service definitions and well-known topics
//!
//! Each service owns exactly one subtree `/services/<name>`; its definition
//! is read back out of the tree whenever the state machine needs it, so
//! configuration merges are picked up without extra plumbing.

use crate::graph::{DependencyGraph, DependencySpec};
use crate::{Error, Result};
use config_tree::{ConfigTree, TopicPath};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use step_runner::StepSpec;

/// Name of the root service every deployment must declare
pub const MAIN_SERVICE: &str = "main";

/// Top-level subtree holding all service definitions
pub const SERVICES_ROOT: &str = "services";

/// Per-service topic reflecting the current lifecycle state
pub const STATE_TOPIC: &str = "_State";

/// Path of the `/services` subtree
pub fn services_path() -> TopicPath {
    TopicPath::from_segments([SERVICES_ROOT])
}

/// Path of one service's subtree
pub fn service_path(name: &str) -> TopicPath {
    TopicPath::from_segments([SERVICES_ROOT, name])
}

/// Path of a service's `_State` topic
pub fn state_topic_path(name: &str) -> TopicPath {
    service_path(name).child(STATE_TOPIC)
}

/// Path of a service's `dependencies` leaf
pub fn dependencies_path(name: &str) -> TopicPath {
    service_path(name).child("dependencies")
}

/// Path of the process-global `setenv` subtree
pub fn global_setenv_path() -> TopicPath {
    TopicPath::from_segments(["setenv"])
}

/// Declared lifecycle steps of a service
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Lifecycle {
    /// One-time installation
    pub install: Option<StepSpec>,
    /// Bounded warm-up before the service counts as running
    pub startup: Option<StepSpec>,
    /// The long-lived process; its exit drives the state machine
    pub run: Option<StepSpec>,
    /// Graceful stop
    pub shutdown: Option<StepSpec>,
    /// Best-effort repair attempted before an error retry
    pub recover: Option<StepSpec>,
}

/// How a service executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// External process driven by shell lifecycle steps
    #[default]
    #[serde(alias = "plugin")]
    External,
    /// In-process function table registered with the supervisor
    Builtin,
}

/// A service definition as written under `/services/<name>`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceDefinition {
    /// Execution variant
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    /// Lifecycle steps
    pub lifecycle: Lifecycle,
    /// Raw dependency declarations (`name[:HARD|SOFT]`)
    pub dependencies: Vec<String>,
    /// Service-local environment for every step
    pub setenv: HashMap<String, String>,
    /// Declared version, used for the artifacts directory
    pub version: Option<String>,
    configuration: Option<Value>,
    parameters: Option<Value>,
}

impl ServiceDefinition {
    /// Parse the declared dependencies
    pub fn parsed_dependencies(&self) -> Result<Vec<DependencySpec>> {
        self.dependencies
            .iter()
            .map(|d| DependencySpec::parse(d))
            .collect()
    }

    /// The free-form parameter subtree
    ///
    /// `configuration` is preferred; `parameters` is accepted as an alias on
    /// read for older deployments.
    pub fn configuration(&self) -> Option<&Value> {
        self.configuration.as_ref().or(self.parameters.as_ref())
    }
}

/// Read one service's definition out of the tree
///
/// Returns `None` when the subtree does not exist (the service has been
/// removed).
pub fn load_definition(tree: &ConfigTree, name: &str) -> Result<Option<ServiceDefinition>> {
    let Some(value) = tree.read(&service_path(name)) else {
        return Ok(None);
    };
    let definition = serde_json::from_value(value)
        .map_err(|e| Error::Config(format!("invalid definition for service '{}': {}", name, e)))?;
    Ok(Some(definition))
}

/// Names of all declared services
pub fn service_names(tree: &ConfigTree) -> Vec<String> {
    match tree.read(&services_path()) {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Build the dependency graph from the current tree contents
pub fn build_graph(tree: &ConfigTree) -> Result<DependencyGraph> {
    let Some(Value::Object(services)) = tree.read(&services_path()) else {
        return Ok(DependencyGraph::default());
    };
    graph_from_services(&services)
}

/// Build a dependency graph from a plain `services` map
///
/// Used both for the live tree and for prospective configurations during a
/// merge.
pub fn graph_from_services(services: &serde_json::Map<String, Value>) -> Result<DependencyGraph> {
    let mut adjacency = BTreeMap::new();
    for (name, body) in services {
        let mut deps = Vec::new();
        if let Some(Value::Array(list)) = body.get("dependencies") {
            for entry in list {
                let Some(text) = entry.as_str() else {
                    return Err(Error::Config(format!(
                        "service '{}': dependency entries must be strings",
                        name
                    )));
                };
                deps.push(DependencySpec::parse(text)?);
            }
        }
        adjacency.insert(name.clone(), deps);
    }
    Ok(DependencyGraph::new(adjacency))
}

/// The agent's directory layout under its root
#[derive(Debug, Clone)]
pub struct RootLayout {
    root: PathBuf,
}

impl RootLayout {
    /// Create a layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-service working directory, passed to steps as `{work:path}`
    pub fn work_dir(&self, service: &str) -> PathBuf {
        self.root.join("work").join(service)
    }

    /// Read-only artifacts directory, passed to steps as `{artifacts:path}`
    pub fn artifacts_dir(&self, service: &str, version: &str) -> PathBuf {
        self.root
            .join("packages")
            .join("artifacts")
            .join(service)
            .join(version)
    }
}

/// Expand `{work:path}` and `{artifacts:path}` placeholders in a script
pub fn expand_script(layout: &RootLayout, definition: &ServiceDefinition, name: &str, script: &str) -> String {
    let version = definition.version.as_deref().unwrap_or("0.0.0");
    script
        .replace("{work:path}", &layout.work_dir(name).to_string_lossy())
        .replace(
            "{artifacts:path}",
            &layout.artifacts_dir(name, version).to_string_lossy(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_paths() {
        assert_eq!(service_path("main").to_string(), "/services/main");
        assert_eq!(
            state_topic_path("svcA").to_string(),
            "/services/svcA/_State"
        );
        assert_eq!(
            dependencies_path("svcA").to_string(),
            "/services/svcA/dependencies"
        );
    }

    #[test]
    fn test_definition_from_value() {
        let value = json!({
            "lifecycle": {
                "install": {"script": "mkdir -p /tmp/foo", "timeout": 30},
                "run": "while true; do date; sleep 5; done"
            },
            "dependencies": ["svcA", "svcB:SOFT"],
            "version": "1.2.0",
            "_State": "RUNNING"
        });
        let def: ServiceDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(def.kind, ServiceKind::External);
        assert_eq!(def.lifecycle.install.as_ref().unwrap().timeout, Some(30));
        assert!(def.lifecycle.startup.is_none());
        let deps = def.parsed_dependencies().unwrap();
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[1].name, "svcB");
    }

    #[test]
    fn test_parameters_alias() {
        let with_configuration: ServiceDefinition =
            serde_json::from_value(json!({"configuration": {"k": "v"}})).unwrap();
        assert_eq!(with_configuration.configuration(), Some(&json!({"k": "v"})));

        let with_parameters: ServiceDefinition =
            serde_json::from_value(json!({"parameters": {"k": "v"}})).unwrap();
        assert_eq!(with_parameters.configuration(), Some(&json!({"k": "v"})));

        let both: ServiceDefinition = serde_json::from_value(
            json!({"configuration": {"k": "new"}, "parameters": {"k": "old"}}),
        )
        .unwrap();
        assert_eq!(both.configuration(), Some(&json!({"k": "new"})));
    }

    #[test]
    fn test_plugin_reads_as_external() {
        let def: ServiceDefinition = serde_json::from_value(json!({"type": "plugin"})).unwrap();
        assert_eq!(def.kind, ServiceKind::External);
        let builtin: ServiceDefinition =
            serde_json::from_value(json!({"type": "builtin"})).unwrap();
        assert_eq!(builtin.kind, ServiceKind::Builtin);
    }

    #[smol_potat::test]
    async fn test_build_graph_from_tree() {
        let tree = ConfigTree::new();
        tree.merge_value(
            &TopicPath::root(),
            &json!({"services": {
                "main": {"dependencies": ["svcA"]},
                "svcA": {"dependencies": []}
            }}),
            config_tree::MergeBehavior::Merge,
            1,
        )
        .unwrap();

        let graph = build_graph(&tree).unwrap();
        assert_eq!(graph.ordered_services().unwrap(), vec!["svcA", "main"]);
    }

    #[test]
    fn test_expand_script() {
        let layout = RootLayout::new("/var/evergreen");
        let mut def = ServiceDefinition::default();
        def.version = Some("2.0".to_string());
        let script = expand_script(&layout, &def, "svcA", "cd {work:path} && ls {artifacts:path}");
        assert_eq!(
            script,
            "cd /var/evergreen/work/svcA && ls /var/evergreen/packages/artifacts/svcA/2.0"
        );
    }
}
