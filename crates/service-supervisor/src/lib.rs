//! # Service Supervisor
//!
//! Component lifecycle supervision for the Evergreen edge agent.
//!
//! The supervisor owns one state-machine worker per declared service, gates
//! startup on HARD/SOFT dependencies, restarts failed services with bounded
//! retries and exponential backoff, and applies new configurations through a
//! transactional merge with component validation and optional rollback.
//!
//! ## Example
//!
//! ```no_run
//! use config_tree::{ConfigTree, MergeBehavior, TopicPath};
//! use service_supervisor::{RootLayout, Supervisor};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> service_supervisor::Result<()> {
//! let tree = ConfigTree::new();
//! tree.merge_value(
//!     &TopicPath::root(),
//!     &json!({"services": {"main": {"lifecycle": {"run": "sleep 60"}}}}),
//!     MergeBehavior::Merge,
//!     config_tree::now_ms(),
//! )?;
//!
//! let supervisor = Supervisor::new(tree, RootLayout::new("/var/evergreen"));
//! supervisor.launch()?;
//! supervisor.shutdown(Duration::from_secs(60)).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

mod builtin;
mod graph;
mod merge;
mod model;
mod service;
mod state;
mod supervisor;
mod validator;

pub use builtin::{BuiltinRegistry, BuiltinService};
pub use graph::{DependencyGraph, DependencyKind, DependencySpec};
pub use merge::{
    Deployment, DeploymentOutcome, DeploymentResult, FailurePolicy, MergeFailure, RejectionKind,
    SafetyCheck, SafetyPolicy, ServiceChange, UpdatePolicy, ValidationRejection,
};
pub use model::{
    build_graph, load_definition, service_names, service_path, services_path, state_topic_path,
    Lifecycle, RootLayout, ServiceDefinition, ServiceKind, MAIN_SERVICE, STATE_TOPIC,
};
pub use service::ServiceHandle;
pub use state::{DesiredState, ServiceState, StateEvent};
pub use supervisor::{StateListener, Supervisor};
pub use validator::{ConfigValidator, ValidatorRegistry, Verdict};

/// Default deadline for `install` and other unbounded-by-config steps
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default deadline for the `startup` step
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default deadline for the `shutdown` step before the process is killed
pub const DEFAULT_SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(15);

/// Default deadline for the whole supervisor shutdown walk
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default per-component validation deadline during a merge
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(20);

/// Default deadline for affected services to settle after a merge
pub const DEFAULT_DEPLOYMENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Install attempts before a service goes BROKEN
pub const MAX_INSTALL_ATTEMPTS: u32 = 3;

/// Startup/run attempts before a service goes BROKEN
pub const MAX_STARTUP_ATTEMPTS: u32 = 3;

/// Base of the exponential retry backoff
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Cap of the exponential retry backoff
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Error types for supervision operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration tree errors
    #[error("configuration tree error: {0}")]
    Tree(#[from] config_tree::Error),

    /// Lifecycle step execution errors
    #[error("step execution error: {0}")]
    Step(#[from] step_runner::Error),

    /// Malformed or inconsistent configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No root service `main` declared
    #[error("no root service 'main' declared")]
    MissingRootService,

    /// The dependency graph has a cycle
    #[error("cyclic dependency: {0}")]
    CyclicDependency(String),

    /// Service not found
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// An internal invariant broke; the service is marked BROKEN
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
