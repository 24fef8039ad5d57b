//! Service lifecycle states

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Not yet installed
    New,
    /// Install step succeeded
    Installed,
    /// Startup step in progress
    Starting,
    /// Run step active (or idle with no run step)
    Running,
    /// Shutdown step in progress
    Stopping,
    /// A lifecycle step failed; retry pending
    Errored,
    /// Retries exhausted; terminal until the configuration changes
    Broken,
    /// Ran to completion or stopped
    Finished,
}

impl ServiceState {
    /// Terminal states (no further lifecycle steps without outside input)
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Broken | ServiceState::Finished)
    }

    /// States that satisfy a HARD dependency
    pub fn satisfies_hard(&self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Finished)
    }

    /// States that satisfy a SOFT dependency (start has at least been attempted)
    pub fn satisfies_soft(&self) -> bool {
        !matches!(
            self,
            ServiceState::New | ServiceState::Installed | ServiceState::Starting
        )
    }

    /// The value published to the service's `_State` topic
    pub fn as_topic_str(&self) -> &'static str {
        match self {
            ServiceState::New => "NEW",
            ServiceState::Installed => "INSTALLED",
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Errored => "ERRORED",
            ServiceState::Broken => "BROKEN",
            ServiceState::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_topic_str())
    }
}

/// The state a service is being driven towards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredState {
    /// Freshly declared, not yet installed
    New,
    /// Installed but not started
    Installed,
    /// Started and kept running
    Running,
    /// Stopped for good
    Finished,
}

/// A state transition broadcast to global listeners
#[derive(Debug, Clone)]
pub struct StateEvent {
    /// Service name
    pub service: String,
    /// State before the transition
    pub old: ServiceState,
    /// State after the transition
    pub new: ServiceState,
}
