//! In-process builtin services
//!
//! A builtin service is a function table registered with the supervisor
//! instead of shell scripts; the same state machine drives both variants.

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Capability set of an in-process service
///
/// `install`, `startup`, and `shutdown` default to no-ops; `run` should
/// resolve only when the service is done (resolving `Ok` maps to a clean
/// exit, `Err` to a failure). The worker drops the `run` future on stop.
#[async_trait]
pub trait BuiltinService: Send + Sync {
    /// One-time installation
    async fn install(&self) -> Result<()> {
        Ok(())
    }

    /// Bounded warm-up before the service counts as running
    async fn startup(&self) -> Result<()> {
        Ok(())
    }

    /// The long-lived body of the service
    async fn run(&self) -> Result<()>;

    /// Graceful stop
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Registry mapping service names to builtin implementations
#[derive(Default)]
pub struct BuiltinRegistry {
    builtins: Mutex<HashMap<String, Arc<dyn BuiltinService>>>,
}

impl BuiltinRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builtin under a service name
    pub fn register(&self, name: impl Into<String>, service: Arc<dyn BuiltinService>) {
        self.builtins.lock().unwrap().insert(name.into(), service);
    }

    /// Look up a builtin by service name
    pub fn get(&self, name: &str) -> Option<Arc<dyn BuiltinService>> {
        self.builtins.lock().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    #[async_trait]
    impl BuiltinService for Idle {
        async fn run(&self) -> Result<()> {
            smol::future::pending().await
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = BuiltinRegistry::new();
        registry.register("telemetry", Arc::new(Idle));
        assert!(registry.get("telemetry").is_some());
        assert!(registry.get("absent").is_none());
    }
}
