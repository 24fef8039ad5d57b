//! Configuration validation capability
//!
//! A running component may register a validator; configuration merges that
//! change its parameters post the proposed map and await the verdict before
//! committing. The transport by which real components expose this capability
//! is out of scope; the supervisor consumes the trait.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A component's answer to a proposed parameter map
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The component accepts the proposed parameters
    Valid,
    /// The component rejects them, with a reason
    Invalid(String),
}

/// Capability to approve or reject a proposed parameter change
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    /// Judge the proposed parameter map
    async fn validate(&self, proposed: &Value) -> Verdict;
}

/// Per-service validator registrations
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: Mutex<HashMap<String, Arc<dyn ConfigValidator>>>,
}

impl ValidatorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator for a service
    pub fn register(&self, service: impl Into<String>, validator: Arc<dyn ConfigValidator>) {
        self.validators
            .lock()
            .unwrap()
            .insert(service.into(), validator);
    }

    /// Remove a service's validator
    pub fn deregister(&self, service: &str) {
        self.validators.lock().unwrap().remove(service);
    }

    /// Look up a service's validator
    pub fn get(&self, service: &str) -> Option<Arc<dyn ConfigValidator>> {
        self.validators.lock().unwrap().get(service).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct RejectAll;

    #[async_trait]
    impl ConfigValidator for RejectAll {
        async fn validate(&self, _proposed: &Value) -> Verdict {
            Verdict::Invalid("always".to_string())
        }
    }

    #[smol_potat::test]
    async fn test_register_and_validate() {
        let registry = ValidatorRegistry::new();
        registry.register("svcA", Arc::new(RejectAll));

        let validator = registry.get("svcA").unwrap();
        assert_eq!(
            validator.validate(&json!({"k": "v2"})).await,
            Verdict::Invalid("always".to_string())
        );

        registry.deregister("svcA");
        assert!(registry.get("svcA").is_none());
    }
}
