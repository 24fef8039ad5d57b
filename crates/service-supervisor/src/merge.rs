//! Transactional configuration merge
//!
//! A deployment proposes a complete new `services` configuration. The merge
//! classifies the delta, rejects cycles, asks affected components to approve
//! parameter changes, applies everything in one write epoch, drives the
//! affected services to their target states, and rolls back to the pre-merge
//! snapshot on failure when asked to. Merges serialize through one mutex.

use crate::model::{self, MAIN_SERVICE};
use crate::state::ServiceState;
use crate::supervisor::Supervisor;
use crate::validator::Verdict;
use crate::{Result, DEFAULT_DEPLOYMENT_TIMEOUT, DEFAULT_NOTIFY_TIMEOUT};
use async_trait::async_trait;
use config_tree::{now_ms, MergeBehavior, TopicPath};
use futures_lite::future;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What to do when the drive-state step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Leave the system as-is (state may be partially changed; the result
    /// name is historical)
    DoNothing,
    /// Re-apply the pre-merge snapshot
    Rollback,
}

/// Whether components get a say before the merge commits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Post proposed parameter maps to registered validators
    NotifyComponents,
    /// Commit without asking
    SkipNotify,
}

/// Whether the safety-policy oracle is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyPolicy {
    /// Ask the oracle; an unsafe verdict defers the deployment
    CheckSafety,
    /// Apply unconditionally
    SkipSafetyCheck,
}

/// External policy oracle for update safety
#[async_trait]
pub trait SafetyCheck: Send + Sync {
    /// May this deployment proceed right now?
    async fn is_safe_to_update(&self, deployment: &Deployment) -> bool;
}

/// An immutable proposed configuration change
#[derive(Debug, Clone)]
pub struct Deployment {
    /// Unique deployment id
    pub id: Uuid,
    /// Creation timestamp in milliseconds
    pub timestamp: u64,
    /// Failure handling for the drive-state step
    pub failure_policy: FailurePolicy,
    /// Safety-oracle gating
    pub safety_policy: SafetyPolicy,
    /// Validator notification gating
    pub update_policy: UpdatePolicy,
    /// Per-component validation deadline
    pub notify_timeout: Duration,
    /// Deadline for affected services to settle
    pub deployment_timeout: Duration,
}

impl Deployment {
    /// A deployment with default policies (notify, no safety gate, keep on
    /// failure)
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_ms(),
            failure_policy: FailurePolicy::DoNothing,
            safety_policy: SafetyPolicy::SkipSafetyCheck,
            update_policy: UpdatePolicy::NotifyComponents,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            deployment_timeout: DEFAULT_DEPLOYMENT_TIMEOUT,
        }
    }

    /// Same defaults but rolling back on failure
    pub fn with_rollback() -> Self {
        Self {
            failure_policy: FailurePolicy::Rollback,
            ..Self::new()
        }
    }
}

impl Default for Deployment {
    fn default() -> Self {
        Self::new()
    }
}

/// Final status of a merge attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentResult {
    /// Every affected service settled
    Successful,
    /// Drive-state failed; the pre-merge snapshot was re-applied
    FailedRolledBack,
    /// The merge aborted or was kept as-is after failure
    FailedNoStateChange,
    /// The safety oracle deferred the deployment; retry later
    Retry,
}

/// A component's dissenting validation verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRejection {
    /// The dissenting service
    pub service: String,
    /// Why it dissented
    pub verdict: RejectionKind,
}

/// How a component dissented
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionKind {
    /// The component answered INVALID
    Invalid(String),
    /// The component did not answer within the notify timeout
    TimedOut,
}

/// Why a merge did not succeed
#[derive(Debug)]
pub enum MergeFailure {
    /// The prospective dependency graph has a cycle
    CyclicDependency(String),
    /// One or more components rejected the proposed parameters
    Validation(Vec<ValidationRejection>),
    /// Affected services failed to reach their target states in time
    ServicesUnsettled(Vec<String>),
    /// The configuration could not be applied
    Apply(String),
}

/// Result of a merge, with the failure detail when it did not succeed
#[derive(Debug)]
pub struct DeploymentOutcome {
    /// Final status
    pub result: DeploymentResult,
    /// Failure detail for anything but `Successful`
    pub failure: Option<MergeFailure>,
}

impl DeploymentOutcome {
    fn success() -> Self {
        Self {
            result: DeploymentResult::Successful,
            failure: None,
        }
    }

    fn failed(result: DeploymentResult, failure: MergeFailure) -> Self {
        Self {
            result,
            failure: Some(failure),
        }
    }
}

/// Classification of one service within a deployment delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceChange {
    /// New subtree
    Added,
    /// Subtree deleted
    Removed,
    /// Lifecycle, setenv, version, or type changed (reinstall)
    LifecycleChanged,
    /// Only the dependency list changed (restart)
    DependenciesChanged,
    /// Only the parameter subtree changed (observable in place)
    ParametersChanged,
    /// Nothing relevant changed
    Unchanged,
}

fn normalized(body: &Value, key: &str) -> Value {
    body.get(key).cloned().unwrap_or(Value::Null)
}

fn effective_params(body: &Value) -> Value {
    body.get("configuration")
        .or_else(|| body.get("parameters"))
        .cloned()
        .unwrap_or(Value::Null)
}

fn normalized_dependencies(body: &Value) -> Value {
    body.get("dependencies")
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()))
}

fn classify_update(old: &Value, new: &Value) -> ServiceChange {
    let lifecycle_changed = ["lifecycle", "setenv", "version", "type"]
        .iter()
        .any(|key| normalized(old, key) != normalized(new, key));
    if lifecycle_changed {
        return ServiceChange::LifecycleChanged;
    }
    if normalized_dependencies(old) != normalized_dependencies(new) {
        return ServiceChange::DependenciesChanged;
    }
    if effective_params(old) != effective_params(new) {
        return ServiceChange::ParametersChanged;
    }
    ServiceChange::Unchanged
}

/// Classify every service mentioned by either side of the delta
pub(crate) fn classify_services(
    current: &Map<String, Value>,
    proposed: &Map<String, Value>,
) -> BTreeMap<String, ServiceChange> {
    let mut changes = BTreeMap::new();
    for name in current.keys() {
        if !proposed.contains_key(name) {
            changes.insert(name.clone(), ServiceChange::Removed);
        }
    }
    for (name, new_body) in proposed {
        let change = match current.get(name) {
            None => ServiceChange::Added,
            Some(old_body) => classify_update(old_body, new_body),
        };
        changes.insert(name.clone(), change);
    }
    changes
}

impl Supervisor {
    /// Apply a deployment transactionally
    ///
    /// Merges serialize; a second deployment queues behind the first and no
    /// observer sees interleaved writes.
    pub async fn merge(
        &self,
        deployment: &Deployment,
        new_config: &Value,
    ) -> Result<DeploymentOutcome> {
        let _serialized = self.merge_lock.lock().await;
        info!("deployment {}: merge starting", deployment.id);

        // 1. Compute the delta.
        let Some(proposed) = new_config.get("services").and_then(Value::as_object) else {
            return Ok(DeploymentOutcome::failed(
                DeploymentResult::FailedNoStateChange,
                MergeFailure::Apply("deployment has no services map".to_string()),
            ));
        };
        if !proposed.contains_key(MAIN_SERVICE) {
            return Ok(DeploymentOutcome::failed(
                DeploymentResult::FailedNoStateChange,
                MergeFailure::Apply(format!("root service '{}' missing", MAIN_SERVICE)),
            ));
        }

        let current = self.current_services();
        let changes = classify_services(&current, proposed);
        debug!("deployment {}: delta {:?}", deployment.id, changes);

        if changes
            .values()
            .all(|change| *change == ServiceChange::Unchanged)
        {
            info!("deployment {}: configuration identical, nothing to do", deployment.id);
            return Ok(DeploymentOutcome::success());
        }

        // 2. Reject prospective cycles.
        if let Err(e) =
            model::graph_from_services(proposed).and_then(|g| g.ordered_services())
        {
            let failure = match e {
                crate::Error::CyclicDependency(cycle) => MergeFailure::CyclicDependency(cycle),
                other => MergeFailure::Apply(other.to_string()),
            };
            return Ok(DeploymentOutcome::failed(
                DeploymentResult::FailedNoStateChange,
                failure,
            ));
        }

        // 3. Give affected components a veto.
        if deployment.update_policy == UpdatePolicy::NotifyComponents {
            let rejections = self
                .broadcast_validation(deployment, &current, proposed)
                .await;
            if !rejections.is_empty() {
                warn!(
                    "deployment {}: rejected by {} component(s)",
                    deployment.id,
                    rejections.len()
                );
                return Ok(DeploymentOutcome::failed(
                    DeploymentResult::FailedNoStateChange,
                    MergeFailure::Validation(rejections),
                ));
            }
        }

        // 4. Safety gate.
        if deployment.safety_policy == SafetyPolicy::CheckSafety {
            if let Some(oracle) = self.safety_check() {
                if !oracle.is_safe_to_update(deployment).await {
                    info!("deployment {}: deferred by safety policy", deployment.id);
                    return Ok(DeploymentOutcome {
                        result: DeploymentResult::Retry,
                        failure: None,
                    });
                }
            }
        }

        // 5. Apply within a single write epoch, snapshot first.
        let snapshot = self.tree().read(&model::services_path()).unwrap_or(json!({}));
        let epoch = now_ms();
        if let Err(e) = self.apply_services(new_config, proposed, epoch) {
            warn!("deployment {}: apply failed: {}", deployment.id, e);
            return Ok(DeploymentOutcome::failed(
                DeploymentResult::FailedNoStateChange,
                MergeFailure::Apply(e.to_string()),
            ));
        }
        self.record_fingerprint(deployment, epoch);
        self.tree().settle().await;

        // 6. Drive affected services.
        self.drive_changes(&changes);
        let unsettled = self.await_settlement(&changes, deployment.deployment_timeout).await;

        if unsettled.is_empty() {
            for (name, change) in &changes {
                if *change == ServiceChange::Removed {
                    self.reap_service(name);
                }
            }
            self.tree().settle().await;
            info!("deployment {}: successful", deployment.id);
            return Ok(DeploymentOutcome::success());
        }

        warn!(
            "deployment {}: services failed to settle: {:?}",
            deployment.id, unsettled
        );

        // 7. Failure handling.
        match deployment.failure_policy {
            FailurePolicy::DoNothing => Ok(DeploymentOutcome::failed(
                DeploymentResult::FailedNoStateChange,
                MergeFailure::ServicesUnsettled(unsettled),
            )),
            FailurePolicy::Rollback => {
                self.rollback(deployment, snapshot).await;
                Ok(DeploymentOutcome::failed(
                    DeploymentResult::FailedRolledBack,
                    MergeFailure::ServicesUnsettled(unsettled),
                ))
            }
        }
    }

    fn current_services(&self) -> Map<String, Value> {
        match self.tree().read(&model::services_path()) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Ask each service with changed parameters and a registered validator
    async fn broadcast_validation(
        &self,
        deployment: &Deployment,
        current: &Map<String, Value>,
        proposed: &Map<String, Value>,
    ) -> Vec<ValidationRejection> {
        let mut rejections = Vec::new();

        for (name, new_body) in proposed {
            let Some(old_body) = current.get(name) else {
                continue;
            };
            let proposed_params = effective_params(new_body);
            if effective_params(old_body) == proposed_params {
                continue;
            }
            let Some(validator) = self.validators().get(name) else {
                continue;
            };

            debug!(
                "deployment {}: validating parameter change with {}",
                deployment.id, name
            );
            let verdict = future::or(
                async { Some(validator.validate(&proposed_params).await) },
                async {
                    smol::Timer::after(deployment.notify_timeout).await;
                    None
                },
            )
            .await;

            match verdict {
                Some(Verdict::Valid) => {}
                Some(Verdict::Invalid(message)) => rejections.push(ValidationRejection {
                    service: name.clone(),
                    verdict: RejectionKind::Invalid(message),
                }),
                None => rejections.push(ValidationRejection {
                    service: name.clone(),
                    verdict: RejectionKind::TimedOut,
                }),
            }
        }

        rejections
    }

    /// Merge the proposed configuration into the tree in one epoch
    ///
    /// `_State` topics are carried over so the replace-merge does not erase
    /// the observable state of retained services.
    fn apply_services(
        &self,
        new_config: &Value,
        proposed: &Map<String, Value>,
        epoch: u64,
    ) -> Result<()> {
        let current = self.current_services();
        let mut effective = proposed.clone();
        for (name, body) in effective.iter_mut() {
            if let (Some(state), Value::Object(map)) = (
                current
                    .get(name)
                    .and_then(|old| old.get(model::STATE_TOPIC)),
                body,
            ) {
                map.insert(model::STATE_TOPIC.to_string(), state.clone());
            }
        }

        self.tree().merge_value(
            &model::services_path(),
            &Value::Object(effective),
            MergeBehavior::Replace,
            epoch,
        )?;

        // Non-service top-level keys (global setenv and friends) merge softly.
        if let Value::Object(root) = new_config {
            for (key, value) in root {
                if key == "services" {
                    continue;
                }
                self.tree().merge_value(
                    &TopicPath::from_segments([key.as_str()]),
                    value,
                    MergeBehavior::Merge,
                    epoch,
                )?;
            }
        }
        Ok(())
    }

    fn record_fingerprint(&self, deployment: &Deployment, epoch: u64) {
        let base = TopicPath::from_segments(["deployment"]);
        let _ = self
            .tree()
            .write(&base.child("id"), json!(deployment.id.to_string()), epoch);
        let _ = self
            .tree()
            .write(&base.child("timestamp"), json!(deployment.timestamp), epoch);
    }

    /// Issue the state changes each classification calls for
    fn drive_changes(&self, changes: &BTreeMap<String, ServiceChange>) {
        for (name, change) in changes {
            match change {
                ServiceChange::Added => {
                    // A pre-existing worker (re-added service, or one the
                    // subtree watcher spawned mid-apply against a partial
                    // definition) reruns its lifecycle against the committed
                    // definition.
                    if !self.ensure_service(name) {
                        let _ = self.request_reinstall(name);
                    }
                }
                ServiceChange::LifecycleChanged => {
                    let _ = self.request_reinstall(name);
                }
                ServiceChange::DependenciesChanged => {
                    let _ = self.request_restart(name);
                }
                ServiceChange::Removed => {
                    let _ = self.request_stop(name);
                }
                ServiceChange::ParametersChanged | ServiceChange::Unchanged => {}
            }
        }
    }

    /// Wait for every affected service to reach its target state
    ///
    /// Still-present services settle at RUNNING (or FINISHED for transient
    /// runs); removed services settle at FINISHED. BROKEN or a deadline
    /// overrun counts as unsettled.
    async fn await_settlement(
        &self,
        changes: &BTreeMap<String, ServiceChange>,
        timeout: Duration,
    ) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        let mut unsettled = Vec::new();

        for (name, change) in changes {
            let settled_pred: fn(ServiceState) -> bool = match change {
                ServiceChange::Added
                | ServiceChange::LifecycleChanged
                | ServiceChange::DependenciesChanged => |s| {
                    matches!(
                        s,
                        ServiceState::Running | ServiceState::Finished | ServiceState::Broken
                    )
                },
                ServiceChange::Removed => |s| s.is_terminal(),
                ServiceChange::ParametersChanged | ServiceChange::Unchanged => continue,
            };

            if self.service_state(name).is_none() {
                // Never materialized (e.g. removed before its worker spawned).
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.wait_for_state(name, settled_pred, remaining).await {
                Some(ServiceState::Broken) => unsettled.push(name.clone()),
                Some(_) => {}
                None => unsettled.push(name.clone()),
            }
        }

        unsettled
    }

    /// Re-apply the pre-merge snapshot (validation skipped by construction)
    async fn rollback(&self, deployment: &Deployment, snapshot: Value) {
        info!("deployment {}: rolling back", deployment.id);
        let current = self.current_services();
        let pre_image = snapshot.as_object().cloned().unwrap_or_default();
        let changes = classify_services(&current, &pre_image);

        let epoch = now_ms();
        let wrapped = json!({ "services": snapshot });
        if let Err(e) = self.apply_services(&wrapped, &pre_image, epoch) {
            warn!("deployment {}: rollback apply failed: {}", deployment.id, e);
            return;
        }
        self.tree().settle().await;

        self.drive_changes(&changes);
        let unsettled = self
            .await_settlement(&changes, deployment.deployment_timeout)
            .await;
        if unsettled.is_empty() {
            for (name, change) in &changes {
                if *change == ServiceChange::Removed {
                    self.reap_service(name);
                }
            }
            info!("deployment {}: rollback complete", deployment.id);
        } else {
            warn!(
                "deployment {}: rollback left services unsettled: {:?}",
                deployment.id, unsettled
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_added_removed() {
        let mut current = Map::new();
        current.insert("old".to_string(), json!({"lifecycle": {"run": "a"}}));
        let mut proposed = Map::new();
        proposed.insert("new".to_string(), json!({"lifecycle": {"run": "b"}}));

        let changes = classify_services(&current, &proposed);
        assert_eq!(changes["old"], ServiceChange::Removed);
        assert_eq!(changes["new"], ServiceChange::Added);
    }

    #[test]
    fn test_classify_lifecycle_beats_dependencies() {
        let old = json!({"lifecycle": {"run": "a"}, "dependencies": ["x"]});
        let new = json!({"lifecycle": {"run": "b"}, "dependencies": ["y"]});
        assert_eq!(classify_update(&old, &new), ServiceChange::LifecycleChanged);
    }

    #[test]
    fn test_classify_dependency_only_change() {
        let old = json!({"lifecycle": {"run": "a"}, "dependencies": ["x"]});
        let new = json!({"lifecycle": {"run": "a"}, "dependencies": ["x:SOFT"]});
        assert_eq!(
            classify_update(&old, &new),
            ServiceChange::DependenciesChanged
        );
    }

    #[test]
    fn test_classify_parameters_only_change() {
        let old = json!({"lifecycle": {"run": "a"}, "configuration": {"k": "v1"}});
        let new = json!({"lifecycle": {"run": "a"}, "configuration": {"k": "v2"}});
        assert_eq!(classify_update(&old, &new), ServiceChange::ParametersChanged);
    }

    #[test]
    fn test_classify_parameters_alias() {
        // `parameters` and `configuration` are aliases of the same subtree.
        let old = json!({"parameters": {"k": "v"}});
        let new = json!({"configuration": {"k": "v"}});
        assert_eq!(classify_update(&old, &new), ServiceChange::Unchanged);
    }

    #[test]
    fn test_classify_ignores_state_topic() {
        let old = json!({"lifecycle": {"run": "a"}, "_State": "RUNNING"});
        let new = json!({"lifecycle": {"run": "a"}});
        assert_eq!(classify_update(&old, &new), ServiceChange::Unchanged);
    }

    #[test]
    fn test_classify_missing_dependencies_equals_empty() {
        let old = json!({"lifecycle": {"run": "a"}});
        let new = json!({"lifecycle": {"run": "a"}, "dependencies": []});
        assert_eq!(classify_update(&old, &new), ServiceChange::Unchanged);
    }

    #[test]
    fn test_classify_version_change_is_lifecycle() {
        let old = json!({"version": "1.0"});
        let new = json!({"version": "1.1"});
        assert_eq!(classify_update(&old, &new), ServiceChange::LifecycleChanged);
    }
}
