//! The supervisor
//!
//! Owns one worker per declared service, the shared state table that
//! dependency gating reads, and the global state-event fan-out. Launch
//! starts services in dependency order; shutdown walks the order in reverse
//! with a bounded wait per service.

use crate::builtin::BuiltinRegistry;
use crate::graph::{DependencyKind, DependencySpec};
use crate::model::{self, RootLayout, MAIN_SERVICE};
use crate::service::ServiceHandle;
use crate::state::{DesiredState, ServiceState, StateEvent};
use crate::validator::ValidatorRegistry;
use crate::{Error, Result};
use config_tree::{now_ms, ConfigStore, ConfigTree};
use futures_lite::future;
use serde_json::json;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Global state listener; receives every `(service, old, new)` transition
pub type StateListener = Arc<dyn Fn(&StateEvent) + Send + Sync>;

struct StateWaiter {
    service: String,
    pred: Box<dyn Fn(ServiceState) -> bool + Send + Sync>,
    tx: async_channel::Sender<ServiceState>,
}

/// State shared between the supervisor and its service workers
pub(crate) struct SupervisorShared {
    pub tree: ConfigTree,
    pub layout: RootLayout,
    /// Per-process unique token exported to steps as `EVERGREEN_UID`
    pub uid: String,
    pub builtins: BuiltinRegistry,
    pub validators: ValidatorRegistry,
    pub states: RwLock<HashMap<String, ServiceState>>,
    pub desired: RwLock<HashMap<String, DesiredState>>,
    pub gates: RwLock<HashMap<String, async_channel::Sender<StateEvent>>>,
    /// Pid of each service's live run process, for the force-kill path
    pub run_pids: RwLock<HashMap<String, u32>>,
    listeners: Mutex<Vec<StateListener>>,
    waiters: Mutex<Vec<StateWaiter>>,
    /// Serializes listener dispatch so every observer sees one total order
    dispatch_lock: Mutex<()>,
}

impl SupervisorShared {
    /// Current state of a service, if it exists
    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.states.read().unwrap().get(name).copied()
    }

    /// The state a service is being driven towards (defaults to RUNNING)
    pub fn desired_of(&self, name: &str) -> DesiredState {
        self.desired
            .read()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(DesiredState::Running)
    }

    pub fn set_desired(&self, name: &str, desired: DesiredState) {
        self.desired
            .write()
            .unwrap()
            .insert(name.to_string(), desired);
    }

    /// Gate check: HARD deps running/finished, SOFT deps past their start
    pub fn dependencies_satisfied(&self, deps: &[DependencySpec]) -> bool {
        let states = self.states.read().unwrap();
        deps.iter().all(|dep| match states.get(&dep.name) {
            Some(state) => match dep.kind {
                DependencyKind::Hard => state.satisfies_hard(),
                DependencyKind::Soft => state.satisfies_soft(),
            },
            // An undeclared service can never satisfy a HARD edge; a SOFT
            // edge on a missing service is only an ordering hint.
            None => dep.kind == DependencyKind::Soft,
        })
    }

    pub fn add_listener(&self, listener: StateListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Apply a state transition and broadcast it
    ///
    /// The `_State` topic is updated and listeners run before the worker
    /// attempts its next transition; dispatch serializes through one lock so
    /// all observers see the same order.
    pub fn transition(&self, name: &str, new: ServiceState) {
        let _order = self.dispatch_lock.lock().unwrap();

        let old = {
            let mut states = self.states.write().unwrap();
            let old = states.get(name).copied().unwrap_or(ServiceState::New);
            if old == new {
                return;
            }
            states.insert(name.to_string(), new);
            old
        };

        if let Err(e) = self.tree.write(
            &model::state_topic_path(name),
            json!(new.as_topic_str()),
            now_ms(),
        ) {
            warn!("{}: failed to publish _State: {}", name, e);
        }

        info!("service {} state: {} -> {}", name, old, new);
        let event = StateEvent {
            service: name.to_string(),
            old,
            new,
        };

        let listeners: Vec<StateListener> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!("state listener panicked on {} transition", name);
            }
        }

        for gate in self.gates.read().unwrap().values() {
            let _ = gate.try_send(event.clone());
        }

        let mut waiters = self.waiters.lock().unwrap();
        waiters.retain(|waiter| {
            if waiter.tx.is_closed() {
                return false;
            }
            if waiter.service == name && (waiter.pred)(new) {
                let _ = waiter.tx.try_send(new);
                return false;
            }
            true
        });
    }

    /// Await a service state matching `pred`, up to `timeout`
    pub async fn wait_until<F>(
        &self,
        service: &str,
        pred: F,
        timeout: Duration,
    ) -> Option<ServiceState>
    where
        F: Fn(ServiceState) -> bool + Send + Sync + 'static,
    {
        let pred = Arc::new(pred);
        let (tx, rx) = async_channel::bounded(1);
        self.waiters.lock().unwrap().push(StateWaiter {
            service: service.to_string(),
            pred: Box::new({
                let pred = pred.clone();
                move |state| pred(state)
            }),
            tx,
        });

        // Check after registering so a transition between the check and the
        // registration cannot be missed.
        if let Some(state) = self.state_of(service) {
            if pred(state) {
                return Some(state);
            }
        }

        future::or(async { rx.recv().await.ok() }, async {
            smol::Timer::after(timeout).await;
            None
        })
        .await
    }
}

/// The Evergreen kernel: owns services and orchestrates their lifecycles
pub struct Supervisor {
    shared: Arc<SupervisorShared>,
    services: Arc<Mutex<HashMap<String, ServiceHandle>>>,
    services_watch: Mutex<Option<config_tree::WatchId>>,
    store: Mutex<Option<ConfigStore>>,
    safety: Mutex<Option<Arc<dyn crate::merge::SafetyCheck>>>,
    pub(crate) merge_lock: futures::lock::Mutex<()>,
}

impl Supervisor {
    /// Create a supervisor over a tree and a directory layout
    pub fn new(tree: ConfigTree, layout: RootLayout) -> Self {
        Self {
            shared: Arc::new(SupervisorShared {
                tree,
                layout,
                uid: uuid::Uuid::new_v4().to_string(),
                builtins: BuiltinRegistry::new(),
                validators: ValidatorRegistry::new(),
                states: RwLock::new(HashMap::new()),
                desired: RwLock::new(HashMap::new()),
                gates: RwLock::new(HashMap::new()),
                run_pids: RwLock::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                waiters: Mutex::new(Vec::new()),
                dispatch_lock: Mutex::new(()),
            }),
            services: Arc::new(Mutex::new(HashMap::new())),
            services_watch: Mutex::new(None),
            store: Mutex::new(None),
            safety: Mutex::new(None),
            merge_lock: futures::lock::Mutex::new(()),
        }
    }

    /// Install the safety-policy oracle consulted by gated deployments
    pub fn set_safety_check(&self, check: Arc<dyn crate::merge::SafetyCheck>) {
        *self.safety.lock().unwrap() = Some(check);
    }

    pub(crate) fn safety_check(&self) -> Option<Arc<dyn crate::merge::SafetyCheck>> {
        self.safety.lock().unwrap().clone()
    }

    /// The configuration tree
    pub fn tree(&self) -> &ConfigTree {
        &self.shared.tree
    }

    /// Registry of in-process builtin services
    pub fn builtins(&self) -> &BuiltinRegistry {
        &self.shared.builtins
    }

    /// Registry of per-service configuration validators
    pub fn validators(&self) -> &ValidatorRegistry {
        &self.shared.validators
    }

    /// Attach the durable store released again at shutdown
    pub fn attach_store(&self, store: ConfigStore) {
        *self.store.lock().unwrap() = Some(store);
    }

    /// Register a global state listener (registration is append-only)
    pub fn add_state_listener<F>(&self, listener: F)
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        self.shared.add_listener(Arc::new(listener));
    }

    /// Current state of a service
    pub fn service_state(&self, name: &str) -> Option<ServiceState> {
        self.shared.state_of(name)
    }

    /// Names of currently supervised services
    pub fn service_names(&self) -> Vec<String> {
        self.services.lock().unwrap().keys().cloned().collect()
    }

    /// Await a service state matching `pred`, up to `timeout`
    pub async fn wait_for_state<F>(
        &self,
        service: &str,
        pred: F,
        timeout: Duration,
    ) -> Option<ServiceState>
    where
        F: Fn(ServiceState) -> bool + Send + Sync + 'static,
    {
        self.shared.wait_until(service, pred, timeout).await
    }

    /// Validate the configuration and start every declared service
    ///
    /// Fails fast when the root service `main` is missing or the dependency
    /// graph has a cycle. Returns the startup order used.
    pub fn launch(&self) -> Result<Vec<String>> {
        if model::load_definition(&self.shared.tree, MAIN_SERVICE)?.is_none() {
            return Err(Error::MissingRootService);
        }

        let graph = model::build_graph(&self.shared.tree)?;
        let order = graph.ordered_services()?;
        info!("launching services in order: {:?}", order);

        for name in &order {
            // Graph nodes without a subtree are undeclared dependency
            // targets; they gate their dependents but never run.
            if model::load_definition(&self.shared.tree, name)?.is_some() {
                self.ensure_service(name);
            }
        }

        // A service lives as long as its subtree: whenever one appears, a
        // worker appears with it.
        let shared = self.shared.clone();
        let services = self.services.clone();
        let watch = self.shared.tree.subscribe(model::services_path(), move |event| {
            if event.kind == config_tree::WatchEventKind::ChildAdded {
                if let Some(name) = event.path.name() {
                    create_service(&shared, &services, name);
                }
            }
        });
        *self.services_watch.lock().unwrap() = Some(watch);

        Ok(order)
    }

    /// Create the worker for a declared service if it does not exist yet
    ///
    /// Returns `true` when this call created the worker.
    pub(crate) fn ensure_service(&self, name: &str) -> bool {
        create_service(&self.shared, &self.services, name)
    }

    /// Drop a service's worker and all of its bookkeeping
    pub(crate) fn reap_service(&self, name: &str) {
        if let Some(handle) = self.services.lock().unwrap().remove(name) {
            handle.cancel();
        }
        self.shared.gates.write().unwrap().remove(name);
        self.shared.states.write().unwrap().remove(name);
        self.shared.desired.write().unwrap().remove(name);
        self.shared.run_pids.write().unwrap().remove(name);
    }

    /// Ask a service to stop
    pub fn request_stop(&self, name: &str) -> Result<()> {
        self.with_service(name, ServiceHandle::request_stop)
    }

    /// Ask a service to stop and start again
    pub fn request_restart(&self, name: &str) -> Result<()> {
        self.with_service(name, ServiceHandle::request_restart)
    }

    /// Ask a service to rerun its whole lifecycle from `install`
    pub fn request_reinstall(&self, name: &str) -> Result<()> {
        self.with_service(name, ServiceHandle::request_reinstall)
    }

    fn with_service(&self, name: &str, f: impl Fn(&ServiceHandle)) -> Result<()> {
        let services = self.services.lock().unwrap();
        let handle = services
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        f(handle);
        Ok(())
    }

    /// Stop every service in reverse dependency order
    ///
    /// Each service gets a bounded wait for a terminal state; a service that
    /// overruns has its run process force-killed and its worker cancelled.
    /// Finally the durable store is compacted and released.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        info!("supervisor shutdown requested");

        let names = self.service_names();
        for name in &names {
            self.shared.set_desired(name, DesiredState::Finished);
        }

        let mut order = match model::build_graph(&self.shared.tree)
            .and_then(|g| g.ordered_services())
        {
            Ok(order) => order,
            Err(e) => {
                warn!("shutdown falling back to name order: {}", e);
                let mut sorted = names.clone();
                sorted.sort();
                sorted
            }
        };
        order.retain(|name| names.contains(name));

        let deadline = Instant::now() + timeout;
        for name in order.iter().rev() {
            if self.shared.state_of(name).map(|s| s.is_terminal()).unwrap_or(true) {
                continue;
            }
            let _ = self.request_stop(name);

            let remaining = deadline.saturating_duration_since(Instant::now());
            let reached = self
                .shared
                .wait_until(name, |s| s.is_terminal(), remaining)
                .await;

            if reached.is_none() {
                warn!("{}: did not stop within the deadline, force-killing", name);
                let pid = self.shared.run_pids.read().unwrap().get(name).copied();
                if let Some(pid) = pid {
                    force_kill(pid);
                }
                if let Some(handle) = self.services.lock().unwrap().get(name) {
                    handle.cancel();
                }
                self.shared.transition(name, ServiceState::Finished);
            }
        }

        if let Some(watch) = self.services_watch.lock().unwrap().take() {
            self.shared.tree.unsubscribe(watch);
        }
        if let Some(store) = self.store.lock().unwrap().take() {
            store.compact(&self.shared.tree)?;
        }
        self.shared.tree.detach_log();

        info!("supervisor shutdown complete");
        Ok(())
    }
}

/// Spawn a worker for `name` unless one exists already
///
/// Returns `true` when a new worker was spawned.
fn create_service(
    shared: &Arc<SupervisorShared>,
    services: &Arc<Mutex<HashMap<String, ServiceHandle>>>,
    name: &str,
) -> bool {
    let mut services = services.lock().unwrap();
    if services.contains_key(name) {
        return false;
    }
    let _ = shared.tree.write(
        &model::state_topic_path(name),
        json!(ServiceState::New.as_topic_str()),
        now_ms(),
    );
    services.insert(
        name.to_string(),
        ServiceHandle::spawn(shared.clone(), name),
    );
    true
}

/// SIGKILL a process by pid (last resort when a worker is cancelled)
fn force_kill(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!("force-kill of pid {} failed: {}", pid, e);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_for_tests() -> Arc<SupervisorShared> {
        let sup = Supervisor::new(ConfigTree::new(), RootLayout::new("/tmp/evergreen-test"));
        sup.shared.clone()
    }

    #[smol_potat::test]
    async fn test_transition_dispatches_in_order() {
        let shared = shared_for_tests();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        shared.add_listener(Arc::new(move |event: &StateEvent| {
            seen2
                .lock()
                .unwrap()
                .push((event.service.clone(), event.old, event.new));
        }));

        shared.states.write().unwrap().insert("a".to_string(), ServiceState::New);
        shared.transition("a", ServiceState::Installed);
        shared.transition("a", ServiceState::Starting);
        // Same-state transition is swallowed.
        shared.transition("a", ServiceState::Starting);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("a".to_string(), ServiceState::New, ServiceState::Installed),
                ("a".to_string(), ServiceState::Installed, ServiceState::Starting),
            ]
        );
    }

    #[smol_potat::test]
    async fn test_listener_panic_is_contained() {
        let shared = shared_for_tests();
        shared.add_listener(Arc::new(|_event: &StateEvent| panic!("listener bug")));
        let seen = Arc::new(Mutex::new(0u32));
        let seen2 = seen.clone();
        shared.add_listener(Arc::new(move |_event: &StateEvent| {
            *seen2.lock().unwrap() += 1;
        }));

        shared.states.write().unwrap().insert("a".to_string(), ServiceState::New);
        shared.transition("a", ServiceState::Installed);
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[smol_potat::test]
    async fn test_wait_until_immediate_and_deferred() {
        let shared = shared_for_tests();
        shared
            .states
            .write()
            .unwrap()
            .insert("a".to_string(), ServiceState::Running);

        let state = shared
            .wait_until("a", |s| s == ServiceState::Running, Duration::from_secs(1))
            .await;
        assert_eq!(state, Some(ServiceState::Running));

        let shared2 = shared.clone();
        let waiter = smol::spawn(async move {
            shared2
                .wait_until("a", |s| s.is_terminal(), Duration::from_secs(5))
                .await
        });
        smol::Timer::after(Duration::from_millis(20)).await;
        shared.transition("a", ServiceState::Stopping);
        shared.transition("a", ServiceState::Finished);
        assert_eq!(waiter.await, Some(ServiceState::Finished));
    }

    #[smol_potat::test]
    async fn test_wait_until_times_out() {
        let shared = shared_for_tests();
        shared
            .states
            .write()
            .unwrap()
            .insert("a".to_string(), ServiceState::New);
        let state = shared
            .wait_until("a", |s| s == ServiceState::Running, Duration::from_millis(50))
            .await;
        assert_eq!(state, None);
    }

    #[smol_potat::test]
    async fn test_dependencies_satisfied() {
        let shared = shared_for_tests();
        shared
            .states
            .write()
            .unwrap()
            .insert("b".to_string(), ServiceState::Running);
        shared
            .states
            .write()
            .unwrap()
            .insert("c".to_string(), ServiceState::Errored);

        let hard_ok = vec![DependencySpec::parse("b").unwrap()];
        let hard_down = vec![DependencySpec::parse("c").unwrap()];
        let soft_down = vec![DependencySpec::parse("c:SOFT").unwrap()];
        let hard_missing = vec![DependencySpec::parse("ghost").unwrap()];
        let soft_missing = vec![DependencySpec::parse("ghost:SOFT").unwrap()];

        assert!(shared.dependencies_satisfied(&hard_ok));
        assert!(!shared.dependencies_satisfied(&hard_down));
        assert!(shared.dependencies_satisfied(&soft_down));
        assert!(!shared.dependencies_satisfied(&hard_missing));
        assert!(shared.dependencies_satisfied(&soft_missing));
    }
}
