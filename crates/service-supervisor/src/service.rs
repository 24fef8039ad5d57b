//! Per-service lifecycle state machine
//!
//! One worker task per service drives the state machine; transitions inside
//! a service are strictly serial while services run in parallel. The worker
//! suspends on process exit, the dependency gate, the retry backoff timer,
//! and its command channel.

use crate::model::{self, ServiceDefinition, ServiceKind};
use crate::state::{DesiredState, ServiceState, StateEvent};
use crate::supervisor::SupervisorShared;
use crate::{
    DEFAULT_SHUTDOWN_STEP_TIMEOUT, DEFAULT_STARTUP_TIMEOUT, DEFAULT_STEP_TIMEOUT,
    MAX_INSTALL_ATTEMPTS, MAX_STARTUP_ATTEMPTS, RETRY_BACKOFF_BASE, RETRY_BACKOFF_CAP,
};
use futures::StreamExt;
use futures_lite::future;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use step_runner::{
    launch_step, run_step, ChildHandle, LaunchedStep, ProcessEventType, ProcessHandle,
    StepContext, StepOutcome, StepSpec, KILL_GRACE,
};
use tracing::{debug, info, warn};

/// Requests accepted by a service worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceCommand {
    /// Stop and stay stopped
    Stop,
    /// Stop, re-gate on dependencies, start again
    Restart,
    /// Stop and run the whole lifecycle from `install`
    Reinstall,
}

/// Handle to a supervised service
///
/// Dropping the handle cancels the worker task; the supervisor holds one
/// handle per declared service.
pub struct ServiceHandle {
    name: String,
    cmd_tx: async_channel::Sender<ServiceCommand>,
    task: Mutex<Option<smol::Task<()>>>,
    sup: Arc<SupervisorShared>,
}

impl ServiceHandle {
    pub(crate) fn spawn(sup: Arc<SupervisorShared>, name: &str) -> Self {
        let (cmd_tx, cmd_rx) = async_channel::unbounded();
        let (gate_tx, gate_rx) = async_channel::unbounded();

        sup.states
            .write()
            .unwrap()
            .insert(name.to_string(), ServiceState::New);
        sup.gates.write().unwrap().insert(name.to_string(), gate_tx);

        let task = smol::spawn(run_worker(sup.clone(), name.to_string(), cmd_rx, gate_rx));

        Self {
            name: name.to_string(),
            cmd_tx,
            task: Mutex::new(Some(task)),
            sup,
        }
    }

    /// The service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServiceState {
        self.sup.state_of(&self.name).unwrap_or(ServiceState::New)
    }

    /// Ask the service to stop (`shutdown` step, then FINISHED)
    pub fn request_stop(&self) {
        let _ = self.cmd_tx.try_send(ServiceCommand::Stop);
    }

    /// Ask the service to stop and start again without reinstalling
    pub fn request_restart(&self) {
        let _ = self.cmd_tx.try_send(ServiceCommand::Restart);
    }

    /// Ask the service to stop and rerun the whole lifecycle from `install`
    pub fn request_reinstall(&self) {
        let _ = self.cmd_tx.try_send(ServiceCommand::Reinstall);
    }

    /// Cancel the worker task outright (force-kill path)
    pub(crate) fn cancel(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            drop(task);
        }
    }
}

/// Which lifecycle phase put the service into ERRORED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorPhase {
    Install,
    Start,
}

/// Exponential retry backoff: base 1s, doubling, capped at 30s
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = RETRY_BACKOFF_BASE * 2u32.saturating_pow(exp);
    delay.min(RETRY_BACKOFF_CAP)
}

enum StepResult {
    Success,
    Failure(String),
}

enum Gate {
    Ready,
    Command(ServiceCommand),
    Closed,
}

enum RunEnd {
    /// The run step finished; `true` for a clean exit
    Exited(bool),
    Command(ServiceCommand),
    /// A HARD dependency left the running states
    DepLost(String),
    Closed,
}

enum SleepEnd {
    Elapsed,
    Command(ServiceCommand),
    Closed,
}

pub(crate) async fn run_worker(
    sup: Arc<SupervisorShared>,
    name: String,
    cmd_rx: async_channel::Receiver<ServiceCommand>,
    gate_rx: async_channel::Receiver<StateEvent>,
) {
    let mut install_errors: u32 = 0;
    let mut start_errors: u32 = 0;
    let mut errored_phase = ErrorPhase::Install;

    loop {
        let state = sup.state_of(&name).unwrap_or(ServiceState::New);

        // Terminal states park until an explicit request arrives. A changed
        // configuration reaches a BROKEN service as a reinstall request.
        if state.is_terminal() {
            match cmd_rx.recv().await {
                Ok(ServiceCommand::Reinstall) => {
                    install_errors = 0;
                    start_errors = 0;
                    sup.transition(&name, ServiceState::New);
                }
                Ok(ServiceCommand::Restart) if state == ServiceState::Finished => {
                    start_errors = 0;
                    sup.transition(&name, ServiceState::Installed);
                }
                Ok(_) => {}
                Err(_) => break,
            }
            continue;
        }

        let def = match model::load_definition(&sup.tree, &name) {
            Ok(Some(def)) => def,
            Ok(None) => {
                // The service's subtree is gone; wind down.
                sup.transition(&name, ServiceState::Finished);
                continue;
            }
            Err(e) => {
                warn!("{}: definition no longer parses: {}", name, e);
                sup.transition(&name, ServiceState::Broken);
                continue;
            }
        };

        if sup.desired_of(&name) == DesiredState::Finished {
            stop_to(&sup, &name, &def, ServiceState::Finished, None).await;
            continue;
        }

        match state {
            ServiceState::New => {
                if let Err(e) = std::fs::create_dir_all(sup.layout.work_dir(&name)) {
                    warn!("{}: cannot create work dir: {}", name, e);
                }
                match run_configured_step(
                    &sup,
                    &name,
                    &def,
                    "install",
                    def.lifecycle.install.as_ref(),
                    DEFAULT_STEP_TIMEOUT,
                )
                .await
                {
                    StepResult::Success => {
                        sup.transition(&name, ServiceState::Installed);
                    }
                    StepResult::Failure(cause) => {
                        install_errors += 1;
                        errored_phase = ErrorPhase::Install;
                        warn!(
                            "{}: install failed (attempt {}): {}",
                            name, install_errors, cause
                        );
                        sup.transition(&name, ServiceState::Errored);
                    }
                }
            }

            ServiceState::Installed => {
                match wait_for_dependencies(&sup, &name, &def, &cmd_rx, &gate_rx).await {
                    Gate::Ready => {
                        sup.transition(&name, ServiceState::Starting);
                    }
                    Gate::Command(ServiceCommand::Stop) => {
                        stop_to(&sup, &name, &def, ServiceState::Finished, None).await;
                    }
                    Gate::Command(ServiceCommand::Reinstall) => {
                        install_errors = 0;
                        start_errors = 0;
                        stop_to(&sup, &name, &def, ServiceState::New, None).await;
                    }
                    Gate::Command(ServiceCommand::Restart) => {}
                    Gate::Closed => break,
                }
            }

            ServiceState::Starting => {
                match run_configured_step(
                    &sup,
                    &name,
                    &def,
                    "startup",
                    def.lifecycle.startup.as_ref(),
                    DEFAULT_STARTUP_TIMEOUT,
                )
                .await
                {
                    StepResult::Success => {
                        install_errors = 0;
                        start_errors = 0;
                        sup.transition(&name, ServiceState::Running);
                    }
                    StepResult::Failure(cause) => {
                        start_errors += 1;
                        errored_phase = ErrorPhase::Start;
                        warn!(
                            "{}: startup failed (attempt {}): {}",
                            name, start_errors, cause
                        );
                        sup.transition(&name, ServiceState::Errored);
                    }
                }
            }

            ServiceState::Running => {
                let (end, run_handle) =
                    run_phase(&sup, &name, &def, &cmd_rx, &gate_rx).await;
                match end {
                    RunEnd::Exited(true) => {
                        info!("{}: run step completed", name);
                        sup.transition(&name, ServiceState::Finished);
                    }
                    RunEnd::Exited(false) => {
                        start_errors += 1;
                        errored_phase = ErrorPhase::Start;
                        warn!("{}: run step failed (attempt {})", name, start_errors);
                        sup.transition(&name, ServiceState::Errored);
                    }
                    RunEnd::Command(ServiceCommand::Stop) => {
                        stop_to(&sup, &name, &def, ServiceState::Finished, run_handle).await;
                    }
                    RunEnd::Command(ServiceCommand::Restart) => {
                        stop_to(&sup, &name, &def, ServiceState::Installed, run_handle).await;
                    }
                    RunEnd::Command(ServiceCommand::Reinstall) => {
                        install_errors = 0;
                        start_errors = 0;
                        stop_to(&sup, &name, &def, ServiceState::New, run_handle).await;
                    }
                    RunEnd::DepLost(dep) => {
                        info!("{}: hard dependency {} left running, restarting", name, dep);
                        stop_to(&sup, &name, &def, ServiceState::Installed, run_handle).await;
                    }
                    RunEnd::Closed => {
                        stop_to(&sup, &name, &def, ServiceState::Finished, run_handle).await;
                        sup.run_pids.write().unwrap().remove(&name);
                        break;
                    }
                }
                sup.run_pids.write().unwrap().remove(&name);
            }

            ServiceState::Errored => {
                if let Some(spec) = def.lifecycle.recover.as_ref() {
                    // Best effort; a failing recover step never escalates.
                    if let StepResult::Failure(cause) = run_configured_step(
                        &sup,
                        &name,
                        &def,
                        "recover",
                        Some(spec),
                        DEFAULT_STEP_TIMEOUT,
                    )
                    .await
                    {
                        debug!("{}: recover step failed: {}", name, cause);
                    }
                }

                let (attempts, cap) = match errored_phase {
                    ErrorPhase::Install => (install_errors, MAX_INSTALL_ATTEMPTS),
                    ErrorPhase::Start => (start_errors, MAX_STARTUP_ATTEMPTS),
                };
                if attempts >= cap {
                    warn!("{}: retries exhausted after {} attempts", name, attempts);
                    sup.transition(&name, ServiceState::Broken);
                    continue;
                }

                let delay = backoff_delay(attempts);
                debug!("{}: retrying in {:?}", name, delay);
                let retry_target = match errored_phase {
                    ErrorPhase::Install => ServiceState::New,
                    ErrorPhase::Start => ServiceState::Installed,
                };
                match sleep_or_command(delay, &cmd_rx).await {
                    SleepEnd::Elapsed => sup.transition(&name, retry_target),
                    SleepEnd::Command(ServiceCommand::Stop) => {
                        stop_to(&sup, &name, &def, ServiceState::Finished, None).await;
                    }
                    SleepEnd::Command(ServiceCommand::Reinstall) => {
                        install_errors = 0;
                        start_errors = 0;
                        sup.transition(&name, ServiceState::New);
                    }
                    SleepEnd::Command(ServiceCommand::Restart) => {
                        sup.transition(&name, retry_target);
                    }
                    SleepEnd::Closed => break,
                }
            }

            // Stopping is only ever set inside stop_to; Broken and Finished
            // are handled by the terminal branch above.
            ServiceState::Stopping | ServiceState::Broken | ServiceState::Finished => {
                sup.transition(&name, ServiceState::Finished);
            }
        }
    }

    debug!("{}: worker exited", name);
}

/// Run one configured step to completion, mapping its outcome
async fn run_configured_step(
    sup: &Arc<SupervisorShared>,
    name: &str,
    def: &ServiceDefinition,
    step_name: &str,
    spec: Option<&StepSpec>,
    default_timeout: Duration,
) -> StepResult {
    if def.kind == ServiceKind::Builtin {
        return run_builtin_step(sup, name, step_name).await;
    }
    let Some(spec) = spec else {
        return StepResult::Success;
    };

    let spec = prepare_spec(sup, def, name, spec);
    let env = build_env(sup, def);
    let cwd = sup.layout.work_dir(name);
    let ctx = StepContext {
        service: name,
        step: step_name,
    };

    match run_step(ctx, &spec, &env, Some(cwd.as_path()), default_timeout).await {
        Ok(outcome) if outcome.success() => StepResult::Success,
        Ok(StepOutcome::TimedOut) => StepResult::Failure("deadline exceeded".to_string()),
        Ok(StepOutcome::Completed(status)) => {
            let cause = if status.terminated_by_signal() {
                "terminated by signal".to_string()
            } else {
                format!("exit code {:?}", status.code)
            };
            StepResult::Failure(cause)
        }
        Ok(StepOutcome::Skipped) => StepResult::Success,
        Err(e) => StepResult::Failure(e.to_string()),
    }
}

/// Drive a builtin's non-run capability by step name
async fn run_builtin_step(
    sup: &Arc<SupervisorShared>,
    name: &str,
    step_name: &str,
) -> StepResult {
    let Some(builtin) = sup.builtins.get(name) else {
        return StepResult::Failure(format!("no builtin registered under '{}'", name));
    };
    let result = match step_name {
        "install" => builtin.install().await,
        "startup" => builtin.startup().await,
        "recover" => Ok(()),
        other => {
            debug!("{}: builtin ignores step '{}'", name, other);
            Ok(())
        }
    };
    match result {
        Ok(()) => StepResult::Success,
        Err(e) => StepResult::Failure(e.to_string()),
    }
}

/// Block until dependencies allow STARTING, or a command arrives
async fn wait_for_dependencies(
    sup: &Arc<SupervisorShared>,
    name: &str,
    def: &ServiceDefinition,
    cmd_rx: &async_channel::Receiver<ServiceCommand>,
    gate_rx: &async_channel::Receiver<StateEvent>,
) -> Gate {
    let deps = match def.parsed_dependencies() {
        Ok(deps) => deps,
        Err(e) => {
            warn!("{}: ignoring unparseable dependencies: {}", name, e);
            return Gate::Ready;
        }
    };

    loop {
        if sup.dependencies_satisfied(&deps) {
            return Gate::Ready;
        }

        enum Sel {
            Cmd(Result<ServiceCommand, async_channel::RecvError>),
            Gate(Result<StateEvent, async_channel::RecvError>),
        }

        let sel = future::or(
            async { Sel::Cmd(cmd_rx.recv().await) },
            async { Sel::Gate(gate_rx.recv().await) },
        )
        .await;

        match sel {
            Sel::Cmd(Ok(command)) => return Gate::Command(command),
            Sel::Gate(Ok(_)) => continue,
            Sel::Cmd(Err(_)) | Sel::Gate(Err(_)) => return Gate::Closed,
        }
    }
}

/// The RUNNING phase: observe the run step, commands, and dependency health
async fn run_phase(
    sup: &Arc<SupervisorShared>,
    name: &str,
    def: &ServiceDefinition,
    cmd_rx: &async_channel::Receiver<ServiceCommand>,
    gate_rx: &async_channel::Receiver<StateEvent>,
) -> (RunEnd, Option<ChildHandle>) {
    match def.kind {
        ServiceKind::Builtin => run_phase_builtin(sup, name, def, cmd_rx, gate_rx).await,
        ServiceKind::External => run_phase_external(sup, name, def, cmd_rx, gate_rx).await,
    }
}

async fn run_phase_external(
    sup: &Arc<SupervisorShared>,
    name: &str,
    def: &ServiceDefinition,
    cmd_rx: &async_channel::Receiver<ServiceCommand>,
    gate_rx: &async_channel::Receiver<StateEvent>,
) -> (RunEnd, Option<ChildHandle>) {
    let Some(run_spec) = def.lifecycle.run.as_ref() else {
        // No run step: stay RUNNING until told otherwise.
        return (idle_phase(sup, name, def, cmd_rx, gate_rx).await, None);
    };

    let spec = prepare_spec(sup, def, name, run_spec);
    let env = build_env(sup, def);
    let cwd = sup.layout.work_dir(name);
    let ctx = StepContext {
        service: name,
        step: "run",
    };

    let launched = match launch_step(ctx, &spec, &env, Some(cwd.as_path())) {
        Ok(launched) => launched,
        Err(e) => {
            warn!("{}: run step failed to launch: {}", name, e);
            return (RunEnd::Exited(false), None);
        }
    };

    let (mut events, mut handle) = match launched {
        LaunchedStep::Skipped => return (RunEnd::Exited(true), None),
        LaunchedStep::Running { events, handle } => (events, handle),
    };

    if let Some(pid) = handle.pid() {
        sup.run_pids.write().unwrap().insert(name.to_string(), pid);
    }

    // Drain output in the background so the child never blocks on a full pipe.
    let drain = {
        let name = name.to_string();
        smol::spawn(async move {
            while let Some(event) = events.next().await {
                match event.event_type {
                    ProcessEventType::Stdout => {
                        debug!("{}:run | {}", name, event.data.as_deref().unwrap_or(""));
                    }
                    ProcessEventType::Stderr => {
                        debug!("{}:run ! {}", name, event.data.as_deref().unwrap_or(""));
                    }
                    ProcessEventType::Started { .. } => {}
                }
            }
        })
    };
    drain.detach();

    enum Sel {
        Exit(step_runner::Result<step_runner::ExitStatus>),
        Cmd(Result<ServiceCommand, async_channel::RecvError>),
        Gate(Result<StateEvent, async_channel::RecvError>),
    }

    loop {
        let sel = future::or(
            async { Sel::Exit(handle.wait().await) },
            future::or(
                async { Sel::Cmd(cmd_rx.recv().await) },
                async { Sel::Gate(gate_rx.recv().await) },
            ),
        )
        .await;

        match sel {
            Sel::Exit(Ok(status)) => {
                return (RunEnd::Exited(status.success()), None);
            }
            Sel::Exit(Err(e)) => {
                warn!("{}: failed waiting on run step: {}", name, e);
                return (RunEnd::Exited(false), None);
            }
            Sel::Cmd(Ok(command)) => {
                return (RunEnd::Command(command), Some(handle));
            }
            Sel::Gate(Ok(event)) => {
                if let Some(dep) = hard_dependency_lost(sup, def, &event) {
                    return (RunEnd::DepLost(dep), Some(handle));
                }
            }
            Sel::Cmd(Err(_)) | Sel::Gate(Err(_)) => {
                return (RunEnd::Closed, Some(handle));
            }
        }
    }
}

async fn run_phase_builtin(
    sup: &Arc<SupervisorShared>,
    name: &str,
    def: &ServiceDefinition,
    cmd_rx: &async_channel::Receiver<ServiceCommand>,
    gate_rx: &async_channel::Receiver<StateEvent>,
) -> (RunEnd, Option<ChildHandle>) {
    let Some(builtin) = sup.builtins.get(name) else {
        warn!("{}: no builtin registered", name);
        return (RunEnd::Exited(false), None);
    };

    let mut run = Box::pin(builtin.run());

    enum Sel {
        Done(crate::Result<()>),
        Cmd(Result<ServiceCommand, async_channel::RecvError>),
        Gate(Result<StateEvent, async_channel::RecvError>),
    }

    loop {
        let sel = future::or(
            async { Sel::Done((&mut run).await) },
            future::or(
                async { Sel::Cmd(cmd_rx.recv().await) },
                async { Sel::Gate(gate_rx.recv().await) },
            ),
        )
        .await;

        match sel {
            Sel::Done(Ok(())) => return (RunEnd::Exited(true), None),
            Sel::Done(Err(e)) => {
                warn!("{}: builtin run failed: {}", name, e);
                return (RunEnd::Exited(false), None);
            }
            Sel::Cmd(Ok(command)) => return (RunEnd::Command(command), None),
            Sel::Gate(Ok(event)) => {
                if let Some(dep) = hard_dependency_lost(sup, def, &event) {
                    return (RunEnd::DepLost(dep), None);
                }
            }
            Sel::Cmd(Err(_)) | Sel::Gate(Err(_)) => return (RunEnd::Closed, None),
        }
    }
}

/// RUNNING with nothing to run: only commands and dependency health matter
async fn idle_phase(
    sup: &Arc<SupervisorShared>,
    _name: &str,
    def: &ServiceDefinition,
    cmd_rx: &async_channel::Receiver<ServiceCommand>,
    gate_rx: &async_channel::Receiver<StateEvent>,
) -> RunEnd {
    enum Sel {
        Cmd(Result<ServiceCommand, async_channel::RecvError>),
        Gate(Result<StateEvent, async_channel::RecvError>),
    }

    loop {
        let sel = future::or(
            async { Sel::Cmd(cmd_rx.recv().await) },
            async { Sel::Gate(gate_rx.recv().await) },
        )
        .await;

        match sel {
            Sel::Cmd(Ok(command)) => return RunEnd::Command(command),
            Sel::Gate(Ok(event)) => {
                if let Some(dep) = hard_dependency_lost(sup, def, &event) {
                    return RunEnd::DepLost(dep);
                }
            }
            Sel::Cmd(Err(_)) | Sel::Gate(Err(_)) => return RunEnd::Closed,
        }
    }
}

/// Did this event take a HARD dependency out of the running states?
///
/// The check reads the dependency's *current* state rather than the event
/// payload, so stale queued events cannot force a spurious restart.
fn hard_dependency_lost(
    sup: &Arc<SupervisorShared>,
    def: &ServiceDefinition,
    event: &StateEvent,
) -> Option<String> {
    let deps = def.parsed_dependencies().ok()?;
    let dep = deps
        .iter()
        .find(|d| d.kind == crate::graph::DependencyKind::Hard && d.name == event.service)?;
    let current = sup.state_of(&dep.name)?;
    if current.satisfies_hard() {
        None
    } else {
        Some(dep.name.clone())
    }
}

/// Transition through STOPPING into `target`
///
/// Runs the `shutdown` step (bounded, default 15s), then escalates
/// SIGTERM/SIGKILL on a still-live run process.
async fn stop_to(
    sup: &Arc<SupervisorShared>,
    name: &str,
    def: &ServiceDefinition,
    target: ServiceState,
    run_handle: Option<ChildHandle>,
) {
    sup.transition(name, ServiceState::Stopping);

    match def.kind {
        ServiceKind::External => {
            if let Some(spec) = def.lifecycle.shutdown.as_ref() {
                if let StepResult::Failure(cause) = run_configured_step(
                    sup,
                    name,
                    def,
                    "shutdown",
                    Some(spec),
                    DEFAULT_SHUTDOWN_STEP_TIMEOUT,
                )
                .await
                {
                    warn!("{}: shutdown step failed: {}", name, cause);
                }
            }

            if let Some(mut handle) = run_handle {
                if let Err(e) = handle.terminate().await {
                    debug!("{}: terminate failed (already gone?): {}", name, e);
                }
                let waited = future::or(async { handle.wait().await.ok() }, async {
                    smol::Timer::after(KILL_GRACE).await;
                    None
                })
                .await;
                if waited.is_none() {
                    warn!("{}: run process ignored SIGTERM, killing", name);
                    if let Err(e) = handle.kill().await {
                        warn!("{}: kill failed: {}", name, e);
                    }
                    let _ = handle.wait().await;
                }
            }
        }
        ServiceKind::Builtin => {
            if let Some(builtin) = sup.builtins.get(name) {
                let bounded = future::or(
                    async { builtin.shutdown().await.err() },
                    async {
                        smol::Timer::after(DEFAULT_SHUTDOWN_STEP_TIMEOUT).await;
                        None
                    },
                )
                .await;
                if let Some(e) = bounded {
                    warn!("{}: builtin shutdown failed: {}", name, e);
                }
            }
        }
    }

    sup.transition(name, target);
}

async fn sleep_or_command(
    delay: Duration,
    cmd_rx: &async_channel::Receiver<ServiceCommand>,
) -> SleepEnd {
    future::or(
        async {
            smol::Timer::after(delay).await;
            SleepEnd::Elapsed
        },
        async {
            match cmd_rx.recv().await {
                Ok(command) => SleepEnd::Command(command),
                Err(_) => SleepEnd::Closed,
            }
        },
    )
    .await
}

/// Expand placeholders in a step's script for this service
fn prepare_spec(
    sup: &Arc<SupervisorShared>,
    def: &ServiceDefinition,
    name: &str,
    spec: &StepSpec,
) -> StepSpec {
    let mut prepared = spec.clone();
    prepared.script = model::expand_script(&sup.layout, def, name, &spec.script);
    prepared
}

/// Assemble the environment for a lifecycle step
///
/// Process-global `setenv` from the tree, then service-local `setenv`, with
/// the per-process unique token on top. Step-local `setenv` wins last and is
/// applied by the step runner.
fn build_env(sup: &Arc<SupervisorShared>, def: &ServiceDefinition) -> HashMap<String, String> {
    let mut env = HashMap::new();
    if let Some(Value::Object(map)) = sup.tree.read(&model::global_setenv_path()) {
        for (key, value) in map {
            env.insert(key, env_string(&value));
        }
    }
    env.extend(def.setenv.clone());
    env.insert("EVERGREEN_UID".to_string(), sup.uid.clone());
    env
}

fn env_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn test_env_string() {
        assert_eq!(env_string(&serde_json::json!("plain")), "plain");
        assert_eq!(env_string(&serde_json::json!(5)), "5");
        assert_eq!(env_string(&serde_json::json!(true)), "true");
    }
}
