//! Lifecycle-step specifications and bounded execution
//!
//! A step is a shell script with an optional timeout, extra environment, and
//! a `skipif` predicate. Steps are spawned under `sh -c`; the shell's exit
//! code drives the service state machine.

use crate::command::Command;
use crate::error::{Error, Result};
use crate::event::ProcessEventType;
use crate::process::{ExitStatus, ProcessHandle};
use crate::spawn::{spawn, ProcessEventStream};
use futures::StreamExt;
use futures_lite::future;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL when a deadline expires
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Specification of a single lifecycle step
///
/// Deserializes from either a bare scalar (`run: "script"`) or the map form
/// with `script`, `timeout`, `setenv`, and `skipif` keys; serializes back to
/// the scalar form when only the script is set, so round-tripped
/// configurations compare equal.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawStep")]
pub struct StepSpec {
    /// Shell script text
    pub script: String,
    /// Step deadline in seconds; the caller supplies a default when absent
    pub timeout: Option<u64>,
    /// Step-local environment, merged over the service environment
    #[serde(default)]
    pub setenv: HashMap<String, String>,
    /// Optional predicate; when it holds, the step is skipped as success
    pub skipif: Option<String>,
}

impl StepSpec {
    /// Create a spec from a bare script
    pub fn from_script(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            timeout: None,
            setenv: HashMap::new(),
            skipif: None,
        }
    }

    /// The step deadline, falling back to the supplied default
    pub fn deadline(&self, default: Duration) -> Duration {
        self.timeout.map(Duration::from_secs).unwrap_or(default)
    }
}

impl Serialize for StepSpec {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let raw = if self.timeout.is_none() && self.setenv.is_empty() && self.skipif.is_none() {
            RawStep::Script(self.script.clone())
        } else {
            RawStep::Detailed {
                script: self.script.clone(),
                timeout: self.timeout,
                setenv: self.setenv.clone(),
                skipif: self.skipif.clone(),
            }
        };
        raw.serialize(serializer)
    }
}

/// Serde helper accepting both forms of a step
#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum RawStep {
    Script(String),
    Detailed {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        setenv: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skipif: Option<String>,
    },
}

impl From<RawStep> for StepSpec {
    fn from(raw: RawStep) -> Self {
        match raw {
            RawStep::Script(script) => StepSpec::from_script(script),
            RawStep::Detailed {
                script,
                timeout,
                setenv,
                skipif,
            } => StepSpec {
                script,
                timeout,
                setenv,
                skipif,
            },
        }
    }
}

/// A parsed `skipif` predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipIf {
    /// Skip when the named command is found on `$PATH`
    OnPath(String),
    /// Skip when the path exists
    Exists(PathBuf),
}

impl SkipIf {
    /// Parse a predicate expression
    ///
    /// Supported forms are `onpath <cmd>` and `exists <path>`; anything else
    /// is malformed and must fail the step rather than silently run it.
    pub fn parse(expression: &str) -> Result<Self> {
        let mut parts = expression.split_whitespace();
        let verb = parts.next();
        let operand = parts.next();
        let rest = parts.next();

        match (verb, operand, rest) {
            (Some("onpath"), Some(cmd), None) => Ok(SkipIf::OnPath(cmd.to_string())),
            (Some("exists"), Some(path), None) => Ok(SkipIf::Exists(PathBuf::from(path))),
            _ => Err(Error::MalformedSkipIf {
                expression: expression.to_string(),
            }),
        }
    }

    /// Evaluate the predicate against the current environment
    pub fn evaluate(&self) -> bool {
        match self {
            SkipIf::OnPath(cmd) => std::env::var_os("PATH")
                .map(|path| {
                    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(cmd)))
                })
                .unwrap_or(false),
            SkipIf::Exists(path) => path.exists(),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Outcome of a bounded step execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The process ran to completion within its deadline
    Completed(ExitStatus),
    /// The `skipif` predicate held; the step counts as success
    Skipped,
    /// The deadline expired and the process was terminated
    TimedOut,
}

impl StepOutcome {
    /// Returns true when the outcome counts as a successful step
    pub fn success(&self) -> bool {
        match self {
            StepOutcome::Completed(status) => status.success(),
            StepOutcome::Skipped => true,
            StepOutcome::TimedOut => false,
        }
    }
}

/// Identity of the step being run, for logging
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Owning service name
    pub service: &'a str,
    /// Step name (`install`, `startup`, ...)
    pub step: &'a str,
}

/// A step that has been launched but not yet awaited
pub enum LaunchedStep {
    /// The `skipif` predicate held; nothing was spawned
    Skipped,
    /// The process is running
    Running {
        /// Output event stream
        events: ProcessEventStream,
        /// Control handle
        handle: crate::process::ChildHandle,
    },
}

/// Launch a step without waiting for it
///
/// Used for the `run` step, whose exit is observed by the service worker
/// rather than awaited inline.
pub fn launch_step(
    ctx: StepContext<'_>,
    spec: &StepSpec,
    env: &HashMap<String, String>,
    cwd: Option<&Path>,
) -> Result<LaunchedStep> {
    if let Some(expression) = &spec.skipif {
        let predicate = SkipIf::parse(expression)?;
        if predicate.evaluate() {
            debug!(
                "{}: skipping {} step, predicate '{}' holds",
                ctx.service, ctx.step, expression
            );
            return Ok(LaunchedStep::Skipped);
        }
    }

    let mut cmd = Command::shell(&spec.script);
    cmd.envs(env.iter());
    cmd.envs(spec.setenv.iter());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let (events, handle) = spawn(&cmd)?;
    debug!(
        "{}: launched {} step (pid {:?})",
        ctx.service,
        ctx.step,
        handle.pid()
    );
    Ok(LaunchedStep::Running { events, handle })
}

/// Run a step to completion within a deadline
///
/// On deadline expiry the process receives SIGTERM, then SIGKILL after
/// [`KILL_GRACE`], and the outcome is [`StepOutcome::TimedOut`].
pub async fn run_step(
    ctx: StepContext<'_>,
    spec: &StepSpec,
    env: &HashMap<String, String>,
    cwd: Option<&Path>,
    default_timeout: Duration,
) -> Result<StepOutcome> {
    let launched = launch_step(ctx, spec, env, cwd)?;
    let (events, mut handle) = match launched {
        LaunchedStep::Skipped => return Ok(StepOutcome::Skipped),
        LaunchedStep::Running { events, handle } => (events, handle),
    };

    let deadline = spec.deadline(default_timeout);
    let (outcome, _) = futures::join!(
        wait_bounded(ctx, &mut handle, deadline),
        forward_output(ctx, events)
    );
    outcome
}

/// Await process exit, escalating SIGTERM then SIGKILL past the deadline
pub async fn wait_bounded(
    ctx: StepContext<'_>,
    handle: &mut dyn ProcessHandle,
    deadline: Duration,
) -> Result<StepOutcome> {
    let waited = future::or(async { Some(handle.wait().await) }, async {
        smol::Timer::after(deadline).await;
        None
    })
    .await;

    let Some(status) = waited else {
        warn!(
            "{}: {} step exceeded {:?} deadline, terminating",
            ctx.service, ctx.step, deadline
        );
        if let Err(e) = handle.terminate().await {
            warn!("{}: failed to terminate {} step: {}", ctx.service, ctx.step, e);
        }

        let graced = future::or(async { Some(handle.wait().await) }, async {
            smol::Timer::after(KILL_GRACE).await;
            None
        })
        .await;

        if graced.is_none() {
            warn!(
                "{}: {} step ignored SIGTERM, killing",
                ctx.service, ctx.step
            );
            if let Err(e) = handle.kill().await {
                warn!("{}: failed to kill {} step: {}", ctx.service, ctx.step, e);
            }
            handle.wait().await?;
        }
        return Ok(StepOutcome::TimedOut);
    };

    Ok(StepOutcome::Completed(status?))
}

/// Drain a step's output stream into the log
pub async fn forward_output(ctx: StepContext<'_>, mut events: ProcessEventStream) {
    while let Some(event) = events.next().await {
        match event.event_type {
            ProcessEventType::Stdout => {
                debug!(
                    "{}:{} | {}",
                    ctx.service,
                    ctx.step,
                    event.data.as_deref().unwrap_or("")
                );
            }
            ProcessEventType::Stderr => {
                debug!(
                    "{}:{} ! {}",
                    ctx.service,
                    ctx.step,
                    event.data.as_deref().unwrap_or("")
                );
            }
            ProcessEventType::Started { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StepContext<'static> {
        StepContext {
            service: "test",
            step: "install",
        }
    }

    #[test]
    fn test_step_spec_from_scalar() {
        let spec: StepSpec = serde_yaml::from_str("\"echo hi\"").unwrap();
        assert_eq!(spec.script, "echo hi");
        assert!(spec.timeout.is_none());
        assert!(spec.skipif.is_none());
    }

    #[test]
    fn test_step_spec_from_map() {
        let yaml = r#"
script: "mkdir -p /tmp/foo"
timeout: 30
setenv:
  FOO: bar
"#;
        let spec: StepSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.script, "mkdir -p /tmp/foo");
        assert_eq!(spec.timeout, Some(30));
        assert_eq!(spec.setenv.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn test_skipif_parse() {
        assert_eq!(
            SkipIf::parse("onpath sh").unwrap(),
            SkipIf::OnPath("sh".to_string())
        );
        assert_eq!(
            SkipIf::parse("exists /tmp").unwrap(),
            SkipIf::Exists(PathBuf::from("/tmp"))
        );
        assert!(matches!(
            SkipIf::parse("garbage expression here"),
            Err(Error::MalformedSkipIf { .. })
        ));
        assert!(matches!(
            SkipIf::parse(""),
            Err(Error::MalformedSkipIf { .. })
        ));
    }

    #[test]
    fn test_skipif_evaluate() {
        assert!(SkipIf::OnPath("sh".to_string()).evaluate());
        assert!(!SkipIf::OnPath("no-such-command-exists".to_string()).evaluate());
        assert!(SkipIf::Exists(PathBuf::from("/")).evaluate());
        assert!(!SkipIf::Exists(PathBuf::from("/no/such/path")).evaluate());
    }

    #[smol_potat::test]
    async fn test_run_step_success() {
        let spec = StepSpec::from_script("exit 0");
        let outcome = run_step(ctx(), &spec, &HashMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.success());
    }

    #[smol_potat::test]
    async fn test_run_step_failure_code() {
        let spec = StepSpec::from_script("exit 7");
        let outcome = run_step(ctx(), &spec, &HashMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Completed(ExitStatus {
                code: Some(7),
                #[cfg(unix)]
                signal: None,
            })
        );
        assert!(!outcome.success());
    }

    #[smol_potat::test]
    async fn test_run_step_env_merging() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("env.out");
        let mut spec = StepSpec::from_script(format!("echo \"$A $B\" > {}", marker.display()));
        spec.setenv.insert("B".to_string(), "step".to_string());

        let mut env = HashMap::new();
        env.insert("A".to_string(), "service".to_string());
        env.insert("B".to_string(), "shadowed".to_string());

        let outcome = run_step(ctx(), &spec, &env, None, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.success());
        let contents = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(contents.trim(), "service step");
    }

    #[smol_potat::test]
    async fn test_run_step_timeout() {
        let spec = StepSpec::from_script("sleep 30");
        let outcome = run_step(ctx(), &spec, &HashMap::new(), None, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::TimedOut);
    }

    #[smol_potat::test]
    async fn test_run_step_skipped() {
        let mut spec = StepSpec::from_script("exit 1");
        spec.skipif = Some("exists /".to_string());
        let outcome = run_step(ctx(), &spec, &HashMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Skipped);
    }

    #[smol_potat::test]
    async fn test_run_step_malformed_skipif() {
        let mut spec = StepSpec::from_script("exit 0");
        spec.skipif = Some("garbage expression".to_string());
        let err = run_step(ctx(), &spec, &HashMap::new(), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedSkipIf { .. }));
    }
}
