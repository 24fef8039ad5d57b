//! # Step Runner
//!
//! Shell lifecycle-step execution for the Evergreen agent.
//!
//! Services declare their lifecycle as shell scripts (`install`, `startup`,
//! `run`, `shutdown`, `recover`). This crate spawns those scripts as local
//! processes, streams their output, enforces per-step deadlines with
//! SIGTERM/SIGKILL escalation, and evaluates `skipif` predicates.
//!
//! ## Example
//!
//! ```no_run
//! use step_runner::{run_step, StepContext, StepSpec};
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! # async fn example() -> step_runner::Result<()> {
//! let spec = StepSpec::from_script("mkdir -p /tmp/workdir");
//! let ctx = StepContext { service: "svc", step: "install" };
//! let outcome = run_step(ctx, &spec, &HashMap::new(), None, Duration::from_secs(120)).await?;
//! assert!(outcome.success());
//! # Ok(())
//! # }
//! ```

mod command;
mod error;
mod event;
mod process;
mod spawn;
mod step;

pub use command::Command;
pub use error::{Error, Result};
pub use event::{ProcessEvent, ProcessEventType};
pub use process::{ChildHandle, ExitStatus, ProcessHandle};
pub use spawn::{spawn, ProcessEventStream};
pub use step::{
    forward_output, launch_step, run_step, wait_bounded, LaunchedStep, SkipIf, StepContext,
    StepOutcome, StepSpec, KILL_GRACE,
};
