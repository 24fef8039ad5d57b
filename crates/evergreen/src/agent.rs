//! The agent run loop
//!
//! Restores persisted state, applies the input configuration, launches the
//! supervisor, and runs until a signal arrives or the root service reaches a
//! terminal state.

use crate::Cli;
use config_tree::{now_ms, ConfigStore, ConfigTree, MergeBehavior, TopicPath};
use futures_lite::future;
use service_supervisor::{
    RootLayout, ServiceState, Supervisor, DEFAULT_SHUTDOWN_TIMEOUT, MAIN_SERVICE,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Resolve the agent root: `-r` flag, then the `root` environment variable,
/// then a per-user data directory
pub fn resolve_root(cli: &Cli) -> PathBuf {
    cli.root
        .clone()
        .or_else(|| std::env::var("root").ok().map(PathBuf::from))
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("evergreen")
        })
}

/// Run the agent to completion; the return value is the process exit code
pub async fn run(cli: Cli, root: PathBuf) -> i32 {
    info!("evergreen agent starting, root {}", root.display());

    if let Err(e) = std::fs::create_dir_all(&root) {
        error!("root {} is not writable: {}", root.display(), e);
        return 1;
    }

    let tree = ConfigTree::new();
    let store = match ConfigStore::open(&root) {
        Ok(store) => store,
        Err(e) => {
            error!("cannot open configuration store: {}", e);
            return 1;
        }
    };

    // Replayed log first; the input config then overrides through the
    // normal timestamp rules.
    match store.load_into(&tree) {
        Ok(true) => info!("restored persisted configuration"),
        Ok(false) => {}
        Err(e) => {
            error!("failed to replay transaction log: {}", e);
            return 1;
        }
    }
    if let Err(e) = store.attach(&tree) {
        error!("cannot attach transaction log: {}", e);
        return 1;
    }

    if let Some(path) = &cli.config {
        let config = match evergreen_config::parse_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("invalid configuration {}: {}", path.display(), e);
                return 1;
            }
        };
        let value = match config.to_tree_value() {
            Ok(value) => value,
            Err(e) => {
                error!("invalid configuration {}: {}", path.display(), e);
                return 1;
            }
        };
        if let Err(e) = tree.merge_value(&TopicPath::root(), &value, MergeBehavior::Merge, now_ms())
        {
            error!("failed to apply configuration: {}", e);
            return 1;
        }
    }

    let supervisor = Supervisor::new(tree, RootLayout::new(&root));
    supervisor.attach_store(store);

    if let Err(e) = supervisor.launch() {
        error!("launch failed: {}", e);
        return 1;
    }

    let outcome = wait_for_exit(&supervisor).await;

    if let Err(e) = supervisor.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await {
        error!("shutdown failed: {}", e);
        return 2;
    }

    match outcome {
        ExitReason::Signal => {
            info!("stopped by signal");
            0
        }
        ExitReason::MainFinished => {
            info!("root service finished");
            0
        }
        ExitReason::MainBroken => {
            error!("root service is broken");
            2
        }
    }
}

enum ExitReason {
    Signal,
    MainFinished,
    MainBroken,
}

async fn wait_for_exit(supervisor: &Supervisor) -> ExitReason {
    let signals = signal_channel();

    enum Wake {
        Signal,
        State(Option<ServiceState>),
    }

    loop {
        let wake = future::or(
            async {
                let _ = signals.recv().await;
                Wake::Signal
            },
            async {
                Wake::State(
                    supervisor
                        .wait_for_state(
                            MAIN_SERVICE,
                            |s| s.is_terminal(),
                            Duration::from_secs(3600),
                        )
                        .await,
                )
            },
        )
        .await;

        match wake {
            Wake::Signal => return ExitReason::Signal,
            Wake::State(Some(ServiceState::Broken)) => return ExitReason::MainBroken,
            Wake::State(Some(ServiceState::Finished)) => return ExitReason::MainFinished,
            // Hourly waiter timeout; keep waiting.
            Wake::State(_) => continue,
        }
    }
}

/// Forward SIGINT/SIGTERM into an async channel
fn signal_channel() -> async_channel::Receiver<i32> {
    let (tx, rx) = async_channel::bounded(1);
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        std::thread::spawn(move || {
            let mut signals = match Signals::new([SIGINT, SIGTERM]) {
                Ok(signals) => signals,
                Err(e) => {
                    error!("cannot install signal handlers: {}", e);
                    return;
                }
            };
            if let Some(signal) = signals.forever().next() {
                let _ = tx.send_blocking(signal);
            }
        });
    }
    rx
}
