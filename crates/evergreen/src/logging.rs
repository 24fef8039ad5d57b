//! Log subscriber setup
//!
//! The sink comes from `-log` (or the `log.store` environment variable),
//! the level from `log.level`, the format from `log.fmt`, and the file name
//! from `log.storeName`.

use crate::Cli;
use anyhow::{Context, Result};
use std::path::Path;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;

/// Initialize the global subscriber; the returned guard must stay alive for
/// the lifetime of the process when logging to a file
pub fn init(cli: &Cli, root: &Path) -> Result<Option<WorkerGuard>> {
    let level = std::env::var("log.level")
        .ok()
        .and_then(|text| Level::from_str(&text).ok())
        .unwrap_or(Level::INFO);
    let json = std::env::var("log.fmt")
        .map(|fmt| fmt.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let sink = cli
        .log_sink
        .clone()
        .or_else(|| std::env::var("log.store").ok().map(|s| s.to_lowercase()))
        .unwrap_or_else(|| "stdout".to_string());

    if sink == "file" {
        let store_name =
            std::env::var("log.storeName").unwrap_or_else(|_| "evergreen.log".to_string());
        let log_dir = root.join("logs");
        std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        let appender = tracing_appender::rolling::never(log_dir, store_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let builder = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(writer)
            .with_ansi(false);
        if json {
            builder.json().init();
        } else {
            builder.init();
        }
        Ok(Some(guard))
    } else {
        let builder = tracing_subscriber::fmt().with_max_level(level);
        if json {
            builder.json().init();
        } else {
            builder.init();
        }
        Ok(None)
    }
}
