//! Logging setup: a console sink plus a per-run log file.
//!
//! Every interval and epoch line goes to both a stream handler and a
//! file handler, built here as `tracing-subscriber` layers over one
//! registry. `RUST_LOG` controls the level filter.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::utils::error::Result;

/// Initialize console-only logging. Used by tools and tests.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

/// Initialize logging for a training run: console plus an append-mode
/// log file. Fails if the file cannot be opened; a second install (e.g.
/// under the test harness) is ignored.
pub fn init_run_logging<P: AsRef<Path>>(log_file: P) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file.as_ref())?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false);
    let file_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(Arc::new(file));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();

    Ok(())
}

/// Log file name for a run: `imagenet-{nworker}-{model}-{suffix}`.
pub fn run_log_file_name(nworker: usize, model: &str, suffix: &str) -> String {
    format!("imagenet-{}-{}-{}", nworker, model, suffix)
}
