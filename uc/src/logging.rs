//! Logging setup and per-batch rotation
//!
//! Interactive commands log to stderr; the daemon logs to
//! `logs/current.log` in the state directory, rotated to a per-batch file
//! when a batch finishes.

use eyre::{Context, Result};
use std::fs;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use crate::config::StateDir;

fn env_filter(verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Stderr logging for interactive commands
pub fn init_logging(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_writer(std::io::stderr)
        .try_init();
}

/// File logging for the daemon and grind sessions
pub fn init_file_logging(state: &StateDir, verbose: bool) -> Result<()> {
    state.ensure()?;
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(state.current_log_path())
        .context("Failed to open log file")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .try_init();
    Ok(())
}

/// Rotate `current.log` to `raid-{batchId}-{ISO}.log`
pub fn rotate_batch_log(state: &StateDir, batch_id: &str) -> Result<Option<std::path::PathBuf>> {
    let current = state.current_log_path();
    if !current.exists() {
        return Ok(None);
    }

    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let rotated = state.logs_dir().join(format!("raid-{}-{}.log", batch_id, stamp));
    fs::rename(&current, &rotated).context("Failed to rotate batch log")?;
    Ok(Some(rotated))
}

/// List rotated batch logs, newest first
pub fn list_batch_logs(state: &StateDir) -> Vec<std::path::PathBuf> {
    let Ok(entries) = fs::read_dir(state.logs_dir()) else {
        return Vec::new();
    };

    let mut logs: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| file_name_starts_with(p, "raid-"))
        .collect();
    logs.sort();
    logs.reverse();
    logs
}

fn file_name_starts_with(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(prefix))
        .unwrap_or(false)
}
