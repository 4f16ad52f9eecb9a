//! Daemon lockfile
//!
//! `daemon.json` in the state directory records the running daemon's pid
//! and port; its absence means no daemon. A lockfile whose pid is dead is
//! stale and silently replaced.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;
use understore::{now_ms, read_json_opt, write_json_atomic};

/// Contents of `daemon.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonLockInfo {
    pub pid: u32,
    pub port: u16,
    #[serde(rename = "started-at")]
    pub started_at: i64,
}

/// Manages the daemon lockfile
#[derive(Debug, Clone)]
pub struct DaemonLock {
    path: PathBuf,
}

impl DaemonLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let lock = Self { path: path.into() };
        debug!(path = %lock.path.display(), "DaemonLock::new");
        lock
    }

    /// Read the lockfile, if present (stale or not)
    pub fn read(&self) -> Option<DaemonLockInfo> {
        debug!(path = %self.path.display(), "DaemonLock::read");
        read_json_opt(&self.path)
    }

    /// The lock of a live daemon, if any
    pub fn live(&self) -> Option<DaemonLockInfo> {
        debug!("DaemonLock::live");
        let info = self.read()?;
        if is_process_running(info.pid) {
            debug!(pid = info.pid, "DaemonLock::live: daemon is running");
            Some(info)
        } else {
            debug!(pid = info.pid, "DaemonLock::live: lock is stale");
            None
        }
    }

    /// Acquire the lock for this process
    ///
    /// Fails when a live daemon already holds it; a stale lock from a dead
    /// pid is replaced.
    pub fn acquire(&self, port: u16) -> eyre::Result<DaemonLockInfo> {
        debug!(port, "DaemonLock::acquire");
        if let Some(existing) = self.live() {
            eyre::bail!("Daemon already running with pid {} on port {}", existing.pid, existing.port);
        }

        let info = DaemonLockInfo {
            pid: std::process::id(),
            port,
            started_at: now_ms(),
        };
        write_json_atomic(&self.path, &info)?;
        debug!(pid = info.pid, port, "DaemonLock::acquire: acquired");
        Ok(info)
    }

    /// Release the lock (only if this process holds it)
    pub fn release(&self) {
        debug!("DaemonLock::release");
        if let Some(info) = self.read() {
            if info.pid != std::process::id() {
                debug!(pid = info.pid, "DaemonLock::release: held by another process, leaving it");
                return;
            }
        }
        if self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            debug!(error = %e, "DaemonLock::release: remove failed");
        }
    }
}

/// Check if a process with the given pid is running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        // Signal 0 probes existence without affecting the process
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
