//! Daemon pid file handling.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use stockade_runtime::proc;

/// Pid file of the running daemon.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claims the pid file, refusing to start when another live daemon
    /// instance already holds it. A stale file (dead pid) is taken over.
    ///
    /// # Errors
    ///
    /// Returns an error if a live instance holds the file or it cannot
    /// be written.
    pub fn claim(path: &Path) -> anyhow::Result<Self> {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(pid) = contents.trim().parse::<i32>() {
                if proc::exists(pid) {
                    bail!("already running with pid {pid} (per {})", path.display());
                }
                tracing::warn!(pid, "removing stale pid file");
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(path, std::process::id().to_string())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Releases the pid file.
    pub fn release(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "pid file removal failed");
        }
    }
}
