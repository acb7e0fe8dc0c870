//! Handle to one cgroup directory in one controller's hierarchy.
//!
//! Handles are plain value types; they carry no back-pointer to the
//! container that owns them and may be recomputed freely from a
//! subsystem and a relative path.

use std::path::{Path, PathBuf};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use stockade_common::error::{Error, Result};

use crate::fsio;
use crate::subsystem::Subsystem;

/// One directory in one controller's hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    subsystem: Subsystem,
    root: PathBuf,
    relpath: PathBuf,
}

impl Cgroup {
    /// Returns a handle to the hierarchy root of `subsystem` mounted at
    /// `root`.
    #[must_use]
    pub fn hierarchy_root(subsystem: Subsystem, root: PathBuf) -> Self {
        Self {
            subsystem,
            root,
            relpath: PathBuf::new(),
        }
    }

    /// Returns the handle for a child cgroup of this one.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        Self {
            subsystem: self.subsystem,
            root: self.root.clone(),
            relpath: self.relpath.join(name),
        }
    }

    /// Controller this cgroup belongs to.
    #[must_use]
    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    /// Absolute path of the cgroup directory.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.root.join(&self.relpath)
    }

    /// Path of this cgroup relative to the hierarchy root.
    #[must_use]
    pub fn relpath(&self) -> &Path {
        &self.relpath
    }

    fn knob_path(&self, knob: &str) -> PathBuf {
        self.path().join(knob)
    }

    /// Creates the cgroup directory. Duplicate creation is an error; the
    /// container layer guarantees a single create per epoch.
    ///
    /// # Errors
    ///
    /// Returns a classified error, `ENOSPC` included, if mkdir fails.
    pub fn create(&self) -> Result<()> {
        tracing::debug!(cgroup = %self.path().display(), "create");
        fsio::create_dir(&self.path())
    }

    /// Creates the cgroup directory in restore mode: an already existing
    /// directory left behind by a previous daemon instance is accepted.
    ///
    /// # Errors
    ///
    /// Returns a classified error if mkdir fails for any reason other
    /// than `EEXIST`.
    pub fn create_restore(&self) -> Result<()> {
        let path = self.path();
        match std::fs::create_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(cgroup = %path.display(), "already present, reusing");
                Ok(())
            }
            Err(e) => Err(Error::io("mkdir", &path, e)),
        }
    }

    /// Removes the cgroup directory. A directory that is already gone is
    /// not an error; a non-empty one surfaces as `EBUSY`.
    ///
    /// # Errors
    ///
    /// Returns a classified error if rmdir fails.
    pub fn remove(&self) -> Result<()> {
        tracing::debug!(cgroup = %self.path().display(), "remove");
        fsio::remove_dir(&self.path())
    }

    /// Reads the `tasks` file: every thread placed in this cgroup, in
    /// file order, without deduplication.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn tasks(&self) -> Result<Vec<i32>> {
        fsio::read_pids(&self.knob_path("tasks"))
    }

    /// Reads `cgroup.procs`: thread-group leaders in this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn processes(&self) -> Result<Vec<i32>> {
        fsio::read_pids(&self.knob_path("cgroup.procs"))
    }

    /// True iff `cgroup.procs` is empty (or the cgroup is gone).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes().map_or(true, |pids| pids.is_empty())
    }

    /// Sends `sig` to every process in `cgroup.procs` at the moment of
    /// the call. Pids that vanish between enumeration and delivery are
    /// silently ignored.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process list cannot be read.
    pub fn kill(&self, sig: Signal) -> Result<()> {
        let pids = self.processes()?;
        tracing::debug!(cgroup = %self.path().display(), ?sig, count = pids.len(), "kill");
        for pid in pids {
            let _ = kill(Pid::from_raw(pid), sig);
        }
        Ok(())
    }

    /// Probes whether a knob file exists in this cgroup.
    #[must_use]
    pub fn has_knob(&self, knob: &str) -> bool {
        self.knob_path(knob).exists()
    }

    /// Reads a knob file, trimmed.
    ///
    /// # Errors
    ///
    /// Returns a classified error if the knob cannot be read.
    pub fn get_knob(&self, knob: &str) -> Result<String> {
        Ok(fsio::read_string(&self.knob_path(knob))?.trim().to_string())
    }

    /// Reads a numeric knob file.
    ///
    /// # Errors
    ///
    /// Returns an error if the knob cannot be read or parsed.
    pub fn get_knob_u64(&self, knob: &str) -> Result<u64> {
        fsio::read_u64(&self.knob_path(knob))
    }

    /// Writes `value` to a knob file; truncates unless `append` is set.
    ///
    /// # Errors
    ///
    /// Returns a classified error if the knob cannot be written.
    pub fn set_knob(&self, knob: &str, value: &str, append: bool) -> Result<()> {
        tracing::debug!(cgroup = %self.path().display(), knob, value, "set knob");
        fsio::write_string(&self.knob_path(knob), value, append)
    }
}
