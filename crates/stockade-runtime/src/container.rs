//! The container: state machine, cgroup binding, data readback.
//!
//! A container owns a task, a set of cgroup leaves (one per subsystem),
//! a property store and a live state. State-changing operations are
//! serialized by the single supervisor dispatcher; they either complete
//! or unwind fully, so no partially-applied state is ever observable
//! between public operations.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use stockade_cgroup::cgroup::Cgroup;
use stockade_cgroup::subsystem::{Registry, Subsystem};
use stockade_common::config::Config;
use stockade_common::constants::{CREATED_AT_KEY, POLL_GRANULARITY_MS, ROOT_PID_KEY};
use stockade_common::error::{Error, Result};
use stockade_common::poll::poll_until;
use stockade_common::types::{ContainerName, ContainerState};

use crate::reaper::Reaper;
use crate::spec::Spec;
use crate::store::Record;
use crate::task::{Task, TaskEnv};

/// Gate table entry for one data key.
struct DataDef {
    name: &'static str,
    root_valid: bool,
    valid_states: &'static [ContainerState],
}

use ContainerState::{Dead, Paused, Running, Stopped};

const DATA: &[DataDef] = &[
    DataDef {
        name: "state",
        root_valid: true,
        valid_states: &[Stopped, Running, Paused, Dead],
    },
    DataDef {
        name: "exit_status",
        root_valid: false,
        valid_states: &[Dead],
    },
    DataDef {
        name: "start_errno",
        root_valid: false,
        valid_states: &[Stopped],
    },
    DataDef {
        name: "root_pid",
        root_valid: false,
        valid_states: &[Running, Paused],
    },
    DataDef {
        name: "stdout",
        root_valid: false,
        valid_states: &[Running, Paused, Dead],
    },
    DataDef {
        name: "stderr",
        root_valid: false,
        valid_states: &[Running, Paused, Dead],
    },
    DataDef {
        name: "cpu_usage",
        root_valid: true,
        valid_states: &[Running, Paused, Dead],
    },
    DataDef {
        name: "memory_usage",
        root_valid: true,
        valid_states: &[Running, Paused, Dead],
    },
];

/// A named unit of isolated execution.
#[derive(Debug)]
pub struct Container {
    name: ContainerName,
    spec: Spec,
    state: ContainerState,
    leaf_cgroups: BTreeMap<Subsystem, Cgroup>,
    task: Option<Task>,
    maybe_returned_ok: bool,
    registry: Registry,
    log_dir: PathBuf,
    stop_drain: Duration,
    log_rotate_bytes: u64,
}

impl Container {
    /// Creates a container in the `Stopped` state.
    #[must_use]
    pub fn new(name: ContainerName, registry: Registry, config: &Config) -> Self {
        let mut spec = Spec::new();
        spec.set_internal(CREATED_AT_KEY, chrono::Utc::now().to_rfc3339());
        Self {
            name,
            spec,
            state: ContainerState::Stopped,
            leaf_cgroups: BTreeMap::new(),
            task: None,
            maybe_returned_ok: false,
            registry,
            log_dir: config.log_dir.clone(),
            stop_drain: Duration::from_millis(config.stop_drain_ms),
            log_rotate_bytes: config.log_rotate_bytes,
        }
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &ContainerName {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        self.state
    }

    /// True for the host pseudo-container.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.name.is_root()
    }

    /// Serializes the property store for persistence.
    #[must_use]
    pub fn record(&self) -> Record {
        self.spec.to_record()
    }

    /// Computes the cgroup leaf handle for one subsystem, preferring the
    /// bound handle when the container holds one.
    #[must_use]
    pub fn leaf(&self, subsystem: Subsystem) -> Cgroup {
        if let Some(cg) = self.leaf_cgroups.get(&subsystem) {
            return cg.clone();
        }
        let supervisor_root = self.registry.supervisor_root(subsystem);
        if self.is_root() {
            supervisor_root
        } else {
            supervisor_root.child(self.name.as_str())
        }
    }

    fn stdout_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.stdout", self.name))
    }

    fn stderr_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.stderr", self.name))
    }

    /// Pids currently placed in the container's freezer leaf.
    #[must_use]
    pub fn processes(&self) -> Vec<i32> {
        self.leaf(Subsystem::Freezer).processes().unwrap_or_default()
    }

    fn is_alive(&self) -> bool {
        self.is_root() || !self.processes().is_empty()
    }

    /// Reconciles a stale `Running` state: a container whose task is gone
    /// without an exit delivery (a restored orphan reaped by init) is
    /// forced down to `Stopped` and its kernel state is cleaned up.
    /// Returns true when the state changed.
    pub fn reconcile(&mut self) -> bool {
        if self.state != ContainerState::Running || self.is_root() {
            return false;
        }
        let alive = self.task.as_ref().is_some_and(Task::is_running);
        if alive {
            return false;
        }
        tracing::info!(name = %self.name, "task vanished, reconciling to stopped");
        if let Err(e) = self.kill_all() {
            tracing::warn!(name = %self.name, error = %e, "reconcile kill failed");
        }
        self.discard_leaves();
        self.spec.clear_internal(ROOT_PID_KEY);
        self.state = ContainerState::Stopped;
        true
    }

    fn prepare_cgroups(&mut self, restore: bool) -> Result<()> {
        for subsystem in Subsystem::ALL {
            let cg = self.leaf(subsystem);
            let created = if restore || self.is_root() {
                cg.create_restore()
            } else {
                cg.create()
            };
            if let Err(e) = created {
                self.discard_leaves();
                return Err(e);
            }
            let _ = self.leaf_cgroups.insert(subsystem, cg);
        }

        if let Err(e) = self.apply_memory_knobs() {
            self.discard_leaves();
            return Err(e);
        }
        Ok(())
    }

    fn apply_memory_knobs(&self) -> Result<()> {
        let mem = self.leaf(Subsystem::Memory);
        self.registry.use_hierarchy(&mem)?;
        if self.is_root() {
            return Ok(());
        }
        let hierarchy_root = self.registry.hierarchy_root(Subsystem::Memory);
        if hierarchy_root.has_knob("memory.low_limit_in_bytes") {
            mem.set_knob(
                "memory.low_limit_in_bytes",
                &self.spec.get("memory_guarantee")?,
                false,
            )?;
        }
        mem.set_knob("memory.limit_in_bytes", &self.spec.get("memory_limit")?, false)
    }

    // Removes bound leaves in reverse creation order, best-effort.
    fn discard_leaves(&mut self) {
        while let Some((subsystem, cg)) = self.leaf_cgroups.pop_last() {
            if let Err(e) = cg.remove() {
                tracing::warn!(name = %self.name, subsystem = subsystem.name(), error = %e,
                    "leaf removal failed");
            }
        }
    }

    /// Starts the container: binds cgroup leaves, applies memory knobs,
    /// forks the root task, records `root_pid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the container is stopped,
    /// [`Error::InvalidValue`] for an empty command, or the first error
    /// of cgroup preparation / task launch, after a full unwind.
    pub fn start(&mut self) -> Result<()> {
        if matches!(self.state, ContainerState::Running | ContainerState::Dead)
            && self.maybe_returned_ok
        {
            // A previous start was acknowledged to a client right before
            // a daemon crash; report success exactly once more.
            tracing::info!(name = %self.name, "start already acknowledged before restart");
            self.maybe_returned_ok = false;
            return Ok(());
        }
        self.maybe_returned_ok = false;

        if self.state != ContainerState::Stopped {
            return Err(Error::InvalidState(format!(
                "invalid container state {}",
                self.state
            )));
        }

        if self.is_root() {
            self.prepare_cgroups(true)?;
            self.state = ContainerState::Running;
            return Ok(());
        }

        let env = TaskEnv::from_spec(&self.spec)?;
        self.prepare_cgroups(false)?;

        let leaves: Vec<Cgroup> = self.leaf_cgroups.values().cloned().collect();
        let mut task = Task::new(
            env,
            leaves,
            self.stdout_path(),
            self.stderr_path(),
            self.log_rotate_bytes,
        );
        if let Err(e) = task.start() {
            self.discard_leaves();
            // The task is retained: its launch errno stays readable as
            // `start_errno` while the container is stopped.
            self.task = Some(task);
            return Err(e);
        }

        let pid = task.pid();
        self.task = Some(task);
        self.spec.set_internal(ROOT_PID_KEY, pid.to_string());
        self.state = ContainerState::Running;
        tracing::info!(name = %self.name, pid, "container started");
        Ok(())
    }

    // SIGTERM drain, then freeze-kill-thaw so no fork races the kill,
    // then a conservative re-check that the leaf actually emptied.
    fn kill_all(&mut self) -> Result<()> {
        let freezer = self.leaf(Subsystem::Freezer);
        tracing::info!(name = %self.name, "killing all tasks");

        freezer.kill(Signal::SIGTERM)?;
        let granularity = Duration::from_millis(POLL_GRANULARITY_MS);
        let _ = poll_until(self.stop_drain, granularity, || freezer.is_empty());

        if let Err(e) = self.registry.freeze(&freezer) {
            tracing::warn!(name = %self.name, error = %e, "freeze before kill failed");
        }
        freezer.kill(Signal::SIGKILL)?;
        if let Err(e) = self.registry.unfreeze(&freezer) {
            tracing::warn!(name = %self.name, error = %e, "thaw after kill failed");
        }

        if !poll_until(self.stop_drain, granularity, || freezer.is_empty()) {
            return Err(Error::io(
                "killall",
                &freezer.path(),
                std::io::Error::from_raw_os_error(libc::EBUSY),
            ));
        }
        Ok(())
    }

    /// Stops the container: kills every task in the freezer leaf,
    /// removes the leaves, acknowledges the exit status so a racing
    /// SIGCHLD result is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for ROOT, [`Error::InvalidState`]
    /// unless running or dead, or [`Error::Busy`] if tasks survived
    /// SIGKILL or a leaf could not be removed.
    pub fn stop(&mut self, reaper: &mut Reaper) -> Result<()> {
        if self.is_root() {
            return Err(Error::InvalidValue(
                "cannot stop the root container".into(),
            ));
        }
        if !matches!(self.state, ContainerState::Running | ContainerState::Dead) {
            return Err(Error::InvalidState(format!(
                "invalid container state {}",
                self.state
            )));
        }

        let pid = self.task.as_ref().map_or(0, Task::pid);
        self.kill_all()?;

        while let Some((_, cg)) = self.leaf_cgroups.pop_last() {
            cg.remove()?;
        }

        reaper.ack(pid);
        self.task = None;
        self.spec.clear_internal(ROOT_PID_KEY);
        self.state = ContainerState::Stopped;
        tracing::info!(name = %self.name, "container stopped");
        Ok(())
    }

    /// Freezes the container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for ROOT, [`Error::InvalidState`]
    /// unless running, or the freezer transition error.
    pub fn pause(&mut self) -> Result<()> {
        if self.is_root() {
            return Err(Error::InvalidValue(
                "cannot pause the root container".into(),
            ));
        }
        if self.state != ContainerState::Running {
            return Err(Error::InvalidState(format!(
                "invalid container state {}",
                self.state
            )));
        }
        self.registry.freeze(&self.leaf(Subsystem::Freezer))?;
        self.state = ContainerState::Paused;
        Ok(())
    }

    /// Thaws the container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for ROOT, [`Error::InvalidState`]
    /// unless paused, or the freezer transition error.
    pub fn resume(&mut self) -> Result<()> {
        if self.is_root() {
            return Err(Error::InvalidValue(
                "cannot resume the root container".into(),
            ));
        }
        if self.state != ContainerState::Paused {
            return Err(Error::InvalidState(format!(
                "invalid container state {}",
                self.state
            )));
        }
        self.registry.unfreeze(&self.leaf(Subsystem::Freezer))?;
        self.state = ContainerState::Running;
        Ok(())
    }

    /// Routes a reaped `(pid, status)` to this container. Returns true
    /// iff the pid matches the running root task; the container then
    /// transitions to `Dead`.
    pub fn deliver_exit_status(&mut self, pid: i32, status: i32) -> bool {
        if self.state != ContainerState::Running {
            return false;
        }
        let Some(task) = self.task.as_mut() else {
            return false;
        };
        if task.pid() != pid {
            return false;
        }
        task.deliver_exit_status(status);
        self.state = ContainerState::Dead;
        tracing::info!(name = %self.name, pid, status = %crate::proc::format_exit_status(status),
            "exit delivered");
        true
    }

    /// Periodic maintenance: drives stdout/stderr rotation.
    pub fn heartbeat(&mut self) {
        if let Some(task) = &self.task {
            task.rotate();
        }
    }

    /// Reads a user-visible property (its default if never set).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for ROOT and
    /// [`Error::InvalidProperty`] for unknown names.
    pub fn get_property(&self, name: &str) -> Result<String> {
        if self.is_root() {
            return Err(Error::InvalidValue(
                "no properties for the root container".into(),
            ));
        }
        self.spec.get(name)
    }

    /// Sets a user-visible property. Static properties may only change
    /// while the container is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for ROOT or a static property on
    /// a non-stopped container, [`Error::InvalidProperty`] for unknown
    /// names.
    pub fn set_property(&mut self, name: &str, value: &str) -> Result<()> {
        if self.is_root() {
            return Err(Error::InvalidValue(
                "cannot set properties on the root container".into(),
            ));
        }
        if self.state != ContainerState::Stopped && !self.spec.is_dynamic(name)? {
            return Err(Error::InvalidValue(format!(
                "cannot set static property {name} while {}",
                self.state
            )));
        }
        self.spec.set(name, value)
    }

    /// Reads a typed data item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for unknown keys,
    /// [`Error::InvalidData`] for non-root-valid keys on ROOT, and
    /// [`Error::InvalidState`] when the state gate rejects the key.
    pub fn get_data(&self, key: &str) -> Result<String> {
        let def = DATA
            .iter()
            .find(|d| d.name == key)
            .ok_or_else(|| Error::InvalidValue(format!("invalid container data {key}")))?;
        if self.is_root() && !def.root_valid {
            return Err(Error::InvalidData(format!(
                "data {key} is not valid for the root container"
            )));
        }
        if !def.valid_states.contains(&self.state) {
            return Err(Error::InvalidState(format!(
                "invalid container state {}",
                self.state
            )));
        }

        Ok(match key {
            "state" => self.state.to_string(),
            "exit_status" => self
                .task
                .as_ref()
                .and_then(Task::exit_status)
                .map_or_else(|| "-1".to_string(), |s| s.status.to_string()),
            "start_errno" => self
                .task
                .as_ref()
                .and_then(Task::exit_status)
                .map_or_else(|| "-1".to_string(), |s| s.error.to_string()),
            "root_pid" => self
                .task
                .as_ref()
                .map_or_else(|| "-1".to_string(), |t| t.pid().to_string()),
            "stdout" => self.task.as_ref().map(Task::stdout).unwrap_or_default(),
            "stderr" => self.task.as_ref().map(Task::stderr).unwrap_or_default(),
            "cpu_usage" => self.read_usage(Subsystem::Cpuacct),
            "memory_usage" => self.read_usage(Subsystem::Memory),
            _ => unreachable!("key validated against the data table"),
        })
    }

    fn read_usage(&self, subsystem: Subsystem) -> String {
        match self.registry.usage(&self.leaf(subsystem)) {
            Ok(value) => value.to_string(),
            Err(e) => {
                tracing::warn!(name = %self.name, subsystem = subsystem.name(), error = %e,
                    "usage readback failed");
                "-1".to_string()
            }
        }
    }

    /// Rebuilds this container from a persisted record after a daemon
    /// restart, reconciling the record against live kernel state.
    ///
    /// # Errors
    ///
    /// Returns an error when a recorded pid can no longer be attached;
    /// the container is left stopped with its kernel state cleaned up.
    pub fn restore(&mut self, record: &Record) -> Result<()> {
        self.spec = Spec::from_record(record);
        self.state = ContainerState::Stopped;

        let recorded_pid = self
            .spec
            .get_internal(ROOT_PID_KEY)
            .and_then(|s| s.parse::<i32>().ok());

        let Some(pid) = recorded_pid else {
            if self.is_alive() {
                // We forked but died before persisting the pid; the
                // half-started world is killed and started afresh.
                tracing::warn!(name = %self.name, "live tasks without a recorded pid, restarting");
                if let Err(e) = self.kill_all() {
                    tracing::warn!(name = %self.name, error = %e, "restart kill failed");
                }
                self.cleanup_computed_leaves();
                return self.start();
            }
            // Never started; make sure nothing is left behind anyway.
            if let Err(e) = self.kill_all() {
                tracing::warn!(name = %self.name, error = %e, "defensive kill failed");
            }
            self.cleanup_computed_leaves();
            return Ok(());
        };

        tracing::info!(name = %self.name, pid, "restoring container");
        self.prepare_cgroups(true)?;

        let env = match TaskEnv::from_spec(&self.spec) {
            Ok(env) => env,
            Err(e) => {
                self.abandon_restore();
                return Err(e);
            }
        };
        let leaves: Vec<Cgroup> = self.leaf_cgroups.values().cloned().collect();
        let mut task = Task::new(
            env,
            leaves,
            self.stdout_path(),
            self.stderr_path(),
            self.log_rotate_bytes,
        );
        if let Err(e) = task.restore(pid) {
            self.abandon_restore();
            return Err(e);
        }

        if task.is_running() {
            self.task = Some(task);
            self.state = ContainerState::Running;
            // A start may have been acknowledged right before the crash;
            // the next client start must succeed without doing anything.
            self.maybe_returned_ok = true;
        } else {
            self.task = Some(task);
            self.abandon_restore();
        }
        Ok(())
    }

    // The recorded task cannot be attached (or is already gone): kill
    // whatever lives in the leaves, drop them, forget the pid.
    fn abandon_restore(&mut self) {
        if let Err(e) = self.kill_all() {
            tracing::warn!(name = %self.name, error = %e, "restore cleanup kill failed");
        }
        self.discard_leaves();
        self.spec.clear_internal(ROOT_PID_KEY);
        self.state = ContainerState::Stopped;
    }

    // Best-effort removal of leaf directories that were never bound.
    fn cleanup_computed_leaves(&mut self) {
        for subsystem in Subsystem::ALL.iter().rev() {
            let cg = self.leaf(*subsystem);
            if let Err(e) = cg.remove() {
                tracing::warn!(name = %self.name, subsystem = subsystem.name(), error = %e,
                    "stale leaf removal failed");
            }
        }
    }

    /// Explicit pre-destruction cleanup: a paused container is resumed
    /// first so no frozen process outlives its registration, then the
    /// container is stopped.
    pub fn prepare_destroy(&mut self, reaper: &mut Reaper) {
        if self.state == ContainerState::Paused {
            if let Err(e) = self.resume() {
                tracing::warn!(name = %self.name, error = %e, "resume before destroy failed");
            }
        }
        if matches!(self.state, ContainerState::Running | ContainerState::Dead) {
            if let Err(e) = self.stop(reaper) {
                tracing::warn!(name = %self.name, error = %e, "stop before destroy failed");
            }
        }
    }
}
