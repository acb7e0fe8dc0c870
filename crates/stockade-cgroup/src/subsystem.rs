//! Controller registry: the freezer, cpuacct, and memory subsystems.
//!
//! Each subsystem is one cgroup v1 hierarchy mounted separately. The
//! registry knows the mount roots and owns the fixed supervisor subtree
//! under each of them; controller-specific behavior (usage readback,
//! freeze transitions, hierarchical accounting) is dispatched by pattern
//! matching on the subsystem tag.

use std::path::PathBuf;
use std::time::Duration;

use stockade_common::constants::{CGROUP_SUBTREE, POLL_GRANULARITY_MS};
use stockade_common::error::{Error, Result};
use stockade_common::poll::poll_until;

use crate::cgroup::Cgroup;
use crate::fsio;

/// A named cgroup v1 controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subsystem {
    /// Quiesces process sets via `freezer.state`.
    Freezer,
    /// CPU time accounting via `cpuacct.usage`.
    Cpuacct,
    /// Memory limits and accounting.
    Memory,
}

impl Subsystem {
    /// Every controller the supervisor binds containers to, in the order
    /// leaves are created.
    pub const ALL: [Self; 3] = [Self::Freezer, Self::Cpuacct, Self::Memory];

    /// Kernel name of the controller.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Freezer => "freezer",
            Self::Cpuacct => "cpuacct",
            Self::Memory => "memory",
        }
    }
}

/// Freezer cgroup state as reported by `freezer.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezerState {
    /// All member tasks are frozen.
    Frozen,
    /// A freeze has been requested but not yet completed.
    Freezing,
    /// Member tasks run normally.
    Thawed,
}

impl FreezerState {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "FROZEN" => Ok(Self::Frozen),
            "FREEZING" => Ok(Self::Freezing),
            "THAWED" => Ok(Self::Thawed),
            other => Err(Error::Unknown(format!("unexpected freezer state {other:?}"))),
        }
    }

    fn knob_value(self) -> &'static str {
        match self {
            Self::Frozen => "FROZEN",
            Self::Freezing => "FREEZING",
            Self::Thawed => "THAWED",
        }
    }
}

/// Registry of controller hierarchies, rooted at one mount base.
#[derive(Debug, Clone)]
pub struct Registry {
    base: PathBuf,
    freeze_spin: Duration,
}

impl Registry {
    /// Creates a registry for hierarchies mounted under `base`
    /// (`/sys/fs/cgroup` on a standard host).
    #[must_use]
    pub fn new(base: PathBuf, freeze_spin_ms: u64) -> Self {
        Self {
            base,
            freeze_spin: Duration::from_millis(freeze_spin_ms),
        }
    }

    /// Mount root of one controller's hierarchy.
    #[must_use]
    pub fn mount_root(&self, subsystem: Subsystem) -> PathBuf {
        self.base.join(subsystem.name())
    }

    /// Handle to the hierarchy root cgroup of a controller.
    #[must_use]
    pub fn hierarchy_root(&self, subsystem: Subsystem) -> Cgroup {
        Cgroup::hierarchy_root(subsystem, self.mount_root(subsystem))
    }

    /// Handle to the supervisor-owned subtree root of a controller.
    #[must_use]
    pub fn supervisor_root(&self, subsystem: Subsystem) -> Cgroup {
        self.hierarchy_root(subsystem).child(CGROUP_SUBTREE)
    }

    /// Ensures a controller hierarchy is mounted, mounting it if absent.
    ///
    /// # Errors
    ///
    /// Returns a classified error if the hierarchy is absent and cannot
    /// be mounted.
    pub fn ensure_mounted(&self, subsystem: Subsystem) -> Result<()> {
        let root = self.mount_root(subsystem);
        if root.join("tasks").exists() {
            return Ok(());
        }
        fsio::mount_cgroup(subsystem.name(), &root)
    }

    /// Reads the numeric usage counter of a leaf: nanoseconds of CPU for
    /// cpuacct, bytes for memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidData`] for the freezer, which accounts
    /// nothing, or a classified error if the knob cannot be read.
    pub fn usage(&self, leaf: &Cgroup) -> Result<u64> {
        match leaf.subsystem() {
            Subsystem::Cpuacct => leaf.get_knob_u64("cpuacct.usage"),
            Subsystem::Memory => leaf.get_knob_u64("memory.usage_in_bytes"),
            Subsystem::Freezer => Err(Error::InvalidData(
                "freezer subsystem has no usage counter".to_string(),
            )),
        }
    }

    /// Reads the freezer state of a leaf.
    ///
    /// # Errors
    ///
    /// Returns an error if the knob cannot be read or holds an
    /// unexpected value.
    pub fn freezer_state(&self, leaf: &Cgroup) -> Result<FreezerState> {
        FreezerState::parse(&leaf.get_knob("freezer.state")?)
    }

    fn transition(&self, leaf: &Cgroup, target: FreezerState) -> Result<()> {
        leaf.set_knob("freezer.state", target.knob_value(), false)?;
        let settled = poll_until(
            self.freeze_spin,
            Duration::from_millis(POLL_GRANULARITY_MS),
            || matches!(self.freezer_state(leaf), Ok(s) if s == target),
        );
        if settled {
            Ok(())
        } else {
            Err(Error::Unknown(format!(
                "freezer did not reach {} within {:?}: {}",
                target.knob_value(),
                self.freeze_spin,
                leaf.path().display()
            )))
        }
    }

    /// Freezes every task in the leaf, spinning (bounded) until the
    /// kernel reports `FROZEN`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the spin times out.
    pub fn freeze(&self, leaf: &Cgroup) -> Result<()> {
        self.transition(leaf, FreezerState::Frozen)
    }

    /// Thaws the leaf, spinning (bounded) until the kernel reports
    /// `THAWED`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the spin times out.
    pub fn unfreeze(&self, leaf: &Cgroup) -> Result<()> {
        self.transition(leaf, FreezerState::Thawed)
    }

    /// Enables hierarchical memory accounting on a leaf unless the
    /// hierarchy root already has it set.
    ///
    /// # Errors
    ///
    /// Returns an error if the knob cannot be read or written.
    pub fn use_hierarchy(&self, leaf: &Cgroup) -> Result<()> {
        let root = self.hierarchy_root(Subsystem::Memory);
        if root.get_knob("memory.use_hierarchy").unwrap_or_default() == "1" {
            return Ok(());
        }
        leaf.set_knob("memory.use_hierarchy", "1", false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &std::path::Path) -> Registry {
        Registry::new(dir.to_path_buf(), 10)
    }

    #[test]
    fn subsystem_names_match_kernel_controllers() {
        assert_eq!(Subsystem::Freezer.name(), "freezer");
        assert_eq!(Subsystem::Cpuacct.name(), "cpuacct");
        assert_eq!(Subsystem::Memory.name(), "memory");
    }

    #[test]
    fn supervisor_root_lives_under_fixed_subtree() {
        let reg = registry(std::path::Path::new("/sys/fs/cgroup"));
        let cg = reg.supervisor_root(Subsystem::Freezer);
        assert_eq!(
            cg.path(),
            std::path::PathBuf::from("/sys/fs/cgroup/freezer/porto")
        );
    }

    #[test]
    fn usage_reads_controller_specific_knobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry(dir.path());

        let cpu = reg.hierarchy_root(Subsystem::Cpuacct);
        std::fs::create_dir_all(cpu.path()).expect("mkdir");
        std::fs::write(cpu.path().join("cpuacct.usage"), "123456\n").expect("seed");
        assert_eq!(reg.usage(&cpu).expect("cpu usage"), 123_456);

        let mem = reg.hierarchy_root(Subsystem::Memory);
        std::fs::create_dir_all(mem.path()).expect("mkdir");
        std::fs::write(mem.path().join("memory.usage_in_bytes"), "4096\n").expect("seed");
        assert_eq!(reg.usage(&mem).expect("mem usage"), 4096);
    }

    #[test]
    fn usage_rejects_freezer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry(dir.path());
        let frz = reg.hierarchy_root(Subsystem::Freezer);
        assert!(reg.usage(&frz).is_err());
    }

    #[test]
    fn freeze_observes_written_state() {
        // Plain files echo writes back immediately, which is exactly what
        // the spin waits for.
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry(dir.path());
        let leaf = reg.hierarchy_root(Subsystem::Freezer).child("a");
        std::fs::create_dir_all(leaf.path()).expect("mkdir");
        std::fs::write(leaf.path().join("freezer.state"), "THAWED\n").expect("seed");

        reg.freeze(&leaf).expect("freeze");
        assert_eq!(
            reg.freezer_state(&leaf).expect("state"),
            FreezerState::Frozen
        );

        reg.unfreeze(&leaf).expect("unfreeze");
        assert_eq!(
            reg.freezer_state(&leaf).expect("state"),
            FreezerState::Thawed
        );
    }

    #[test]
    fn freezer_state_rejects_garbage() {
        assert!(FreezerState::parse("MELTED").is_err());
    }

    #[test]
    fn use_hierarchy_skips_when_root_already_hierarchical() {
        let dir = tempfile::tempdir().expect("tempdir");
        let reg = registry(dir.path());
        let root = reg.hierarchy_root(Subsystem::Memory);
        std::fs::create_dir_all(root.path()).expect("mkdir");
        std::fs::write(root.path().join("memory.use_hierarchy"), "1\n").expect("seed");

        let leaf = root.child("porto").child("a");
        // The leaf has no knob file; enabling must be skipped, not fail.
        reg.use_hierarchy(&leaf).expect("skip");
    }
}
