//! In-process registry of containers.
//!
//! The holder owns the name → container mapping and the persistence
//! backend: container records are written on every mutating operation and
//! reconciled against live kernel state when the daemon restarts.

use std::collections::BTreeMap;

use stockade_cgroup::subsystem::Registry;
use stockade_common::config::Config;
use stockade_common::constants::ROOT_CONTAINER;
use stockade_common::error::{Error, Result};
use stockade_common::types::ContainerName;

use crate::container::Container;
use crate::reaper::Reaper;
use crate::store::Store;

/// Registry of all containers known to the supervisor.
pub struct Holder {
    containers: BTreeMap<ContainerName, Container>,
    store: Box<dyn Store>,
    registry: Registry,
    config: Config,
}

impl Holder {
    /// Creates an empty holder backed by `store`.
    #[must_use]
    pub fn new(store: Box<dyn Store>, registry: Registry, config: Config) -> Self {
        Self {
            containers: BTreeMap::new(),
            store,
            registry,
            config,
        }
    }

    fn new_container(&self, name: ContainerName) -> Container {
        Container::new(name, self.registry.clone(), &self.config)
    }

    /// Instantiates and starts the host pseudo-container, materializing
    /// the supervisor-owned subtree under every controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the subtree cannot be created.
    pub fn create_root(&mut self) -> Result<()> {
        let name = ContainerName::root();
        let mut root = self.new_container(name.clone());
        root.start()?;
        let _ = self.containers.insert(name, root);
        Ok(())
    }

    /// Creates a container in the `Stopped` state and registers it in
    /// persistence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] on a malformed name or a name
    /// collision, or the persistence error.
    pub fn create(&mut self, name: &str) -> Result<()> {
        let name = ContainerName::parse(name)?;
        if self.containers.contains_key(&name) {
            return Err(Error::InvalidValue(format!(
                "container {name} already exists"
            )));
        }
        let container = self.new_container(name.clone());
        self.store.save(name.as_str(), &container.record())?;
        let _ = self.containers.insert(name.clone(), container);
        tracing::info!(%name, "container created");
        Ok(())
    }

    /// Looks up a container by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Container> {
        let name = ContainerName::parse(name).ok()?;
        self.containers.get(&name)
    }

    /// Looks up a container for mutation.
    #[must_use]
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Container> {
        let name = ContainerName::parse(name).ok()?;
        self.containers.get_mut(&name)
    }

    /// Removes a container from the registry and from persistence. The
    /// container is resumed (if paused) and stopped first so its
    /// processes and cgroup leaves never outlive the registration.
    /// Destroying ROOT is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for unknown names, or the
    /// persistence error.
    pub fn destroy(&mut self, name: &str, reaper: &mut Reaper) -> Result<()> {
        if name == ROOT_CONTAINER {
            return Ok(());
        }
        let name = ContainerName::parse(name)?;
        let Some(mut container) = self.containers.remove(&name) else {
            return Err(Error::InvalidValue(format!(
                "container {name} does not exist"
            )));
        };
        container.prepare_destroy(reaper);
        self.store.remove(name.as_str())?;
        tracing::info!(%name, "container destroyed");
        Ok(())
    }

    /// Names of every registered container.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.containers.keys().map(ToString::to_string).collect()
    }

    /// Persists the current record of one container. ROOT is never
    /// persisted.
    ///
    /// # Errors
    ///
    /// Returns the persistence error.
    pub fn persist(&self, name: &str) -> Result<()> {
        if name == ROOT_CONTAINER {
            return Ok(());
        }
        let Some(container) = self.get(name) else {
            return Ok(());
        };
        self.store.save(name, &container.record())
    }

    /// Forwards a reaped `(pid, status)` until one container claims it.
    pub fn deliver_exit_status(&mut self, pid: i32, status: i32) -> bool {
        for container in self.containers.values_mut() {
            if container.deliver_exit_status(pid, status) {
                return true;
            }
        }
        false
    }

    /// Periodic fan-out driving log rotation.
    pub fn heartbeat(&mut self) {
        for container in self.containers.values_mut() {
            container.heartbeat();
        }
    }

    /// Reconciles every container's state against the kernel, persisting
    /// the containers whose state changed.
    pub fn reconcile_all(&mut self) {
        let changed: Vec<String> = self
            .containers
            .values_mut()
            .filter_map(|c| c.reconcile().then(|| c.name().to_string()))
            .collect();
        for name in changed {
            if let Err(e) = self.persist(&name) {
                tracing::warn!(name, error = %e, "persist after reconcile failed");
            }
        }
    }

    /// Reinstantiates every persisted container, reconciling records
    /// against live kernel state. Containers whose recorded task cannot
    /// be attached are kept registered in the `Stopped` state.
    ///
    /// # Errors
    ///
    /// Returns the persistence error if the record set cannot be listed.
    pub fn restore_all(&mut self) -> Result<()> {
        for (name, record) in self.store.load_all()? {
            if name == ROOT_CONTAINER {
                continue;
            }
            let parsed = match ContainerName::parse(&name) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(name, error = %e, "skipping record with invalid name");
                    continue;
                }
            };
            let mut container = self.new_container(parsed.clone());
            if let Err(e) = container.restore(&record) {
                tracing::warn!(%parsed, error = %e, "restore failed, keeping container stopped");
            }
            let _ = self.containers.insert(parsed.clone(), container);
            if let Err(e) = self.persist(parsed.as_str()) {
                tracing::warn!(%parsed, error = %e, "persist after restore failed");
            }
        }
        tracing::info!(count = self.containers.len(), "restore complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FileStore, Record};
    use stockade_common::constants::ROOT_PID_KEY;
    use stockade_common::error::ErrorKind;
    use stockade_common::types::ContainerState;

    fn holder_in(dir: &std::path::Path) -> Holder {
        let config = Config {
            state_dir: dir.join("state"),
            log_dir: dir.join("log"),
            cgroup_root: dir.join("cgroup"),
            heartbeat_ms: 100,
            stop_drain_ms: 10,
            freeze_spin_ms: 10,
            log_rotate_bytes: 1024,
        };
        for subsystem in stockade_cgroup::subsystem::Subsystem::ALL {
            std::fs::create_dir_all(config.cgroup_root.join(subsystem.name()))
                .expect("seed controller dirs");
        }
        let store = FileStore::open(config.state_dir.clone()).expect("store");
        let registry = Registry::new(config.cgroup_root.clone(), config.freeze_spin_ms);
        Holder::new(Box::new(store), registry, config)
    }

    #[test]
    fn create_get_list_destroy_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut holder = holder_in(dir.path());
        let mut reaper = Reaper::new_detached();

        holder.create("a").expect("create");
        holder.create("b").expect("create");
        assert_eq!(holder.list(), vec!["a", "b"]);
        assert!(holder.get("a").is_some());

        holder.destroy("a", &mut reaper).expect("destroy");
        assert_eq!(holder.list(), vec!["b"]);
        assert!(holder.get("a").is_none());
    }

    #[test]
    fn create_rejects_collisions_and_bad_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut holder = holder_in(dir.path());

        holder.create("a").expect("create");
        assert_eq!(
            holder.create("a").expect_err("collision").kind(),
            ErrorKind::InvalidValue
        );
        assert_eq!(
            holder.create("not/valid").expect_err("bad name").kind(),
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn destroy_unknown_container_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut holder = holder_in(dir.path());
        let mut reaper = Reaper::new_detached();
        assert_eq!(
            holder.destroy("ghost", &mut reaper).expect_err("missing").kind(),
            ErrorKind::InvalidValue
        );
    }

    #[test]
    fn destroy_root_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut holder = holder_in(dir.path());
        let mut reaper = Reaper::new_detached();
        holder.create_root().expect("create root");

        holder.destroy(ROOT_CONTAINER, &mut reaper).expect("no-op");
        assert!(holder.get(ROOT_CONTAINER).is_some());
    }

    #[test]
    fn create_persists_and_destroy_unpersists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut holder = holder_in(dir.path());
        let mut reaper = Reaper::new_detached();

        holder.create("a").expect("create");
        assert!(dir.path().join("state/a.json").exists());

        holder.destroy("a", &mut reaper).expect("destroy");
        assert!(!dir.path().join("state/a.json").exists());
    }

    #[test]
    fn create_root_materializes_the_subtree_and_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut holder = holder_in(dir.path());

        holder.create_root().expect("create root");
        let root = holder.get(ROOT_CONTAINER).expect("root registered");
        assert_eq!(root.state(), ContainerState::Running);
        assert!(dir.path().join("cgroup/freezer/porto").is_dir());
        assert!(dir.path().join("cgroup/memory/porto").is_dir());
    }

    #[test]
    fn deliver_exit_status_without_claimant_reports_false() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut holder = holder_in(dir.path());
        holder.create("a").expect("create");
        assert!(!holder.deliver_exit_status(12345, 0));
    }

    #[test]
    fn restore_all_reinstates_membership() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let mut holder = holder_in(dir.path());
            holder.create("a").expect("create");
            holder
                .get_mut("a")
                .expect("a")
                .set_property("command", "/bin/sleep 60")
                .expect("set");
            holder.persist("a").expect("persist");
            holder.create("b").expect("create");
        }

        let mut holder = holder_in(dir.path());
        holder.restore_all().expect("restore");
        assert_eq!(holder.list(), vec!["a", "b"]);
        let a = holder.get("a").expect("a restored");
        assert_eq!(a.state(), ContainerState::Stopped);
        assert_eq!(
            a.get_property("command").expect("command"),
            "/bin/sleep 60"
        );
    }

    #[test]
    fn restore_all_keeps_container_with_dead_pid_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let holder = holder_in(dir.path());
            let mut record = Record::new();
            let _ = record.insert("command".into(), "/bin/sleep 60".into());
            let _ = record.insert(ROOT_PID_KEY.into(), (i32::MAX - 1).to_string());
            holder.store.save("crashed", &record).expect("seed record");
            std::fs::create_dir_all(dir.path().join("cgroup/freezer/porto")).expect("subtree");
            std::fs::create_dir_all(dir.path().join("cgroup/cpuacct/porto")).expect("subtree");
            std::fs::create_dir_all(dir.path().join("cgroup/memory/porto")).expect("subtree");
        }

        let mut holder = holder_in(dir.path());
        holder.restore_all().expect("restore");
        let c = holder.get("crashed").expect("still registered");
        assert_eq!(c.state(), ContainerState::Stopped);
        // The stale pid was dropped from the persisted record.
        let record = holder.store.load("crashed").expect("record");
        assert!(!record.contains_key(ROOT_PID_KEY));
    }
}
