//! The single-threaded dispatcher that owns the whole runtime.
//!
//! Exactly one supervisor advances container state at a time. Its event
//! sources are incoming operations (the RPC boundary), the SIGCHLD
//! self-pipe, and the heartbeat timer. Every operation entry first drains
//! pending exits and reconciles stale states, so reads afterwards are
//! pure observers.

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use stockade_cgroup::fsio;
use stockade_cgroup::subsystem::{Registry, Subsystem};
use stockade_common::config::Config;
use stockade_common::constants::ROOT_CONTAINER;
use stockade_common::error::{Error, Result};

use crate::holder::Holder;
use crate::reaper::{self, Reaper};
use crate::store::FileStore;

/// Owner of the registry, the reaper, and the dispatch loop.
pub struct Supervisor {
    holder: Holder,
    reaper: Reaper,
    config: Config,
}

impl Supervisor {
    /// Brings up the runtime: verifies (or creates) the controller
    /// mounts, opens the persistence store, installs signal plumbing,
    /// starts the host pseudo-container, and restores every persisted
    /// container.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the above fails; the daemon cannot run
    /// without a complete bring-up.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Registry::new(config.cgroup_root.clone(), config.freeze_spin_ms);
        for subsystem in Subsystem::ALL {
            registry.ensure_mounted(subsystem)?;
        }
        fsio::create_dir_all(&config.log_dir)?;

        let store = FileStore::open(config.state_dir.clone())?;
        let mut holder = Holder::new(Box::new(store), registry, config.clone());
        let reaper = Reaper::install()?;

        holder.create_root()?;
        holder.restore_all()?;

        Ok(Self {
            holder,
            reaper,
            config,
        })
    }

    // Dispatcher entry: collect exits first so reconciliation below never
    // races our own zombies, then force stale Running states down.
    fn enter(&mut self) {
        self.reaper.drain(&mut self.holder);
        self.holder.reconcile_all();
    }

    fn container_missing(name: &str) -> Error {
        Error::InvalidValue(format!("container {name} does not exist"))
    }

    /// Creates a container.
    ///
    /// # Errors
    ///
    /// See [`Holder::create`].
    pub fn create(&mut self, name: &str) -> Result<()> {
        self.enter();
        self.holder.create(name)
    }

    /// Destroys a container, stopping it first if needed.
    ///
    /// # Errors
    ///
    /// See [`Holder::destroy`].
    pub fn destroy(&mut self, name: &str) -> Result<()> {
        self.enter();
        self.holder.destroy(name, &mut self.reaper)
    }

    /// Starts a container and persists its root pid.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for unknown names or the start
    /// error.
    pub fn start(&mut self, name: &str) -> Result<()> {
        self.enter();
        let container = self
            .holder
            .get_mut(name)
            .ok_or_else(|| Self::container_missing(name))?;
        container.start()?;
        self.holder.persist(name)
    }

    /// Stops a container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for unknown names or the stop
    /// error.
    pub fn stop(&mut self, name: &str) -> Result<()> {
        self.enter();
        let container = self
            .holder
            .get_mut(name)
            .ok_or_else(|| Self::container_missing(name))?;
        container.stop(&mut self.reaper)?;
        self.holder.persist(name)
    }

    /// Pauses (freezes) a container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for unknown names or the freezer
    /// error.
    pub fn pause(&mut self, name: &str) -> Result<()> {
        self.enter();
        self.holder
            .get_mut(name)
            .ok_or_else(|| Self::container_missing(name))?
            .pause()
    }

    /// Resumes (thaws) a container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for unknown names or the freezer
    /// error.
    pub fn resume(&mut self, name: &str) -> Result<()> {
        self.enter();
        self.holder
            .get_mut(name)
            .ok_or_else(|| Self::container_missing(name))?
            .resume()
    }

    /// Reads a container property.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for unknown names, plus the
    /// container-level gates.
    pub fn get_property(&mut self, name: &str, property: &str) -> Result<String> {
        self.enter();
        self.holder
            .get(name)
            .ok_or_else(|| Self::container_missing(name))?
            .get_property(property)
    }

    /// Sets a container property and persists the record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for unknown names, plus the
    /// container-level gates.
    pub fn set_property(&mut self, name: &str, property: &str, value: &str) -> Result<()> {
        self.enter();
        self.holder
            .get_mut(name)
            .ok_or_else(|| Self::container_missing(name))?
            .set_property(property, value)?;
        self.holder.persist(name)
    }

    /// Reads a typed data item.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for unknown names, plus the
    /// container-level gates.
    pub fn get_data(&mut self, name: &str, key: &str) -> Result<String> {
        self.enter();
        self.holder
            .get(name)
            .ok_or_else(|| Self::container_missing(name))?
            .get_data(key)
    }

    /// Names of every registered container.
    pub fn list(&mut self) -> Vec<String> {
        self.enter();
        self.holder.list()
    }

    /// Runs the dispatch loop until an orderly shutdown is requested:
    /// poll the reap pipe with the heartbeat period, drain exits as they
    /// arrive, rotate logs on each tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll machinery fails.
    pub fn run(&mut self) -> Result<()> {
        let timeout_ms = i32::try_from(self.config.heartbeat_ms).unwrap_or(i32::MAX);
        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);
        loop {
            let timed_out = {
                let Some(fd) = self.reaper.wake_fd() else {
                    return Err(Error::Unknown("reaper has no wake pipe".into()));
                };
                let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
                match poll(&mut fds, timeout) {
                    Ok(0) => true,
                    Ok(_) => false,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => return Err(Error::Unknown(format!("poll: {e}"))),
                }
            };

            self.reaper.drain(&mut self.holder);
            if reaper::shutdown_requested() {
                tracing::info!("shutdown requested");
                self.shutdown();
                return Ok(());
            }
            if timed_out {
                self.holder.heartbeat();
                self.holder.reconcile_all();
                self.reaper.purge();
            }
        }
    }

    // Orderly shutdown: stop every container (resuming paused ones so no
    // frozen process survives) and flush their records.
    fn shutdown(&mut self) {
        for name in self.holder.list() {
            if name == ROOT_CONTAINER {
                continue;
            }
            if let Some(container) = self.holder.get_mut(&name) {
                container.prepare_destroy(&mut self.reaper);
            }
            if let Err(e) = self.holder.persist(&name) {
                tracing::warn!(name, error = %e, "persist during shutdown failed");
            }
        }
        tracing::info!("shutdown complete");
    }
}
