//! Domain primitive types used across the stockade workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_NAME_LEN, ROOT_CONTAINER};
use crate::error::{Error, Result};

/// Validated container name.
///
/// Names are non-empty, at most 128 characters of `[A-Za-z0-9_]`. The
/// reserved name `ROOT` denotes the implicit top-level pseudo-container
/// that owns the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerName(String);

impl ContainerName {
    /// Parses and validates a container name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] if the name is empty, too long, or
    /// contains characters outside `[A-Za-z0-9_]`.
    pub fn parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name == ROOT_CONTAINER {
            return Ok(Self(name));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidValue(format!(
                "invalid container name {name:?}"
            )));
        }
        if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(Error::InvalidValue(format!(
                "invalid container name {name:?}"
            )));
        }
        Ok(Self(name))
    }

    /// Returns the name of the host pseudo-container.
    #[must_use]
    pub fn root() -> Self {
        Self(ROOT_CONTAINER.to_string())
    }

    /// True for the host pseudo-container.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_CONTAINER
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// No task, no cgroup leaves.
    Stopped,
    /// Root task launched and believed alive.
    Running,
    /// Freezer leaf is FROZEN.
    Paused,
    /// Root task has exited; leaves are retained for readback.
    Dead,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Exit disposition of a task.
///
/// `status` is the raw wait-status as reported by `wait(2)`; `error` is
/// non-zero when the supervisor itself could not launch the task, carrying
/// the errno marshalled from the child side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    /// Raw wait-status.
    pub status: i32,
    /// Launch errno, 0 when the task actually ran.
    pub error: i32,
}
