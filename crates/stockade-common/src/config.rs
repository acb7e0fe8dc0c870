//! Global configuration model for the stockade supervisor.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding persisted container records.
    pub state_dir: PathBuf,
    /// Directory holding per-task stdout/stderr files.
    pub log_dir: PathBuf,
    /// Base directory of the cgroup v1 controller mounts.
    pub cgroup_root: PathBuf,
    /// Heartbeat period in milliseconds.
    pub heartbeat_ms: u64,
    /// How long Stop waits for SIGTERM to drain the freezer leaf.
    pub stop_drain_ms: u64,
    /// Upper bound on the freezer state spin.
    pub freeze_spin_ms: u64,
    /// Size above which task log files are rotated.
    pub log_rotate_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(constants::DEFAULT_STATE_DIR),
            log_dir: PathBuf::from(constants::DEFAULT_LOG_DIR),
            cgroup_root: PathBuf::from(constants::CGROUP_FS_ROOT),
            heartbeat_ms: constants::HEARTBEAT_PERIOD_MS,
            stop_drain_ms: constants::STOP_DRAIN_TIMEOUT_MS,
            freeze_spin_ms: constants::FREEZE_SPIN_TIMEOUT_MS,
            log_rotate_bytes: constants::LOG_ROTATE_BYTES,
        }
    }
}
