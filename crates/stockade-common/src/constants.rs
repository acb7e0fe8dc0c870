//! System-wide constants and default paths.

/// Application name used in logs and state files.
pub const APP_NAME: &str = "stockade";

/// Binary name of the daemon.
pub const BIN_NAME: &str = "stockaded";

/// Default base directory for stockade data.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/stockade";

/// Default directory for persisted container records.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/stockade/state";

/// Default directory for per-task stdout/stderr files.
pub const DEFAULT_LOG_DIR: &str = "/var/lib/stockade/log";

/// Default daemon pid file.
pub const DEFAULT_PID_FILE: &str = "/run/stockaded.pid";

/// Base directory under which cgroup v1 controllers are mounted.
pub const CGROUP_FS_ROOT: &str = "/sys/fs/cgroup";

/// Fixed subtree component under each controller mount. The supervisor is
/// the sole writer below this directory.
pub const CGROUP_SUBTREE: &str = "porto";

/// Reserved name of the pseudo-container that owns the host itself.
pub const ROOT_CONTAINER: &str = "ROOT";

/// Maximum container name length.
pub const MAX_NAME_LEN: usize = 128;

/// Persisted record keys with this prefix are internal slots, not
/// user-visible properties.
pub const INTERNAL_PREFIX: &str = "_";

/// Internal record slot holding the container's root pid.
pub const ROOT_PID_KEY: &str = "_root_pid";

/// Internal record slot holding the creation timestamp (RFC 3339).
pub const CREATED_AT_KEY: &str = "_created_at";

/// How long a stop waits for SIGTERM to drain the freezer leaf, in ms.
pub const STOP_DRAIN_TIMEOUT_MS: u64 = 1000;

/// Upper bound on the freezer state spin, in ms.
pub const FREEZE_SPIN_TIMEOUT_MS: u64 = 1000;

/// Granularity of bounded polling loops, in ms.
pub const POLL_GRANULARITY_MS: u64 = 1;

/// Period of the heartbeat tick driving log rotation, in ms.
pub const HEARTBEAT_PERIOD_MS: u64 = 5000;

/// How long an unclaimed exit status stays in the ack-pending map, in ms.
pub const EXIT_ACK_TTL_MS: u64 = 1000;

/// Size above which a task log file is rotated.
pub const LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;

/// Upper bound on stdout/stderr readback through the data interface.
pub const DATA_READ_LIMIT: u64 = 64 * 1024;
