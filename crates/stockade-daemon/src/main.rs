//! # stockaded — container supervisor daemon
//!
//! Brings up the supervisor core (cgroup mounts, persistence, signal
//! plumbing, the host pseudo-container, restore of persisted containers)
//! and runs the single-threaded dispatch loop until SIGTERM/SIGINT.
//!
//! The management RPC surface is wired onto [`Supervisor`] by the
//! transport layer; this binary owns process-level concerns only.

mod pidfile;

use std::path::PathBuf;

use clap::Parser;
use stockade_common::config::Config;
use stockade_common::constants;
use stockade_runtime::supervisor::Supervisor;

use crate::pidfile::PidFile;

/// stockaded — Linux container supervisor.
#[derive(Parser, Debug)]
#[command(name = constants::BIN_NAME, version, about, long_about = None)]
struct Cli {
    /// Directory for persisted container records.
    #[arg(long, default_value = constants::DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Directory for per-task stdout/stderr files.
    #[arg(long, default_value = constants::DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Base directory of the cgroup v1 controller mounts.
    #[arg(long, default_value = constants::CGROUP_FS_ROOT)]
    cgroup_root: PathBuf,

    /// Pid file path.
    #[arg(long, default_value = constants::DEFAULT_PID_FILE)]
    pid_file: PathBuf,

    /// Heartbeat period in milliseconds (log rotation, reconciliation).
    #[arg(long, default_value_t = constants::HEARTBEAT_PERIOD_MS)]
    heartbeat_ms: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config {
        state_dir: cli.state_dir,
        log_dir: cli.log_dir,
        cgroup_root: cli.cgroup_root,
        heartbeat_ms: cli.heartbeat_ms,
        ..Config::default()
    };

    let pid_file = PidFile::claim(&cli.pid_file)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting");

    let result = Supervisor::new(config).and_then(|mut supervisor| supervisor.run());

    pid_file.release();
    result?;
    tracing::info!("exited cleanly");
    Ok(())
}
