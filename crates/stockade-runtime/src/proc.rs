//! `/proc` readback helpers for pid liveness checks.

use std::path::Path;

use nix::sys::signal::kill;
use nix::unistd::Pid;

/// True iff a process with this pid exists (zombies included).
#[must_use]
pub fn exists(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // EPERM means the pid exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn stat_field(pid: i32, index: usize) -> Option<String> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field is parenthesized and may itself contain spaces;
    // everything after the closing paren is space-separated.
    let rest = stat.rsplit_once(')')?.1;
    rest.split_whitespace().nth(index).map(str::to_string)
}

/// True iff the process is a zombie awaiting reap.
#[must_use]
pub fn is_zombie(pid: i32) -> bool {
    stat_field(pid, 0).is_some_and(|state| state == "Z")
}

/// Parent pid as reported by `/proc/<pid>/stat`, 0 when unreadable.
#[must_use]
pub fn ppid(pid: i32) -> i32 {
    stat_field(pid, 1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Renders a raw wait-status for log lines.
#[must_use]
pub fn format_exit_status(status: i32) -> String {
    if libc::WIFSIGNALED(status) {
        format!("exit signal: {}", libc::WTERMSIG(status))
    } else {
        format!("exit code: {}", libc::WEXITSTATUS(status))
    }
}

/// True iff `path` (a `/proc/<pid>` style directory) is present.
#[must_use]
pub fn proc_dir_exists(pid: i32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_exists_and_is_not_zombie() {
        let pid = std::process::id() as i32;
        assert!(exists(pid));
        assert!(proc_dir_exists(pid));
        assert!(!is_zombie(pid));
    }

    #[test]
    fn ppid_of_self_matches_getppid() {
        let pid = std::process::id() as i32;
        assert_eq!(ppid(pid), nix::unistd::getppid().as_raw());
    }

    #[test]
    fn nonexistent_pid_does_not_exist() {
        // Pid 0 and negative pids are never valid targets here.
        assert!(!exists(0));
        assert!(!exists(-1));
    }

    #[test]
    fn format_normal_exit() {
        // Raw wait-status for a normal exit with code 3.
        let status = 3 << 8;
        assert_eq!(format_exit_status(status), "exit code: 3");
    }

    #[test]
    fn format_signal_exit() {
        // Raw wait-status for death by SIGKILL.
        let status = libc::SIGKILL;
        assert_eq!(format_exit_status(status), "exit signal: 9");
    }
}
