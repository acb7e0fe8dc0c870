//! Task supervisor: one forked child process per container.
//!
//! `Task::start` forks the container's root process. The child joins its
//! cgroup leaves, applies credentials, working directory and optional new
//! root, redirects standard streams, and execs the user command. A
//! close-on-exec pipe reports launch failures back to the parent: success
//! is the pipe closing on exec, failure is an 8-byte `(step, errno)`
//! payload. After fork the child path uses only async-signal-safe calls —
//! raw syscalls on pre-allocated buffers, no logging, no allocation.

use std::ffi::CString;
use std::fs;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::unistd::{fork, pipe2, ForkResult, Group, User};
use stockade_cgroup::cgroup::Cgroup;
use stockade_cgroup::fsio;
use stockade_common::constants::DATA_READ_LIMIT;
use stockade_common::error::{Error, Result};
use stockade_common::types::ExitStatus;

use crate::proc;
use crate::spec::{parse_env, Spec};

/// Child-side launch step identifiers marshalled through the report pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
enum ChildStep {
    Cgroups = 1,
    Credentials = 2,
    Cwd = 3,
    Chroot = 4,
    Stdio = 5,
    Exec = 6,
}

impl ChildStep {
    fn name(self) -> &'static str {
        match self {
            Self::Cgroups => "cgroup join",
            Self::Credentials => "credentials",
            Self::Cwd => "chdir",
            Self::Chroot => "chroot",
            Self::Stdio => "stdio redirect",
            Self::Exec => "exec",
        }
    }

    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Self::Cgroups),
            2 => Some(Self::Credentials),
            3 => Some(Self::Cwd),
            4 => Some(Self::Chroot),
            5 => Some(Self::Stdio),
            6 => Some(Self::Exec),
            _ => None,
        }
    }
}

/// Splits a command line into words, honoring single quotes, double
/// quotes, and backslash escapes.
///
/// # Errors
///
/// Returns [`Error::InvalidValue`] on unterminated quoting.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            } else if c == '\\' && q == '"' {
                match chars.next() {
                    Some(next) => word.push(next),
                    None => {
                        return Err(Error::InvalidValue(format!(
                            "unterminated escape in command {command:?}"
                        )))
                    }
                }
            } else {
                word.push(c);
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                in_word = true;
            }
            '\\' => match chars.next() {
                Some(next) => {
                    word.push(next);
                    in_word = true;
                }
                None => {
                    return Err(Error::InvalidValue(format!(
                        "unterminated escape in command {command:?}"
                    )))
                }
            },
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                word.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err(Error::InvalidValue(format!(
            "unterminated quote in command {command:?}"
        )));
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

fn resolve_uid(user: &str) -> Result<u32> {
    if let Ok(raw) = user.parse::<u32>() {
        return Ok(raw);
    }
    match User::from_name(user) {
        Ok(Some(u)) => Ok(u.uid.as_raw()),
        Ok(None) => Err(Error::InvalidValue(format!("user not found: {user}"))),
        Err(e) => Err(Error::Unknown(format!("lookup user {user}: {e}"))),
    }
}

fn resolve_gid(group: &str) -> Result<u32> {
    if let Ok(raw) = group.parse::<u32>() {
        return Ok(raw);
    }
    match Group::from_name(group) {
        Ok(Some(g)) => Ok(g.gid.as_raw()),
        Ok(None) => Err(Error::InvalidValue(format!("group not found: {group}"))),
        Err(e) => Err(Error::Unknown(format!("lookup group {group}: {e}"))),
    }
}

/// Immutable launch environment of a task, fully resolved before fork.
#[derive(Debug, Clone)]
pub struct TaskEnv {
    argv: Vec<String>,
    cwd: PathBuf,
    root: Option<PathBuf>,
    uid: Option<u32>,
    gid: Option<u32>,
    env: Vec<(String, String)>,
}

impl TaskEnv {
    /// Resolves the launch environment from a container spec: tokenizes
    /// the command, resolves user and group names, parses the
    /// environment property.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidValue`] for an empty command, malformed
    /// quoting or environment entries, or unknown user/group names.
    pub fn from_spec(spec: &Spec) -> Result<Self> {
        let argv = split_command(&spec.get("command")?)?;
        if argv.is_empty() {
            return Err(Error::InvalidValue("container command is empty".into()));
        }
        let root_prop = spec.get("root")?;
        let user = spec.get("user")?;
        let group = spec.get("group")?;
        Ok(Self {
            argv,
            cwd: PathBuf::from(spec.get("cwd")?),
            root: (!root_prop.is_empty()).then(|| PathBuf::from(root_prop)),
            uid: if user.is_empty() {
                None
            } else {
                Some(resolve_uid(&user)?)
            },
            gid: if group.is_empty() {
                None
            } else {
                Some(resolve_gid(&group)?)
            },
            env: parse_env(&spec.get("env")?)?,
        })
    }

    /// First word of the command.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.argv[0]
    }
}

// Everything the child touches after fork, allocated in the parent.
struct ChildContext {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: CString,
    root: Option<CString>,
    uid: Option<u32>,
    gid: Option<u32>,
    task_files: Vec<CString>,
    devnull: CString,
    stdout: CString,
    stderr: CString,
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidValue(format!("NUL byte in path {}", path.display())))
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidValue(format!("NUL byte in {s:?}")))
}

/// The root process of one container.
#[derive(Debug)]
pub struct Task {
    env: TaskEnv,
    cgroups: Vec<Cgroup>,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    rotate_limit: u64,
    pid: i32,
    exit_status: Option<ExitStatus>,
}

impl Task {
    /// Builds a task from its resolved environment, the cgroup leaves it
    /// must join before exec, and the daemon-owned log file paths.
    #[must_use]
    pub fn new(
        env: TaskEnv,
        cgroups: Vec<Cgroup>,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
        rotate_limit: u64,
    ) -> Self {
        Self {
            env,
            cgroups,
            stdout_path,
            stderr_path,
            rotate_limit,
            pid: 0,
            exit_status: None,
        }
    }

    /// Pid of the root process, 0 if never started.
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Exit disposition, once known.
    #[must_use]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Records the reaped wait-status for this task.
    pub fn deliver_exit_status(&mut self, status: i32) {
        self.exit_status = Some(ExitStatus { status, error: 0 });
    }

    /// True while the root process has not been reaped and still exists.
    /// A zombie owned by another reaper (a restored orphan adopted by
    /// init) counts as not running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pid != 0
            && self.exit_status.is_none()
            && proc::exists(self.pid)
            && !proc::is_zombie(self.pid)
    }

    /// Rebinds this task to a pid recovered from persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if no such process exists any more.
    pub fn restore(&mut self, pid: i32) -> Result<()> {
        if !proc::exists(pid) {
            return Err(Error::Unknown(format!("task {pid} not found")));
        }
        tracing::info!(pid, ppid = proc::ppid(pid), "task restored");
        self.pid = pid;
        Ok(())
    }

    /// Forks and launches the root process. On return the child has
    /// either exec'd successfully or reported a launch failure that is
    /// recorded in [`Task::exit_status`].
    ///
    /// # Errors
    ///
    /// Returns an error if the fork machinery fails or the child
    /// reported a pre-exec failure.
    pub fn start(&mut self) -> Result<()> {
        self.prepare_stdio_files()?;
        let ctx = self.child_context()?;

        // The exec argument arrays are assembled before fork; the child
        // must not allocate.
        let mut argv_ptrs: Vec<*const libc::c_char> =
            ctx.argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> =
            ctx.envp.iter().map(|e| e.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        let (rd, wr) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| Error::Unknown(format!("pipe2: {e}")))?;

        // SAFETY: the child branch executes only async-signal-safe raw
        // syscalls on buffers prepared above, then execs or _exits.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let (step, errno) = unsafe { child_launch(&ctx, &argv_ptrs, &envp_ptrs) };
                report_failure(&wr, step, errno);
                unsafe { libc::_exit(127) }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(wr);
                self.pid = child.as_raw();
                self.await_child_report(rd)
            }
            Err(e) => Err(Error::Unknown(format!("fork: {e}"))),
        }
    }

    fn await_child_report(&mut self, rd: OwnedFd) -> Result<()> {
        let mut pipe = fs::File::from(rd);
        let mut buf = [0u8; 8];
        let mut filled = 0;
        while filled < buf.len() {
            match pipe.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Unknown(format!("read child report: {e}"))),
            }
        }
        if filled == 0 {
            // Write end closed on exec: the command is running.
            tracing::info!(pid = self.pid, program = self.env.program(), "task started");
            return Ok(());
        }

        // Launch failed before exec; reap the child synchronously so the
        // asynchronous reaper never sees this pid.
        let status = reap_blocking(self.pid);
        let (step, errno) = if filled == 8 {
            let step = i32::from_ne_bytes(buf[0..4].try_into().unwrap_or_default());
            let errno = i32::from_ne_bytes(buf[4..8].try_into().unwrap_or_default());
            (ChildStep::from_raw(step), errno)
        } else {
            (None, 0)
        };
        self.exit_status = Some(ExitStatus {
            status,
            error: errno,
        });
        self.pid = 0;
        let step_name = step.map_or("child report", ChildStep::name);
        Err(launch_error(step_name, errno))
    }

    fn prepare_stdio_files(&self) -> Result<()> {
        for path in [&self.stdout_path, &self.stderr_path] {
            if let Some(parent) = path.parent() {
                fsio::create_dir_all(parent)?;
            }
            let _ = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o644)
                .open(path)
                .map_err(|e| Error::io("open", path, e))?;
            if self.env.uid.is_some() || self.env.gid.is_some() {
                std::os::unix::fs::chown(path, self.env.uid, self.env.gid)
                    .map_err(|e| Error::io("chown", path, e))?;
            }
        }
        Ok(())
    }

    fn child_context(&self) -> Result<ChildContext> {
        let argv = self
            .env
            .argv
            .iter()
            .map(|a| cstring(a))
            .collect::<Result<Vec<_>>>()?;
        let envp = self
            .env
            .env
            .iter()
            .map(|(k, v)| cstring(&format!("{k}={v}")))
            .collect::<Result<Vec<_>>>()?;
        let task_files = self
            .cgroups
            .iter()
            .map(|cg| path_cstring(&cg.path().join("tasks")))
            .collect::<Result<Vec<_>>>()?;
        Ok(ChildContext {
            program: argv[0].clone(),
            argv,
            envp,
            cwd: path_cstring(&self.env.cwd)?,
            root: self
                .env
                .root
                .as_deref()
                .map(path_cstring)
                .transpose()?,
            uid: self.env.uid,
            gid: self.env.gid,
            task_files,
            devnull: cstring("/dev/null")?,
            stdout: path_cstring(&self.stdout_path)?,
            stderr: path_cstring(&self.stderr_path)?,
        })
    }

    /// Bounded readback of the task's stdout file. Never fails; a
    /// missing or unreadable file reads as empty.
    #[must_use]
    pub fn stdout(&self) -> String {
        fsio::read_tail(&self.stdout_path, DATA_READ_LIMIT).unwrap_or_default()
    }

    /// Bounded readback of the task's stderr file.
    #[must_use]
    pub fn stderr(&self) -> String {
        fsio::read_tail(&self.stderr_path, DATA_READ_LIMIT).unwrap_or_default()
    }

    /// Rotates any log file that exceeds the configured cap: the first
    /// half is hole-punched in place; if the filesystem cannot punch
    /// holes the file is truncated to zero.
    pub fn rotate(&self) {
        for path in [&self.stdout_path, &self.stderr_path] {
            let Ok(meta) = fs::metadata(path) else {
                continue;
            };
            if meta.len() <= self.rotate_limit {
                continue;
            }
            let Ok(file) = fs::OpenOptions::new().write(true).open(path) else {
                continue;
            };
            let half = (meta.len() / 2) as libc::off_t;
            let punched = unsafe {
                libc::fallocate(
                    file.as_raw_fd(),
                    libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                    0,
                    half,
                )
            } == 0;
            if !punched {
                tracing::debug!(path = %path.display(), "hole punch unsupported, truncating");
                let _ = file.set_len(0);
            }
        }
    }
}

fn launch_error(step: &str, errno: i32) -> Error {
    if errno == 0 {
        Error::Unknown(format!("task launch failed at {step}"))
    } else {
        let source = std::io::Error::from_raw_os_error(errno);
        Error::Unknown(format!("task launch failed at {step}: {source}"))
    }
}

fn report_failure(wr: &OwnedFd, step: ChildStep, errno: i32) {
    let mut payload = [0u8; 8];
    payload[0..4].copy_from_slice(&(step as i32).to_ne_bytes());
    payload[4..8].copy_from_slice(&errno.to_ne_bytes());
    // SAFETY: plain write(2) on the still-open pipe fd.
    unsafe {
        let _ = libc::write(wr.as_raw_fd(), payload.as_ptr().cast(), payload.len());
    }
}

fn reap_blocking(pid: i32) -> i32 {
    let mut status = 0;
    loop {
        // SAFETY: waitpid with a valid out-pointer.
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };
        if r == pid {
            return status;
        }
        if r < 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return -1;
        }
    }
}

fn format_pid(buf: &mut [u8; 16], pid: u32) -> usize {
    let mut n = pid;
    let mut digits = 0;
    loop {
        buf[15 - digits] = b'0' + (n % 10) as u8;
        digits += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    buf.copy_within(16 - digits..16, 0);
    digits
}

unsafe fn write_all_fd(fd: libc::c_int, bytes: &[u8]) -> bool {
    let mut off = 0;
    while off < bytes.len() {
        let r = libc::write(fd, bytes[off..].as_ptr().cast(), bytes.len() - off);
        if r <= 0 {
            return false;
        }
        off += r as usize;
    }
    true
}

// Runs in the forked child. Returns the failing step and errno; on
// success it does not return (execvpe replaces the image).
unsafe fn child_launch(
    ctx: &ChildContext,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> (ChildStep, i32) {
    let errno = || std::io::Error::last_os_error().raw_os_error().unwrap_or(0);

    // Join every cgroup leaf before anything else so the exec'd command
    // is accounted from its first instruction.
    let pid = libc::getpid() as u32;
    let mut pid_buf = [0u8; 16];
    let pid_len = format_pid(&mut pid_buf, pid);
    for tasks in &ctx.task_files {
        let fd = libc::open(tasks.as_ptr(), libc::O_WRONLY);
        if fd < 0 {
            return (ChildStep::Cgroups, errno());
        }
        let ok = write_all_fd(fd, &pid_buf[..pid_len]);
        libc::close(fd);
        if !ok {
            return (ChildStep::Cgroups, errno());
        }
    }

    if let Some(gid) = ctx.gid {
        let gids = [gid as libc::gid_t];
        if libc::setgroups(1, gids.as_ptr()) != 0 || libc::setgid(gids[0]) != 0 {
            return (ChildStep::Credentials, errno());
        }
    }
    if let Some(uid) = ctx.uid {
        if libc::setuid(uid as libc::uid_t) != 0 {
            return (ChildStep::Credentials, errno());
        }
    }

    if libc::chdir(ctx.cwd.as_ptr()) != 0 {
        return (ChildStep::Cwd, errno());
    }

    if let Some(root) = &ctx.root {
        if libc::chroot(root.as_ptr()) != 0 || libc::chdir(c"/".as_ptr()) != 0 {
            return (ChildStep::Chroot, errno());
        }
    }

    let devnull = libc::open(ctx.devnull.as_ptr(), libc::O_RDONLY);
    let out = libc::open(ctx.stdout.as_ptr(), libc::O_WRONLY | libc::O_APPEND);
    let err = libc::open(ctx.stderr.as_ptr(), libc::O_WRONLY | libc::O_APPEND);
    if devnull < 0 || out < 0 || err < 0 {
        return (ChildStep::Stdio, errno());
    }
    if libc::dup2(devnull, 0) < 0 || libc::dup2(out, 1) < 0 || libc::dup2(err, 2) < 0 {
        return (ChildStep::Stdio, errno());
    }

    libc::execvpe(ctx.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    (ChildStep::Exec, errno())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_in(dir: &Path, command: &str) -> Task {
        let mut spec = Spec::new();
        spec.set("command", command).expect("set command");
        let env = TaskEnv::from_spec(&spec).expect("env");
        Task::new(
            env,
            Vec::new(),
            dir.join("t.stdout"),
            dir.join("t.stderr"),
            1024 * 1024,
        )
    }

    #[test]
    fn split_command_plain_words() {
        assert_eq!(
            split_command("/bin/sleep 60").expect("split"),
            vec!["/bin/sleep", "60"]
        );
    }

    #[test]
    fn split_command_honors_quotes() {
        assert_eq!(
            split_command("/bin/sh -c 'exit 3'").expect("split"),
            vec!["/bin/sh", "-c", "exit 3"]
        );
        assert_eq!(
            split_command("echo \"a b\" c").expect("split"),
            vec!["echo", "a b", "c"]
        );
        assert_eq!(
            split_command("trap '' TERM").expect("split"),
            vec!["trap", "", "TERM"]
        );
    }

    #[test]
    fn split_command_honors_escapes() {
        assert_eq!(
            split_command("echo a\\ b").expect("split"),
            vec!["echo", "a b"]
        );
    }

    #[test]
    fn split_command_rejects_unterminated_quote() {
        assert!(split_command("sh -c 'oops").is_err());
    }

    #[test]
    fn env_requires_nonempty_command() {
        let spec = Spec::new();
        assert!(TaskEnv::from_spec(&spec).is_err());
    }

    #[test]
    fn env_resolves_numeric_uid_gid() {
        let mut spec = Spec::new();
        spec.set("command", "/bin/true").expect("set");
        spec.set("user", "12345").expect("set");
        spec.set("group", "54321").expect("set");
        let env = TaskEnv::from_spec(&spec).expect("env");
        assert_eq!(env.uid, Some(12345));
        assert_eq!(env.gid, Some(54321));
    }

    #[test]
    fn unstarted_task_is_not_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = task_in(dir.path(), "/bin/true");
        assert_eq!(task.pid(), 0);
        assert!(!task.is_running());
        assert!(task.stdout().is_empty());
    }

    #[test]
    fn start_runs_command_and_captures_stdout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut task = task_in(dir.path(), "/bin/echo hello_from_task");
        task.start().expect("start");
        assert!(task.pid() > 0);

        let status = reap_blocking(task.pid());
        task.deliver_exit_status(status);
        assert!(!task.is_running());
        assert_eq!(task.exit_status().expect("status").status, 0);
        // stdout is written asynchronously by the child before it exits.
        assert!(task.stdout().contains("hello_from_task"));
    }

    #[test]
    fn start_reports_exec_failure_errno() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut task = task_in(dir.path(), "/definitely/not/a/binary");
        let err = task.start().expect_err("exec must fail");
        let status = task.exit_status().expect("failure recorded");
        assert_eq!(status.error, libc::ENOENT);
        assert_eq!(task.pid(), 0);
        assert!(format!("{err}").contains("exec"));
    }

    #[test]
    fn restore_rejects_dead_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut task = task_in(dir.path(), "/bin/true");
        // Pid from a wildly out-of-range value cannot exist.
        assert!(task.restore(i32::MAX - 1).is_err());
    }

    #[test]
    fn restore_accepts_live_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut task = task_in(dir.path(), "/bin/true");
        let own = std::process::id() as i32;
        task.restore(own).expect("restore to a live pid");
        assert!(task.is_running());
    }

    #[test]
    fn rotate_leaves_small_files_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = task_in(dir.path(), "/bin/true");
        std::fs::write(dir.path().join("t.stdout"), "short").expect("seed");
        task.rotate();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("t.stdout")).expect("read"),
            "short"
        );
    }

    #[test]
    fn rotate_shrinks_oversized_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut task = task_in(dir.path(), "/bin/true");
        task.rotate_limit = 16;
        std::fs::write(dir.path().join("t.stdout"), "x".repeat(64)).expect("seed");
        task.rotate();
        // Either the first half was punched out or the file was truncated;
        // both stop unbounded growth.
        let meta = std::fs::metadata(dir.path().join("t.stdout")).expect("stat");
        assert!(meta.len() == 64 || meta.len() == 0);
    }

    #[test]
    fn format_pid_renders_decimal() {
        let mut buf = [0u8; 16];
        let len = format_pid(&mut buf, 40961);
        assert_eq!(&buf[..len], b"40961");
        let len = format_pid(&mut buf, 7);
        assert_eq!(&buf[..len], b"7");
    }
}
