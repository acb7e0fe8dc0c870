//! SIGCHLD-driven exit collection.
//!
//! The reaper is the single logical owner of SIGCHLD. The handler does
//! one thing only: write a byte into a lock-free self-pipe. The
//! dispatcher later drains the pipe and collects every exited child with
//! non-blocking `waitpid`, routing each `(pid, status)` through the
//! registry. Statuses nobody claims are parked briefly so a racing stop
//! can still acknowledge them, then discarded.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe2;
use stockade_common::constants::EXIT_ACK_TTL_MS;
use stockade_common::error::{Error, Result};

use crate::holder::Holder;
use crate::proc;

// The write end of the self-pipe, reachable from the signal handlers.
// Signal handlers touch nothing else.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn wake() {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        // SAFETY: write(2) is async-signal-safe; the fd outlives the
        // process once installed.
        unsafe {
            let _ = libc::write(fd, [1u8].as_ptr().cast(), 1);
        }
    }
}

extern "C" fn on_sigchld(_: libc::c_int) {
    wake();
}

extern "C" fn on_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
    wake();
}

/// True once SIGTERM or SIGINT has been received.
#[must_use]
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

#[derive(Debug)]
struct PendingExit {
    pid: i32,
    status: i32,
    at: Instant,
}

/// Collects exited children and routes their statuses.
#[derive(Debug)]
pub struct Reaper {
    wake_rd: Option<OwnedFd>,
    pending: Vec<PendingExit>,
    ack_ttl: Duration,
}

impl Reaper {
    /// Installs the SIGCHLD/SIGTERM/SIGINT handlers and the self-pipe,
    /// returning the reaper that owns the read end.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe or the handlers cannot be set up.
    pub fn install() -> Result<Self> {
        let (rd, wr) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
            .map_err(|e| Error::Unknown(format!("pipe2: {e}")))?;
        // The write end is handed to the signal handlers for the life of
        // the process.
        WAKE_FD.store(wr.into_raw_fd(), Ordering::Relaxed);

        let chld = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        let term = SigAction::new(
            SigHandler::Handler(on_shutdown),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handlers only store to an atomic and write(2) to a
        // pre-registered fd.
        unsafe {
            sigaction(Signal::SIGCHLD, &chld)
                .map_err(|e| Error::Unknown(format!("sigaction(SIGCHLD): {e}")))?;
            sigaction(Signal::SIGTERM, &term)
                .map_err(|e| Error::Unknown(format!("sigaction(SIGTERM): {e}")))?;
            sigaction(Signal::SIGINT, &term)
                .map_err(|e| Error::Unknown(format!("sigaction(SIGINT): {e}")))?;
        }

        Ok(Self {
            wake_rd: Some(rd),
            pending: Vec::new(),
            ack_ttl: Duration::from_millis(EXIT_ACK_TTL_MS),
        })
    }

    /// A reaper without signal plumbing, for exercising delivery and
    /// acknowledgement logic in isolation.
    #[must_use]
    pub fn new_detached() -> Self {
        Self {
            wake_rd: None,
            pending: Vec::new(),
            ack_ttl: Duration::from_millis(EXIT_ACK_TTL_MS),
        }
    }

    /// Read end of the self-pipe, for the dispatcher's poll.
    #[must_use]
    pub fn wake_fd(&self) -> Option<BorrowedFd<'_>> {
        self.wake_rd.as_ref().map(AsFd::as_fd)
    }

    fn drain_wake_pipe(&self) {
        let Some(rd) = &self.wake_rd else { return };
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: non-blocking read(2) on our own pipe.
            let n = unsafe { libc::read(rd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Drains the self-pipe and collects every exited child, forwarding
    /// each status to the registry. Unclaimed statuses are parked in the
    /// ack-pending map.
    pub fn drain(&mut self, holder: &mut Holder) {
        self.drain_wake_pipe();
        while let Some((pid, status)) = wait_any() {
            if holder.deliver_exit_status(pid, status) {
                continue;
            }
            tracing::debug!(pid, status = %proc::format_exit_status(status),
                "unclaimed exit status parked");
            self.pending.push(PendingExit {
                pid,
                status,
                at: Instant::now(),
            });
        }
        self.purge();
    }

    /// Drops the parked status for `pid`, if any. Called by stop so a
    /// SIGCHLD racing the kill cannot leave a stale result behind.
    pub fn ack(&mut self, pid: i32) {
        self.pending.retain(|p| p.pid != pid);
    }

    /// Discards parked statuses older than the acknowledgement window.
    pub fn purge(&mut self) {
        let ttl = self.ack_ttl;
        self.pending.retain(|p| p.at.elapsed() < ttl);
    }

    #[cfg(test)]
    fn park(&mut self, pid: i32, status: i32, at: Instant) {
        self.pending.push(PendingExit { pid, status, at });
    }

    #[cfg(test)]
    fn parked(&self) -> Vec<i32> {
        self.pending.iter().map(|p| p.pid).collect()
    }
}

// Non-blocking wait for any child; returns the raw wait-status so exit
// codes and signals survive readback verbatim.
fn wait_any() -> Option<(i32, i32)> {
    let mut status = 0;
    loop {
        // SAFETY: waitpid with a valid out-pointer.
        let r = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if r > 0 {
            return Some((r, status));
        }
        if r == 0 {
            return None;
        }
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        // ECHILD: nothing left to reap.
        return None;
    }
}
