//! Filesystem primitive: knob I/O, pid-list parsing, directory lifecycle,
//! atomic replacement, and controller mounts.
//!
//! All higher layers go through this module so that errno classification
//! (`ENOSPC`, `EBUSY`, `EACCES`/`EPERM`) happens in exactly one place.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use nix::mount::{mount, umount, MsFlags};
use stockade_common::error::{Error, Result};

/// Reads a file to a string.
///
/// # Errors
///
/// Returns a classified error if the file cannot be read.
pub fn read_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::io("read", path, e))
}

/// Reads a file to a string, treating a missing file as `None`.
///
/// # Errors
///
/// Returns a classified error on any failure other than `ENOENT`.
pub fn read_string_opt(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::io("read", path, e)),
    }
}

/// Reads a knob file and parses its trimmed contents as `u64`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not hold a number.
pub fn read_u64(path: &Path) -> Result<u64> {
    let s = read_string(path)?;
    s.trim()
        .parse()
        .map_err(|_| Error::Unknown(format!("parse u64 from {}: {s:?}", path.display())))
}

/// Writes `value` to a knob file. When `append` is false the file is
/// opened with truncation semantics.
///
/// # Errors
///
/// Returns a classified error if the file cannot be opened or written.
pub fn write_string(path: &Path, value: &str, append: bool) -> Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true);
    if append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    let mut file = opts.open(path).map_err(|e| Error::io("open", path, e))?;
    file.write_all(value.as_bytes())
        .map_err(|e| Error::io("write", path, e))
}

/// Parses a `tasks` / `cgroup.procs` style file into pids, in file order,
/// without deduplication. A missing file reads as empty.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read_pids(path: &Path) -> Result<Vec<i32>> {
    let Some(s) = read_string_opt(path)? else {
        return Ok(Vec::new());
    };
    let mut pids = Vec::new();
    for line in s.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let pid = line
            .parse()
            .map_err(|_| Error::Unknown(format!("parse pid from {}: {line:?}", path.display())))?;
        pids.push(pid);
    }
    Ok(pids)
}

/// Creates a directory. Fails if it already exists.
///
/// # Errors
///
/// Returns a classified error, `EEXIST` included as `Unknown`.
pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir(path).map_err(|e| Error::io("mkdir", path, e))
}

/// Creates a directory and any missing parents, tolerating existence.
///
/// # Errors
///
/// Returns a classified error if creation fails.
pub fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io("mkdir", path, e))
}

/// Removes an empty directory. A missing directory is not an error.
///
/// # Errors
///
/// Returns a classified error (`EBUSY` surfaces as [`Error::Busy`]) if
/// removal fails for any reason other than `ENOENT`.
pub fn remove_dir(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io("rmdir", path, e)),
    }
}

/// Atomically replaces `path` with `contents` by writing a sibling temp
/// file and renaming it into place.
///
/// # Errors
///
/// Returns a classified error if the write or rename fails.
pub fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).map_err(|e| Error::io("write", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io("rename", path, e))
}

/// Reads at most the last `limit` bytes of a file. A missing file reads
/// as empty; this never fails for readback purposes other than hard I/O
/// errors on an existing file.
///
/// # Errors
///
/// Returns a classified error if an existing file cannot be read.
pub fn read_tail(path: &Path, limit: u64) -> Result<String> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(Error::io("open", path, e)),
    };
    let len = file
        .metadata()
        .map_err(|e| Error::io("stat", path, e))?
        .len();
    if len > limit {
        file.seek(SeekFrom::End(-(limit as i64)))
            .map_err(|e| Error::io("seek", path, e))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .map_err(|e| Error::io("read", path, e))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Mounts a cgroup v1 controller hierarchy at `target`.
///
/// # Errors
///
/// Returns a classified error if the mount syscall fails.
pub fn mount_cgroup(controller: &str, target: &Path) -> Result<()> {
    create_dir_all(target)?;
    mount(
        Some("cgroup"),
        target,
        Some("cgroup"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        Some(controller),
    )
    .map_err(|e| Error::io("mount", target, e.into()))?;
    tracing::info!(controller, target = %target.display(), "controller hierarchy mounted");
    Ok(())
}

/// Unmounts a controller hierarchy. `EBUSY` surfaces as [`Error::Busy`].
///
/// # Errors
///
/// Returns a classified error if the umount syscall fails.
pub fn umount_cgroup(target: &Path) -> Result<()> {
    umount(target).map_err(|e| Error::io("umount", target, e.into()))
}
