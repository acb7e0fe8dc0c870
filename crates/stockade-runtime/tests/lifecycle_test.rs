//! Supervisor-level lifecycle tests against a simulated cgroup layout.
//!
//! A tempdir stands in for `/sys/fs/cgroup`: controller directories with
//! `tasks` files satisfy the mount probe, and knob reads/writes work on
//! plain files. Scenarios that need a real kernel hierarchy live in
//! `e2e_root_test.rs` behind `#[ignore]`.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;

use stockade_common::config::Config;
use stockade_common::constants::ROOT_PID_KEY;
use stockade_common::error::ErrorKind;
use stockade_runtime::store::{FileStore, Record, Store};
use stockade_runtime::supervisor::Supervisor;

fn test_config(dir: &Path) -> Config {
    Config {
        state_dir: dir.join("state"),
        log_dir: dir.join("log"),
        cgroup_root: dir.join("cgroup"),
        heartbeat_ms: 100,
        stop_drain_ms: 10,
        freeze_spin_ms: 10,
        log_rotate_bytes: 1024,
    }
}

fn seed_controllers(dir: &Path) {
    for controller in ["freezer", "cpuacct", "memory"] {
        let root = dir.join("cgroup").join(controller);
        std::fs::create_dir_all(&root).expect("controller dir");
        std::fs::write(root.join("tasks"), "").expect("tasks file");
    }
}

fn supervisor_in(dir: &Path) -> Supervisor {
    seed_controllers(dir);
    Supervisor::new(test_config(dir)).expect("supervisor bring-up")
}

#[test]
fn bringup_registers_a_running_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sup = supervisor_in(dir.path());

    assert_eq!(sup.list(), vec!["ROOT"]);
    assert_eq!(sup.get_data("ROOT", "state").expect("state"), "running");
    assert!(dir.path().join("cgroup/freezer/porto").is_dir());

    // Destroying ROOT is a no-op.
    sup.destroy("ROOT").expect("no-op");
    assert_eq!(sup.list(), vec!["ROOT"]);
}

#[test]
fn create_property_roundtrip_and_destroy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sup = supervisor_in(dir.path());

    sup.create("a").expect("create");
    assert_eq!(sup.list(), vec!["ROOT", "a"]);

    sup.set_property("a", "command", "/bin/sh -c 'exit 3'")
        .expect("set command");
    assert_eq!(
        sup.get_property("a", "command").expect("get"),
        "/bin/sh -c 'exit 3'"
    );
    // Unset properties read their defaults.
    assert_eq!(sup.get_property("a", "cwd").expect("cwd"), "/");
    assert_eq!(
        sup.get_property("a", "memory_limit").expect("limit"),
        "-1"
    );
    assert!(dir.path().join("state/a.json").exists());

    sup.destroy("a").expect("destroy");
    assert_eq!(sup.list(), vec!["ROOT"]);
    assert!(!dir.path().join("state/a.json").exists());
}

#[test]
fn operations_on_missing_containers_fail() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sup = supervisor_in(dir.path());

    for result in [
        sup.start("ghost"),
        sup.stop("ghost"),
        sup.pause("ghost"),
        sup.resume("ghost"),
        sup.set_property("ghost", "command", "x"),
        sup.destroy("ghost"),
    ] {
        assert_eq!(result.expect_err("missing").kind(), ErrorKind::InvalidValue);
    }
}

#[test]
fn invalid_transitions_on_a_stopped_container() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sup = supervisor_in(dir.path());
    sup.create("e").expect("create");

    assert_eq!(
        sup.pause("e").expect_err("pause").kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        sup.resume("e").expect_err("resume").kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        sup.stop("e").expect_err("stop").kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(
        sup.get_data("e", "exit_status").expect_err("exit_status").kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(sup.get_data("e", "state").expect("state"), "stopped");
}

#[test]
fn root_rejects_properties_and_lifecycle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sup = supervisor_in(dir.path());

    assert_eq!(
        sup.set_property("ROOT", "command", "x").expect_err("set").kind(),
        ErrorKind::InvalidValue
    );
    assert_eq!(
        sup.get_property("ROOT", "command").expect_err("get").kind(),
        ErrorKind::InvalidValue
    );
    assert_eq!(
        sup.stop("ROOT").expect_err("stop").kind(),
        ErrorKind::InvalidValue
    );
    assert_eq!(
        sup.get_data("ROOT", "exit_status").expect_err("data").kind(),
        ErrorKind::InvalidData
    );
}

#[test]
fn failed_start_leaves_container_stopped_with_errno() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut sup = supervisor_in(dir.path());
    sup.create("a").expect("create");

    // Empty command is rejected up front.
    assert_eq!(
        sup.start("a").expect_err("empty command").kind(),
        ErrorKind::InvalidValue
    );
    assert_eq!(sup.get_data("a", "state").expect("state"), "stopped");

    // With a command set, launch fails at the cgroup join: the simulated
    // leaves have no tasks file. The errno survives as start_errno.
    sup.set_property("a", "command", "/bin/sleep 60")
        .expect("set");
    assert!(sup.start("a").is_err());
    assert_eq!(sup.get_data("a", "state").expect("state"), "stopped");
    let errno: i32 = sup
        .get_data("a", "start_errno")
        .expect("start_errno")
        .parse()
        .expect("numeric");
    assert_eq!(errno, libc::ENOENT);
}

#[test]
fn restart_restores_membership_and_properties() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut sup = supervisor_in(dir.path());
        sup.create("f").expect("create");
        sup.set_property("f", "command", "/bin/sleep 300")
            .expect("set");
    }

    let mut sup = supervisor_in(dir.path());
    assert_eq!(sup.list(), vec!["ROOT", "f"]);
    assert_eq!(sup.get_data("f", "state").expect("state"), "stopped");
    assert_eq!(
        sup.get_property("f", "command").expect("command"),
        "/bin/sleep 300"
    );
}

#[test]
fn restart_reattaches_a_live_root_pid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let own_pid = std::process::id().to_string();
    {
        // A record as the daemon would have left it right after a
        // successful start, with the test process standing in for the
        // container task.
        let _ = supervisor_in(dir.path());
        let store =
            FileStore::open(dir.path().join("state")).expect("store");
        let mut record = Record::new();
        let _ = record.insert("command".into(), "/bin/sleep 300".into());
        let _ = record.insert(ROOT_PID_KEY.into(), own_pid.clone());
        store.save("f", &record).expect("seed record");
    }

    let mut sup = supervisor_in(dir.path());
    assert_eq!(sup.get_data("f", "state").expect("state"), "running");
    assert_eq!(sup.get_data("f", "root_pid").expect("root_pid"), own_pid);

    // The start acknowledged before the crash is replayed exactly once.
    sup.start("f").expect("first start succeeds without action");
    assert_eq!(
        sup.start("f").expect_err("second start").kind(),
        ErrorKind::InvalidState
    );
}

#[test]
fn restart_with_dead_pid_keeps_container_stopped() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let _ = supervisor_in(dir.path());
        let store = FileStore::open(dir.path().join("state")).expect("store");
        let mut record = Record::new();
        let _ = record.insert("command".into(), "/bin/sleep 300".into());
        let _ = record.insert(ROOT_PID_KEY.into(), (i32::MAX - 1).to_string());
        store.save("crashed", &record).expect("seed record");
    }

    let mut sup = supervisor_in(dir.path());
    assert_eq!(sup.list(), vec!["ROOT", "crashed"]);
    assert_eq!(sup.get_data("crashed", "state").expect("state"), "stopped");
}

#[test]
fn static_properties_cannot_change_while_restored_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let own_pid = std::process::id().to_string();
    {
        let _ = supervisor_in(dir.path());
        let store = FileStore::open(dir.path().join("state")).expect("store");
        let mut record = Record::new();
        let _ = record.insert("command".into(), "/bin/sleep 300".into());
        let _ = record.insert(ROOT_PID_KEY.into(), own_pid);
        store.save("f", &record).expect("seed record");
    }

    let mut sup = supervisor_in(dir.path());
    assert_eq!(sup.get_data("f", "state").expect("state"), "running");
    assert_eq!(
        sup.set_property("f", "command", "/bin/true")
            .expect_err("static set")
            .kind(),
        ErrorKind::InvalidValue
    );
    assert_eq!(
        sup.get_property("f", "command").expect("unchanged"),
        "/bin/sleep 300"
    );
}
