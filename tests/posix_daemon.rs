//! End-to-end tests for the double-fork engine.
#![cfg(unix)]

mod common;

use common::{DaemonRecord, SETTLE, Scratch, lines, probe, same_dir, wait_for};
use forkish::PidFile;
use forkish::pidfile;
use predicates::prelude::*;

#[test]
fn daemon_matches_pid_file_and_removes_it_on_exit() {
    let scratch = Scratch::new();
    let pid_file = scratch.path("app.pid");
    let result = scratch.path("result");

    probe()
        .arg("daemon")
        .arg("--pid-file")
        .arg(&pid_file)
        .arg("--result")
        .arg(&result)
        .arg("--workdir")
        .arg(scratch.root())
        .args(["--token", "posix", "--linger-ms", "1500"])
        .assert()
        .success();

    assert!(wait_for(SETTLE, || result.exists()), "daemon never reported");
    let record = DaemonRecord::read(&result);
    assert_eq!(record.token, "posix");
    assert_eq!(pidfile::read_pid(&pid_file).unwrap(), record.pid);
    assert!(same_dir(&record.cwd, scratch.root()));
    assert!(pidfile::ping(&pid_file));

    assert!(
        wait_for(SETTLE, || !pid_file.exists()),
        "PID file outlived the daemon"
    );
}

#[test]
fn held_pid_file_refuses_a_second_daemon() {
    let scratch = Scratch::new();
    let pid_file = scratch.path("app.pid");
    let _held = PidFile::acquire(&pid_file, false).unwrap();

    probe()
        .arg("daemon")
        .arg("--pid-file")
        .arg(&pid_file)
        .arg("--result")
        .arg(scratch.path("result"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("already running"));

    assert!(pid_file.exists());
    assert!(!scratch.path("result").exists());
}

#[test]
fn daemon_output_goes_to_the_log() {
    let scratch = Scratch::new();
    let pid_file = scratch.path("app.pid");
    let result = scratch.path("result");
    let log = scratch.path("daemon.log");

    probe()
        .env("RUST_LOG", "debug")
        .arg("daemon")
        .arg("--pid-file")
        .arg(&pid_file)
        .arg("--result")
        .arg(&result)
        .arg("--log")
        .arg(&log)
        .args(["--linger-ms", "100"])
        .assert()
        .success();

    assert!(wait_for(SETTLE, || !pid_file.exists() && result.exists()));
    let written = std::fs::read_to_string(&log).unwrap();
    assert!(written.contains("redirected"), "log was: {written}");
}

#[test]
fn scoped_setup_runs_once() {
    let scratch = Scratch::new();
    let pid_file = scratch.path("app.pid");
    let result = scratch.path("result");
    let marker = scratch.path("setup");

    probe()
        .arg("daemon")
        .arg("--pid-file")
        .arg(&pid_file)
        .arg("--result")
        .arg(&result)
        .arg("--setup-marker")
        .arg(&marker)
        .args(["--token", "scoped", "--linger-ms", "100"])
        .assert()
        .success();

    assert!(wait_for(SETTLE, || result.exists()));
    assert_eq!(DaemonRecord::read(&result).token, "scoped");
    assert_eq!(lines(&marker), vec!["setup"]);
    assert!(wait_for(SETTLE, || !pid_file.exists()));
}
