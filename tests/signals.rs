//! Signal delivery end to end: custom, default and ignored handlers on a
//! real process, and cleanup when a handler exits the process.

mod common;

use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use common::{PROBE, SETTLE, Scratch, lines, wait_for, wait_for_value};
use forkish::Signal;
use forkish::pidfile;

fn start_probe(args: &[&str], ready: &Path) -> Child {
    let child = Command::new(PROBE)
        .args(args)
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .spawn()
        .expect("failed to start probe");
    assert!(wait_for(SETTLE, || ready.exists()), "handler never started");
    child
}

/// Waits until the PID file names a process other than `previous`.
fn next_target(pid_file: &Path, previous: Option<u32>) -> u32 {
    wait_for_value(SETTLE, || {
        pidfile::read_pid(pid_file)
            .ok()
            .filter(|pid| Some(*pid) != previous)
    })
    .expect("no signal target recorded")
}

fn round_trip(delivery: &str, sentinel_per_signal: bool) {
    let scratch = Scratch::new();
    let pid_file = scratch.path("app.pid");
    let log = scratch.path("signals.log");
    let ready = scratch.path("ready");

    let mut child = start_probe(
        &[
            "signals",
            "--pid-file",
            pid_file.to_str().unwrap(),
            "--log",
            log.to_str().unwrap(),
            "--ready",
            ready.to_str().unwrap(),
            "--delivery",
            delivery,
        ],
        &ready,
    );

    let mut previous = None;
    for (sent, signal) in Signal::ALL.into_iter().enumerate() {
        let target = next_target(&pid_file, previous);
        if sentinel_per_signal {
            previous = Some(target);
        }

        pidfile::send(&pid_file, signal).unwrap();
        assert!(
            wait_for(SETTLE, || lines(&log).len() == sent + 1),
            "{signal:?} was not handled"
        );
    }

    let status = child.wait().unwrap();
    assert!(status.success());
    assert_eq!(lines(&log), vec!["INT", "TERM", "ABRT"]);
    assert_eq!(pidfile::read_pid(&pid_file).unwrap(), child.id());
}

#[cfg(unix)]
#[test]
fn native_handlers_run_once_per_signal() {
    round_trip("native", false);
}

#[test]
fn emulated_handlers_run_once_per_signal() {
    round_trip("emulated", true);
}

fn default_handler_wakes_the_main_thread(delivery: &str, sentinel_per_signal: bool) {
    let scratch = Scratch::new();
    let pid_file = scratch.path("app.pid");
    let log = scratch.path("received.log");
    let ready = scratch.path("ready");

    let mut child = start_probe(
        &[
            "await-term",
            "--pid-file",
            pid_file.to_str().unwrap(),
            "--log",
            log.to_str().unwrap(),
            "--ready",
            ready.to_str().unwrap(),
            "--delivery",
            delivery,
        ],
        &ready,
    );

    let first = next_target(&pid_file, None);
    pidfile::send(&pid_file, Signal::Abrt).unwrap();
    if sentinel_per_signal {
        next_target(&pid_file, Some(first));
    } else {
        thread::sleep(Duration::from_millis(300));
    }
    assert!(child.try_wait().unwrap().is_none(), "ignored ABRT ended the process");
    assert!(lines(&log).is_empty());

    pidfile::send(&pid_file, Signal::Term).unwrap();
    let status = child.wait().unwrap();
    assert!(status.success());
    assert_eq!(lines(&log), vec!["Term"]);
}

#[cfg(unix)]
#[test]
fn native_default_handler_raises_term_and_ignores_abrt() {
    default_handler_wakes_the_main_thread("native", false);
}

#[test]
fn emulated_default_handler_raises_term_and_ignores_abrt() {
    default_handler_wakes_the_main_thread("emulated", true);
}

#[test]
fn exiting_from_an_emulated_handler_runs_cleanup() {
    let scratch = Scratch::new();
    let pid_file = scratch.path("app.pid");
    let ready = scratch.path("ready");

    let mut child = start_probe(
        &[
            "exit-on-term",
            "--pid-file",
            pid_file.to_str().unwrap(),
            "--ready",
            ready.to_str().unwrap(),
        ],
        &ready,
    );

    next_target(&pid_file, None);
    pidfile::send(&pid_file, Signal::Term).unwrap();

    let exited = wait_for_value(SETTLE, || child.try_wait().unwrap());
    let Some(status) = exited else {
        let _ = child.kill();
        let _ = child.wait();
        panic!("process did not exit after its handler called exit");
    };
    assert!(status.success());
    assert!(!pid_file.exists());
}
