#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

pub const PROBE: &str = env!("CARGO_BIN_EXE_forkish-probe");

/// Generous bound for anything that involves another process.
pub const SETTLE: Duration = Duration::from_secs(10);

pub fn probe() -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::new(PROBE);
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Polls `probe` until it yields a value.
pub fn wait_for_value<T>(timeout: Duration, mut probe: impl FnMut() -> Option<T>) -> Option<T> {
    let mut value = None;
    wait_for(timeout, || {
        value = probe();
        value.is_some()
    });
    value
}

/// Scratch directory for one test.
pub struct Scratch {
    dir: TempDir,
}

impl Scratch {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// What the probe's daemon writes once it is running.
#[derive(Debug)]
pub struct DaemonRecord {
    pub token: String,
    pub pid: u32,
    pub cwd: PathBuf,
}

impl DaemonRecord {
    pub fn read(path: &Path) -> Self {
        let contents = fs::read_to_string(path).expect("daemon record missing");
        let mut lines = contents.lines();
        let token = lines.next().expect("token line").to_string();
        let pid = lines.next().expect("pid line").parse().expect("numeric pid");
        let cwd = PathBuf::from(lines.next().expect("cwd line"));
        Self { token, pid, cwd }
    }
}

pub fn lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .map(|contents| contents.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn same_dir(a: &Path, b: &Path) -> bool {
    fs::canonicalize(a).ok() == fs::canonicalize(b).ok()
}
