//! Standard stream redirection in a real process.
#![cfg(unix)]

mod common;

use std::fs;

use common::{Scratch, probe};

#[test]
fn distinct_targets_only_see_output_after_redirection() {
    let scratch = Scratch::new();
    let stdin = scratch.path("in");
    let stdout = scratch.path("out");
    let stderr = scratch.path("err");
    fs::write(&stdin, "hello\n").unwrap();

    probe()
        .arg("redirect")
        .arg("--stdin")
        .arg(&stdin)
        .arg("--stdout")
        .arg(&stdout)
        .arg("--stderr")
        .arg(&stderr)
        .assert()
        .success()
        .stdout("before\n");

    assert_eq!(fs::read_to_string(&stdout).unwrap(), "after:hello\n");
    assert_eq!(fs::read_to_string(&stderr).unwrap(), "err\n");
}

#[test]
fn shared_input_and_output_target() {
    let scratch = Scratch::new();
    let shared = scratch.path("shared");
    let stderr = scratch.path("err");
    fs::write(&shared, "hi\n").unwrap();

    probe()
        .arg("redirect")
        .arg("--stdin")
        .arg(&shared)
        .arg("--stdout")
        .arg(&shared)
        .arg("--stderr")
        .arg(&stderr)
        .assert()
        .success();

    assert_eq!(fs::read_to_string(&shared).unwrap(), "hi\nafter:hi\n");
}
